//! Generation-based, cache-first asset cache.
//!
//! Static assets of a web application are pre-populated into a named
//! generation from a manifest, served from that generation without touching
//! the network, and replaced wholesale when a newer generation activates.
//! Requests that miss go to the network; successful same-origin responses
//! are added to the active generation in the background.

pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod manifest;
pub mod net;
pub mod router;

#[cfg(test)]
mod test_support;
