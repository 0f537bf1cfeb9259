//! Error types for the generation cache.

use std::fmt;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised by the cache, the router and their collaborators.
///
/// A cache miss is not an error: lookups return `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// One or more manifest entries could not be fetched or stored during install.
  #[error("failed to populate generation {generation}: {}", FailureList(.failures))]
  Population {
    generation: String,
    failures: Vec<(String, String)>,
  },

  /// Network fetch failed entirely (no response at all).
  #[error("network request for {url} failed: {reason}")]
  Network { url: String, reason: String },

  /// The storage backend rejected an operation.
  #[error("{context}: {reason}")]
  Storage { context: String, reason: String },

  #[error("no active generation")]
  NoActiveGeneration,

  /// Another install is already running in this context.
  #[error("generation {0} is already installing")]
  InstallInProgress(String),

  /// Activation requested for a generation that has not finished installing.
  #[error("generation {0} is not ready to activate")]
  NotReady(String),

  /// The active generation cannot be repopulated from a different manifest.
  #[error("generation {0} is serving; a changed manifest needs a new generation name")]
  ActiveGenerationChanged(String),

  #[error("invalid url {url}: {reason}")]
  InvalidUrl { url: String, reason: String },

  #[error("manifest error: {0}")]
  Manifest(String),

  #[error("config error: {0}")]
  Config(String),
}

impl CacheError {
  pub fn storage(context: impl Into<String>, err: impl fmt::Display) -> Self {
    Self::Storage {
      context: context.into(),
      reason: err.to_string(),
    }
  }

  pub fn network(url: impl Into<String>, err: impl fmt::Display) -> Self {
    Self::Network {
      url: url.into(),
      reason: err.to_string(),
    }
  }
}

struct FailureList<'a>(&'a [(String, String)]);

impl fmt::Display for FailureList<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, (url, reason)) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, "; ")?;
      }
      write!(f, "{url} ({reason})")?;
    }
    Ok(())
  }
}
