//! Core types for the generation cache: request keys, stored responses and
//! the result of a routed request.

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::{CacheError, Result};

/// Normalized request descriptor used as the cache key.
///
/// Two requests share an entry only if method and URL (query included) are
/// identical after normalization. The fragment is never part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.into(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  /// Resolve `raw` (a path such as `/a.js` or an absolute URL) against `origin`.
  pub fn resolve(method: &str, raw: &str, origin: &Url) -> Result<Self> {
    let url = origin.join(raw).map_err(|e| CacheError::InvalidUrl {
      url: raw.to_string(),
      reason: e.to_string(),
    })?;
    Ok(Self::new(method, &url))
  }

  /// Only GET requests are ever looked up or stored.
  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  pub fn parsed_url(&self) -> Result<Url> {
    Url::parse(&self.url).map_err(|e| CacheError::InvalidUrl {
      url: self.url.clone(),
      reason: e.to_string(),
    })
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// How a response relates to the origin it was requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
  /// Same-origin response
  Basic,
  /// Cross-origin response the server explicitly shared
  Cors,
  /// Cross-origin response with no sharing headers
  Opaque,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseType::Basic => "basic",
      ResponseType::Cors => "cors",
      ResponseType::Opaque => "opaque",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(ResponseType::Basic),
      "cors" => Some(ResponseType::Cors),
      "opaque" => Some(ResponseType::Opaque),
      _ => None,
    }
  }
}

/// Snapshot of a response: status, headers and the full body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub response_type: ResponseType,
}

impl StoredResponse {
  /// Only successful same-origin responses may enter a generation.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.response_type == ResponseType::Basic
  }

  /// Any 2xx status. Manifest population requires this for every entry.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A stored response together with the time it was written.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: StoredResponse,
  pub cached_at: DateTime<Utc>,
}

/// Metadata about a generation held by the storage backend.
#[derive(Debug, Clone)]
pub struct GenerationInfo {
  pub name: String,
  /// Digest of the manifest the generation was populated from
  pub digest: Option<String>,
  /// Whether population completed and the generation may become active
  pub ready: bool,
  pub active: bool,
  pub created_at: DateTime<Utc>,
  pub entries: usize,
}

/// Result of a routed request, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Network response that bypassed the cache entirely.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }
}

/// Indicates where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Served from the active generation, no network access
  Cache,
  /// Cache miss, fetched from network
  Network,
  /// Not eligible for caching (non-GET, uncontrolled client), sent to network
  Passthrough,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      CacheSource::Cache => "cache",
      CacheSource::Network => "network",
      CacheSource::Passthrough => "passthrough",
    };
    f.write_str(s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("http://localhost:5173").unwrap()
  }

  fn response(status: u16, response_type: ResponseType) -> StoredResponse {
    StoredResponse {
      url: "http://localhost:5173/a.js".to_string(),
      status,
      headers: vec![("Content-Type".to_string(), "text/javascript".to_string())],
      body: b"console.log(1)".to_vec(),
      response_type,
    }
  }

  #[test]
  fn test_relative_and_absolute_resolve_to_same_key() {
    let a = RequestKey::resolve("get", "/a.js", &origin()).unwrap();
    let b = RequestKey::resolve("GET", "http://localhost:5173/a.js", &origin()).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.url, "http://localhost:5173/a.js");
  }

  #[test]
  fn test_query_is_part_of_key_but_fragment_is_not() {
    let plain = RequestKey::resolve("GET", "/a.js", &origin()).unwrap();
    let query = RequestKey::resolve("GET", "/a.js?v=2", &origin()).unwrap();
    let fragment = RequestKey::resolve("GET", "/a.js#top", &origin()).unwrap();
    assert_ne!(plain, query);
    assert_eq!(plain, fragment);
  }

  #[test]
  fn test_root_resolves_with_trailing_slash() {
    let key = RequestKey::resolve("GET", "/", &origin()).unwrap();
    assert_eq!(key.url, "http://localhost:5173/");
    assert!(key.is_get());
  }

  #[test]
  fn test_cacheable_policy() {
    assert!(response(200, ResponseType::Basic).is_cacheable());
    assert!(!response(404, ResponseType::Basic).is_cacheable());
    assert!(!response(204, ResponseType::Basic).is_cacheable());
    assert!(!response(301, ResponseType::Basic).is_cacheable());
    assert!(!response(200, ResponseType::Opaque).is_cacheable());
    assert!(!response(200, ResponseType::Cors).is_cacheable());
  }

  #[test]
  fn test_response_type_text_form() {
    for t in [ResponseType::Basic, ResponseType::Cors, ResponseType::Opaque] {
      assert_eq!(ResponseType::parse(t.as_str()), Some(t));
    }
    assert_eq!(ResponseType::parse("Basic"), None);
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let r = response(200, ResponseType::Basic);
    assert_eq!(r.header("content-type"), Some("text/javascript"));
    assert_eq!(r.header("etag"), None);
  }
}
