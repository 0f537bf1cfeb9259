//! Shared helpers for unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::cache::{RequestKey, ResponseType, StoredResponse};
use crate::error::{CacheError, Result};
use crate::net::Fetcher;

pub fn origin() -> Url {
  Url::parse("http://localhost:5173").unwrap()
}

/// Fetcher that counts calls and answers `"<version>:<path>"` bodies.
pub struct MockFetcher {
  calls: AtomicUsize,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
  offline: AtomicBool,
  version: Mutex<String>,
  failing: Mutex<HashSet<String>>,
  routes: Mutex<HashMap<String, (u16, ResponseType)>>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self {
      calls: AtomicUsize::new(0),
      in_flight: AtomicUsize::new(0),
      max_in_flight: AtomicUsize::new(0),
      offline: AtomicBool::new(false),
      version: Mutex::new("v1".to_string()),
      failing: Mutex::new(HashSet::new()),
      routes: Mutex::new(HashMap::new()),
    }
  }

  pub fn response_for(path: &str, version: &str) -> StoredResponse {
    let origin = origin();
    StoredResponse {
      url: origin.join(path).unwrap().into(),
      status: 200,
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body: format!("{version}:{path}").into_bytes(),
      response_type: ResponseType::Basic,
    }
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  pub fn set_version(&self, version: &str) {
    *self.version.lock().unwrap() = version.to_string();
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Make requests for `path` fail with a network error.
  pub fn fail(&self, path: &str) {
    self.failing.lock().unwrap().insert(path.to_string());
  }

  pub fn recover(&self, path: &str) {
    self.failing.lock().unwrap().remove(path);
  }

  pub fn respond(&self, path: &str, status: u16, response_type: ResponseType) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), (status, response_type));
  }
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, key: &RequestKey) -> Result<StoredResponse> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    tokio::task::yield_now().await;
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    let url = key.parsed_url()?;
    let path = url.path().to_string();
    if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&path) {
      return Err(CacheError::network(&key.url, "connection refused"));
    }

    let version = self.version.lock().unwrap().clone();
    let mut response = Self::response_for(&path, &version);
    response.url = key.url.clone();
    if let Some((status, response_type)) = self.routes.lock().unwrap().get(&path) {
      response.status = *status;
      response.response_type = *response_type;
    }
    if url.origin() != origin().origin() {
      response.response_type = ResponseType::Opaque;
    }
    Ok(response)
  }
}
