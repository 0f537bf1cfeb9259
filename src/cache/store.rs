//! Generation store: named cache generations on top of a storage backend.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::types::{CachedEntry, GenerationInfo, RequestKey, ResponseType, StoredResponse};
use crate::error::{CacheError, Result};
use crate::lifecycle::Lifecycle;
use crate::manifest::Manifest;
use crate::net::Fetcher;

/// Default number of manifest entries fetched at once during population.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Owns all generations and their entries.
///
/// Reads and writes without an explicit generation go to the active
/// generation named by the shared [`Lifecycle`].
pub struct GenerationStore<S: CacheStorage> {
  storage: Arc<S>,
  lifecycle: Arc<Lifecycle>,
  /// Origin that manifest paths are resolved against
  origin: Url,
  concurrency: usize,
}

impl<S: CacheStorage> GenerationStore<S> {
  pub fn new(storage: S, lifecycle: Arc<Lifecycle>, origin: Url) -> Self {
    Self {
      storage: Arc::new(storage),
      lifecycle,
      origin,
      concurrency: DEFAULT_CONCURRENCY,
    }
  }

  /// Set how many manifest entries are fetched concurrently.
  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  pub fn lifecycle(&self) -> &Arc<Lifecycle> {
    &self.lifecycle
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Allocate `name` and fill it with every manifest entry.
  ///
  /// All entries are fetched first (concurrently, manifest order kept), then
  /// written in one storage transaction, then the generation is marked
  /// ready. If any entry fails nothing is written; a generation allocated by
  /// this call is removed again. The active generation is only repopulated
  /// from the manifest it was built from.
  pub async fn create_and_populate<F>(&self, name: &str, manifest: &Manifest, fetcher: &F) -> Result<()>
  where
    F: Fetcher + ?Sized,
  {
    let keys = manifest
      .urls()
      .map(|url| RequestKey::resolve("GET", url, &self.origin))
      .collect::<Result<Vec<_>>>()?;
    let digest = manifest.digest();

    if let Some(existing) = self.storage.generation(name)? {
      if existing.ready && existing.digest.as_deref() != Some(digest.as_str()) {
        if self.lifecycle.active().as_deref() == Some(name) {
          warn!(generation = name, "manifest changed but the serving generation name was not bumped");
          return Err(CacheError::ActiveGenerationChanged(name.to_string()));
        }
        warn!(
          generation = name,
          "manifest changed but generation name was not bumped; entries will be overwritten"
        );
      }
    }

    let created = self.storage.create_generation(name)?;
    debug!(generation = name, created, entries = keys.len(), "populating generation");

    let results: Vec<(RequestKey, Result<StoredResponse>)> = stream::iter(keys)
      .map(|key| async move {
        let result = fetcher.fetch(&key).await;
        (key, result)
      })
      .buffered(self.concurrency)
      .collect()
      .await;

    let mut entries = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (key, result) in results {
      match result {
        Ok(response) if !response.is_ok() => {
          failures.push((key.url, format!("status {}", response.status)));
        }
        Ok(response) if response.response_type != ResponseType::Basic => {
          failures.push((
            key.url,
            format!("{} response", response.response_type.as_str()),
          ));
        }
        Ok(response) => entries.push((key, response)),
        Err(CacheError::Network { reason, .. }) => failures.push((key.url, reason)),
        Err(e) => failures.push((key.url, e.to_string())),
      }
    }

    if failures.is_empty() {
      let stored = self
        .storage
        .put_entries(name, &entries)
        .and_then(|()| self.storage.mark_ready(name, &digest));
      if let Err(e) = stored {
        failures.push((name.to_string(), e.to_string()));
      }
    }

    if !failures.is_empty() {
      if created {
        if let Err(e) = self.storage.delete_generation(name) {
          warn!(generation = name, error = %e, "failed to roll back partial generation");
        }
      }
      return Err(CacheError::Population {
        generation: name.to_string(),
        failures,
      });
    }

    info!(generation = name, entries = entries.len(), digest = %digest, "generation populated");
    Ok(())
  }

  /// Exact-match lookup in the active generation.
  pub fn lookup(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    match self.lifecycle.active() {
      Some(generation) => self.lookup_in(&generation, key),
      None => Ok(None),
    }
  }

  pub fn lookup_in(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.storage.get_entry(generation, key)
  }

  /// Store or overwrite an entry in the active generation.
  pub fn put(&self, key: &RequestKey, response: &StoredResponse) -> Result<()> {
    let generation = self.lifecycle.active().ok_or(CacheError::NoActiveGeneration)?;
    self.put_into(&generation, key, response)
  }

  pub fn put_into(&self, generation: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
    self
      .storage
      .put_entries(generation, &[(key.clone(), response.clone())])
  }

  /// Names of all generations in creation order.
  pub fn list_generations(&self) -> Result<Vec<String>> {
    Ok(self.storage.generations()?.into_iter().map(|g| g.name).collect())
  }

  pub fn generations(&self) -> Result<Vec<GenerationInfo>> {
    self.storage.generations()
  }

  /// Remove a generation and its entries. Deleting an absent generation is a no-op.
  pub fn delete(&self, name: &str) -> Result<bool> {
    let deleted = self.storage.delete_generation(name)?;
    if deleted {
      debug!(generation = name, "deleted generation");
    }
    Ok(deleted)
  }
}

impl<S: CacheStorage> Clone for GenerationStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      lifecycle: Arc::clone(&self.lifecycle),
      origin: self.origin.clone(),
      concurrency: self.concurrency,
    }
  }
}
