//! Interception router: cache-first request handling and the install /
//! activate hooks that move the store between generations.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, CacheStorage, GenerationStore, RequestKey, StoredResponse};
use crate::clients::{ClientId, Clients};
use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::manifest::Manifest;
use crate::net::Fetcher;

/// An outgoing asset request as seen by the router.
#[derive(Debug, Clone)]
pub struct AssetRequest {
  pub key: RequestKey,
  /// Client that issued the request, if known
  pub client: Option<ClientId>,
}

impl AssetRequest {
  pub fn new(key: RequestKey) -> Self {
    Self { key, client: None }
  }

  pub fn from_client(mut self, client: ClientId) -> Self {
    self.client = Some(client);
    self
  }
}

/// Outcome of an activation.
#[derive(Debug, Clone, Default)]
pub struct ActivationReport {
  pub generation: String,
  /// Superseded generations that were removed
  pub deleted: Vec<String>,
  /// Superseded generations that could not be removed; swept on a later activation
  pub failed: Vec<String>,
  /// Number of open clients now controlled by `generation`
  pub claimed: usize,
}

pub struct Router<S: CacheStorage, F: Fetcher> {
  store: GenerationStore<S>,
  fetcher: Arc<F>,
  clients: Clients,
  /// Background writes of network responses into the cache
  pending: Mutex<JoinSet<()>>,
}

impl<S, F> Router<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  pub fn new(store: GenerationStore<S>, fetcher: Arc<F>) -> Self {
    Self {
      store,
      fetcher,
      clients: Clients::new(),
      pending: Mutex::new(JoinSet::new()),
    }
  }

  pub fn store(&self) -> &GenerationStore<S> {
    &self.store
  }

  pub fn lifecycle(&self) -> &Arc<Lifecycle> {
    self.store.lifecycle()
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  /// Build a request for `raw` (path or absolute URL) relative to the origin.
  pub fn request(&self, method: &str, raw: &str) -> Result<AssetRequest> {
    Ok(AssetRequest::new(RequestKey::resolve(
      method,
      raw,
      self.store.origin(),
    )?))
  }

  /// Register an open client. Controlled immediately if a generation is active.
  pub fn connect(&self) -> ClientId {
    self.clients.connect(self.lifecycle().active())
  }

  pub fn disconnect(&self, client: ClientId) {
    self.clients.disconnect(client);
  }

  /// Install hook: create and fully populate `generation` from `manifest`.
  ///
  /// On success the generation is waiting to activate. Waiting is always
  /// skipped, so the host is expected to call [`Router::on_activate`] right
  /// away (see [`Router::install_and_activate`]).
  pub async fn on_install(&self, generation: &str, manifest: &Manifest) -> Result<()> {
    let lifecycle = self.lifecycle();
    lifecycle.begin_install(generation)?;
    info!(generation, assets = manifest.len(), "installing generation");

    match self
      .store
      .create_and_populate(generation, manifest, self.fetcher.as_ref())
      .await
    {
      Ok(()) => {
        lifecycle.install_succeeded(generation)?;
        info!(generation, "installed, skipping wait");
        Ok(())
      }
      Err(e) => {
        lifecycle.install_failed(generation);
        warn!(generation, error = %e, "install failed");
        Err(e)
      }
    }
  }

  /// Activate hook: delete every other generation, flip the active pointer,
  /// then claim all open clients.
  pub async fn on_activate(&self) -> Result<ActivationReport> {
    let lifecycle = self.lifecycle();
    let generation = lifecycle.begin_activate()?;
    info!(generation = %generation, "activating generation");

    let names = match self.store.list_generations() {
      Ok(names) => names,
      Err(e) => {
        lifecycle.activate_failed(&generation);
        return Err(e);
      }
    };

    let mut report = ActivationReport {
      generation: generation.clone(),
      ..Default::default()
    };
    for name in names.into_iter().filter(|name| name != &generation) {
      match self.store.delete(&name) {
        Ok(_) => report.deleted.push(name),
        Err(e) => {
          warn!(generation = %name, error = %e, "failed to delete stale generation");
          report.failed.push(name);
        }
      }
    }

    if let Err(e) = self.store.storage().set_active(&generation) {
      lifecycle.activate_failed(&generation);
      return Err(e);
    }
    lifecycle.finish_activate(&generation)?;

    report.claimed = self.clients.claim(&generation);
    info!(
      generation = %generation,
      deleted = report.deleted.len(),
      claimed = report.claimed,
      "generation active"
    );
    Ok(report)
  }

  /// Install then immediately activate.
  pub async fn install_and_activate(
    &self,
    generation: &str,
    manifest: &Manifest,
  ) -> Result<ActivationReport> {
    self.on_install(generation, manifest).await?;
    self.on_activate().await
  }

  /// Request hook: cache first, network on miss.
  ///
  /// Cacheable network responses are written to the generation that was
  /// active when the request started, in the background; the response is
  /// returned without waiting for the write.
  pub async fn on_request(&self, request: &AssetRequest) -> Result<CacheResult<StoredResponse>> {
    let key = &request.key;

    if !key.is_get() {
      debug!(request = %key, "non-GET request, bypassing cache");
      return Ok(CacheResult::passthrough(self.fetcher.fetch(key).await?));
    }

    if let Some(client) = request.client {
      if self.clients.controller(client).is_none() {
        debug!(request = %key, %client, "uncontrolled client, bypassing cache");
        return Ok(CacheResult::passthrough(self.fetcher.fetch(key).await?));
      }
    }

    let active = self.lifecycle().active();
    if let Some(generation) = &active {
      match self.store.lookup_in(generation, key) {
        Ok(Some(entry)) => {
          debug!(request = %key, generation = %generation, "cache hit");
          return Ok(CacheResult::from_cache(entry.response, entry.cached_at));
        }
        Ok(None) => debug!(request = %key, generation = %generation, "cache miss"),
        Err(e) => warn!(request = %key, error = %e, "cache lookup failed, using network"),
      }
    }

    let response = self.fetcher.fetch(key).await?;

    if response.is_cacheable() {
      if let Some(generation) = active {
        self.spawn_put(generation, key.clone(), response.clone());
      }
    } else {
      debug!(
        request = %key,
        status = response.status,
        response_type = response.response_type.as_str(),
        "response not cacheable"
      );
    }

    Ok(CacheResult::from_network(response))
  }

  fn pending(&self) -> MutexGuard<'_, JoinSet<()>> {
    self.pending.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn spawn_put(&self, generation: String, key: RequestKey, response: StoredResponse) {
    let store = self.store.clone();
    let mut pending = self.pending();
    // Reap finished writes
    while pending.try_join_next().is_some() {}
    pending.spawn_blocking(move || match store.put_into(&generation, &key, &response) {
      Ok(()) => debug!(request = %key, generation = %generation, "cached network response"),
      Err(e) => warn!(request = %key, generation = %generation, error = %e, "cache write failed"),
    });
  }

  /// Wait for every background cache write started so far.
  pub async fn flush(&self) {
    let mut pending = std::mem::take(&mut *self.pending());
    while let Some(result) = pending.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "cache write task failed");
      }
    }
  }
}
