//! Registry of open client connections and the generation controlling each.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Identifier of an open client (a page, tab or session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl std::fmt::Display for ClientId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "client-{}", self.0)
  }
}

#[derive(Debug, Default)]
pub struct Clients {
  next_id: AtomicU64,
  /// Controlling generation per open client; `None` means uncontrolled
  open: Mutex<HashMap<ClientId, Option<String>>>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, Option<String>>> {
    self.open.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Register a client. It is controlled by `active` if a generation is serving.
  pub fn connect(&self, active: Option<String>) -> ClientId {
    let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self.lock().insert(id, active);
    id
  }

  pub fn disconnect(&self, id: ClientId) {
    self.lock().remove(&id);
  }

  /// Generation controlling `id`, or `None` if uncontrolled or unknown.
  pub fn controller(&self, id: ClientId) -> Option<String> {
    self.lock().get(&id).cloned().flatten()
  }

  pub fn is_open(&self, id: ClientId) -> bool {
    self.lock().contains_key(&id)
  }

  /// Put every open client under `generation`. Returns how many were claimed.
  pub fn claim(&self, generation: &str) -> usize {
    let mut open = self.lock();
    for controller in open.values_mut() {
      *controller = Some(generation.to_string());
    }
    open.len()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_connect_before_and_after_activation() {
    let clients = Clients::new();
    let early = clients.connect(None);
    let late = clients.connect(Some("v1".into()));

    assert_eq!(clients.controller(early), None);
    assert_eq!(clients.controller(late).as_deref(), Some("v1"));
    assert_ne!(early, late);
  }

  #[test]
  fn test_claim_takes_over_every_open_client() {
    let clients = Clients::new();
    let a = clients.connect(None);
    let b = clients.connect(Some("v1".into()));
    let c = clients.connect(None);
    clients.disconnect(c);

    assert_eq!(clients.claim("v2"), 2);
    assert_eq!(clients.controller(a).as_deref(), Some("v2"));
    assert_eq!(clients.controller(b).as_deref(), Some("v2"));
    assert!(!clients.is_open(c));
    assert_eq!(clients.controller(c), None);
    assert_eq!(clients.len(), 2);
    assert!(!clients.is_empty());
  }
}
