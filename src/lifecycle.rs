//! Install/activate state machine and the active generation pointer.
//!
//! One `Lifecycle` exists per client context. It is shared by handle with the
//! generation store (which reads the active pointer for lookups and writes)
//! and the router (which drives the transitions).
//!
//! ```text
//! uninstalled -> installing -> installed-waiting -> activating -> active
//!                    |                                              |
//!                    +--(failure)--> previous state                 |
//!                                                                   |
//!       active --(new generation installs)--> installing ...  <-----+
//! ```
//!
//! While a newer generation installs, the previous one stays active and
//! keeps serving requests.

use std::sync::RwLock;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
  Uninstalled,
  Installing(String),
  InstalledWaiting(String),
  Activating(String),
  Active(String),
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      LifecycleState::Uninstalled => write!(f, "uninstalled"),
      LifecycleState::Installing(name) => write!(f, "installing ({name})"),
      LifecycleState::InstalledWaiting(name) => write!(f, "installed-waiting ({name})"),
      LifecycleState::Activating(name) => write!(f, "activating ({name})"),
      LifecycleState::Active(name) => write!(f, "active ({name})"),
    }
  }
}

#[derive(Debug)]
struct Inner {
  state: LifecycleState,
  /// Generation currently serving requests
  active: Option<String>,
}

#[derive(Debug)]
pub struct Lifecycle {
  inner: RwLock<Inner>,
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      inner: RwLock::new(Inner {
        state: LifecycleState::Uninstalled,
        active: None,
      }),
    }
  }

  /// Resume with `active` already serving (e.g. restored from storage).
  pub fn restored(active: Option<String>) -> Self {
    let state = match &active {
      Some(name) => LifecycleState::Active(name.clone()),
      None => LifecycleState::Uninstalled,
    };
    Self {
      inner: RwLock::new(Inner { state, active }),
    }
  }

  fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
    // State is replaced wholesale, so a poisoned lock still holds a valid value
    self.inner.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
    self.inner.write().unwrap_or_else(|e| e.into_inner())
  }

  pub fn state(&self) -> LifecycleState {
    self.read().state.clone()
  }

  /// The active generation pointer.
  pub fn active(&self) -> Option<String> {
    self.read().active.clone()
  }

  /// Start installing `generation`. Only one installer may run at a time.
  pub fn begin_install(&self, generation: &str) -> Result<()> {
    let mut inner = self.write();
    match &inner.state {
      LifecycleState::Installing(name) | LifecycleState::Activating(name) => {
        Err(CacheError::InstallInProgress(name.clone()))
      }
      // A waiting generation that never activated is superseded
      LifecycleState::Uninstalled
      | LifecycleState::InstalledWaiting(_)
      | LifecycleState::Active(_) => {
        inner.state = LifecycleState::Installing(generation.to_string());
        Ok(())
      }
    }
  }

  pub fn install_succeeded(&self, generation: &str) -> Result<()> {
    let mut inner = self.write();
    match &inner.state {
      LifecycleState::Installing(name) if name == generation => {
        inner.state = LifecycleState::InstalledWaiting(generation.to_string());
        Ok(())
      }
      _ => Err(CacheError::NotReady(generation.to_string())),
    }
  }

  /// Abandon the install. The previously active generation (if any) keeps serving.
  pub fn install_failed(&self, generation: &str) {
    let mut inner = self.write();
    if matches!(&inner.state, LifecycleState::Installing(name) if name == generation) {
      inner.state = match &inner.active {
        Some(active) => LifecycleState::Active(active.clone()),
        None => LifecycleState::Uninstalled,
      };
    }
  }

  /// Move the waiting generation to activating and return its name.
  ///
  /// With nothing waiting, an already active generation may re-run activation.
  pub fn begin_activate(&self) -> Result<String> {
    let mut inner = self.write();
    let name = match &inner.state {
      LifecycleState::InstalledWaiting(name) | LifecycleState::Active(name) => name.clone(),
      LifecycleState::Installing(name) | LifecycleState::Activating(name) => {
        return Err(CacheError::NotReady(name.clone()))
      }
      LifecycleState::Uninstalled => return Err(CacheError::NoActiveGeneration),
    };
    inner.state = LifecycleState::Activating(name.clone());
    Ok(name)
  }

  /// Flip the active pointer to the activating generation.
  pub fn finish_activate(&self, generation: &str) -> Result<()> {
    let mut inner = self.write();
    match &inner.state {
      LifecycleState::Activating(name) if name == generation => {
        inner.active = Some(generation.to_string());
        inner.state = LifecycleState::Active(generation.to_string());
        Ok(())
      }
      _ => Err(CacheError::NotReady(generation.to_string())),
    }
  }

  /// Return to the last stable state after activation could not complete.
  pub fn activate_failed(&self, generation: &str) {
    let mut inner = self.write();
    if matches!(&inner.state, LifecycleState::Activating(name) if name == generation) {
      inner.state = match &inner.active {
        Some(active) if active == generation => LifecycleState::Active(active.clone()),
        _ => LifecycleState::InstalledWaiting(generation.to_string()),
      };
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_full_cycle() {
    let lifecycle = Lifecycle::new();
    assert_eq!(lifecycle.state(), LifecycleState::Uninstalled);
    assert_eq!(lifecycle.active(), None);

    lifecycle.begin_install("v1").unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Installing("v1".into()));

    lifecycle.install_succeeded("v1").unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::InstalledWaiting("v1".into()));
    assert_eq!(lifecycle.active(), None);

    assert_eq!(lifecycle.begin_activate().unwrap(), "v1");
    assert_eq!(lifecycle.active(), None);

    lifecycle.finish_activate("v1").unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Active("v1".into()));
    assert_eq!(lifecycle.active().as_deref(), Some("v1"));
  }

  #[test]
  fn test_only_one_installer() {
    let lifecycle = Lifecycle::new();
    lifecycle.begin_install("v1").unwrap();
    assert!(matches!(
      lifecycle.begin_install("v2"),
      Err(CacheError::InstallInProgress(name)) if name == "v1"
    ));
  }

  #[test]
  fn test_failed_install_returns_to_uninstalled() {
    let lifecycle = Lifecycle::new();
    lifecycle.begin_install("v1").unwrap();
    lifecycle.install_failed("v1");
    assert_eq!(lifecycle.state(), LifecycleState::Uninstalled);

    // Eligible for retry
    lifecycle.begin_install("v1").unwrap();
    lifecycle.install_succeeded("v1").unwrap();
  }

  #[test]
  fn test_old_generation_serves_while_new_installs() {
    let lifecycle = Lifecycle::restored(Some("v1".into()));
    lifecycle.begin_install("v2").unwrap();
    assert_eq!(lifecycle.active().as_deref(), Some("v1"));

    lifecycle.install_failed("v2");
    assert_eq!(lifecycle.state(), LifecycleState::Active("v1".into()));
    assert_eq!(lifecycle.active().as_deref(), Some("v1"));
  }

  #[test]
  fn test_cannot_activate_while_installing() {
    let lifecycle = Lifecycle::new();
    assert!(matches!(
      lifecycle.begin_activate(),
      Err(CacheError::NoActiveGeneration)
    ));

    lifecycle.begin_install("v1").unwrap();
    assert!(matches!(
      lifecycle.begin_activate(),
      Err(CacheError::NotReady(_))
    ));
  }

  #[test]
  fn test_reactivate_current_generation() {
    let lifecycle = Lifecycle::restored(Some("v1".into()));
    assert_eq!(lifecycle.begin_activate().unwrap(), "v1");
    lifecycle.activate_failed("v1");
    assert_eq!(lifecycle.state(), LifecycleState::Active("v1".into()));
  }

  #[test]
  fn test_finish_activate_requires_matching_generation() {
    let lifecycle = Lifecycle::new();
    lifecycle.begin_install("v1").unwrap();
    lifecycle.install_succeeded("v1").unwrap();
    lifecycle.begin_activate().unwrap();
    assert!(lifecycle.finish_activate("v2").is_err());
    lifecycle.activate_failed("v1");
    assert_eq!(lifecycle.state(), LifecycleState::InstalledWaiting("v1".into()));
  }
}
