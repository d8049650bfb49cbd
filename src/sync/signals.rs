//! Observable host signals that gate background refresh.

use std::sync::Arc;
use tokio::sync::watch;

use crate::remote::types::UserId;

/// Who is signed in, as far as the refresh machinery cares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSnapshot {
  pub viewer_id: Option<UserId>,
  /// Signed-in accounts may still be missing a profile (onboarding)
  pub has_profile: bool,
}

impl AuthSnapshot {
  pub fn is_authenticated(&self) -> bool {
    self.viewer_id.is_some()
  }
}

/// Authentication state with change notification.
#[derive(Debug, Clone)]
pub struct AuthState {
  tx: Arc<watch::Sender<AuthSnapshot>>,
}

impl Default for AuthState {
  fn default() -> Self {
    Self::new()
  }
}

impl AuthState {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(AuthSnapshot::default());
    Self { tx: Arc::new(tx) }
  }

  pub fn sign_in(&self, viewer_id: impl Into<UserId>, has_profile: bool) {
    self.tx.send_replace(AuthSnapshot {
      viewer_id: Some(viewer_id.into()),
      has_profile,
    });
  }

  pub fn set_has_profile(&self, has_profile: bool) {
    self.tx.send_if_modified(|auth| {
      let changed = auth.has_profile != has_profile;
      auth.has_profile = has_profile;
      changed
    });
  }

  pub fn sign_out(&self) {
    self.tx.send_replace(AuthSnapshot::default());
  }

  pub fn snapshot(&self) -> AuthSnapshot {
    self.tx.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
    self.tx.subscribe()
  }
}

/// Whether the client is in the foreground.
#[derive(Debug, Clone)]
pub struct PageVisibility {
  tx: Arc<watch::Sender<bool>>,
}

impl Default for PageVisibility {
  fn default() -> Self {
    Self::new(true)
  }
}

impl PageVisibility {
  pub fn new(visible: bool) -> Self {
    let (tx, _rx) = watch::channel(visible);
    Self { tx: Arc::new(tx) }
  }

  pub fn set_visible(&self, visible: bool) {
    self.tx.send_if_modified(|current| {
      let changed = *current != visible;
      *current = visible;
      changed
    });
  }

  pub fn is_visible(&self) -> bool {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}
