use serde::Deserialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::cache::EntityKind;

/// Tuning of the background refresh.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
  /// Posts older than this are refreshed while visible
  pub post_ttl_ms: u64,
  /// Users older than this are refreshed while visible
  pub user_ttl_ms: u64,
  /// Pause between two refresh ticks
  pub batch_interval_ms: u64,
  pub post_max_batch_size: usize,
  pub user_max_batch_size: usize,
}

impl Default for RefreshConfig {
  fn default() -> Self {
    Self {
      post_ttl_ms: 60_000,
      user_ttl_ms: 300_000,
      batch_interval_ms: 2_000,
      post_max_batch_size: 25,
      user_max_batch_size: 25,
    }
  }
}

impl RefreshConfig {
  pub fn ttl(&self, kind: EntityKind) -> Duration {
    match kind {
      EntityKind::Post => Duration::from_millis(self.post_ttl_ms),
      EntityKind::User => Duration::from_millis(self.user_ttl_ms),
    }
  }

  pub fn max_batch_size(&self, kind: EntityKind) -> usize {
    match kind {
      EntityKind::Post => self.post_max_batch_size,
      EntityKind::User => self.user_max_batch_size,
    }
  }

  pub fn batch_interval(&self) -> Duration {
    Duration::from_millis(self.batch_interval_ms)
  }

  /// Apply the fields set in `patch`.
  pub fn merge(&mut self, patch: &RefreshConfigPatch) {
    if let Some(v) = patch.post_ttl_ms {
      self.post_ttl_ms = v;
    }
    if let Some(v) = patch.user_ttl_ms {
      self.user_ttl_ms = v;
    }
    if let Some(v) = patch.batch_interval_ms {
      self.batch_interval_ms = v;
    }
    if let Some(v) = patch.post_max_batch_size {
      self.post_max_batch_size = v;
    }
    if let Some(v) = patch.user_max_batch_size {
      self.user_max_batch_size = v;
    }
  }
}

/// Partial update of a [`RefreshConfig`]; unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshConfigPatch {
  pub post_ttl_ms: Option<u64>,
  pub user_ttl_ms: Option<u64>,
  pub batch_interval_ms: Option<u64>,
  pub post_max_batch_size: Option<usize>,
  pub user_max_batch_size: Option<usize>,
}

/// Config shared between the coordinator and the subscription registry.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig(Arc<RwLock<RefreshConfig>>);

impl SharedConfig {
  pub fn new(config: RefreshConfig) -> Self {
    Self(Arc::new(RwLock::new(config)))
  }

  pub fn get(&self) -> RefreshConfig {
    self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  /// Merge `patch`, returning the config before and after.
  pub fn update(&self, patch: &RefreshConfigPatch) -> (RefreshConfig, RefreshConfig) {
    let mut config = self.0.write().unwrap_or_else(PoisonError::into_inner);
    let before = config.clone();
    config.merge(patch);
    (before, config.clone())
  }
}
