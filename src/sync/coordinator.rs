//! Periodic batch refresh of visible, stale entities.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{RefreshConfigPatch, SharedConfig};
use super::freshness::RefreshService;
use super::signals::{AuthSnapshot, AuthState, PageVisibility};
use super::subscriptions::SubscriptionRegistry;
use crate::cache::EntityKind;
use crate::remote::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
  /// Not started, or stopped
  Stopped,
  /// Started, but a gate (auth, profile, visibility) is closed
  Idle,
  /// A refresh tick is scheduled
  Ticking,
}

/// Handle on the task that runs ticks.
///
/// The task is never aborted: waking it cuts its sleep short, after which it
/// either restarts the sleep with the current interval or, once it is no
/// longer the current timer, exits. A tick in progress always completes.
struct Timer {
  generation: u64,
  wake: Arc<Notify>,
}

impl Timer {
  fn retire(self) {
    self.wake.notify_one();
  }
}

#[derive(Default)]
struct Lifecycle {
  is_started: bool,
  current_route: Option<String>,
  timer: Option<Timer>,
  listener: Option<JoinHandle<()>>,
  next_generation: u64,
}

struct Inner {
  registry: SubscriptionRegistry,
  refresher: Arc<dyn RefreshService>,
  auth: AuthState,
  visibility: PageVisibility,
  config: SharedConfig,
  lifecycle: Mutex<Lifecycle>,
  /// Held for the duration of a tick
  tick_lock: tokio::sync::Mutex<()>,
}

/// Drives refresh ticks while the viewer is signed in, has a profile and
/// the client is visible.
///
/// Every tick sweeps the subscribed entities for staleness, then refreshes
/// at most one batch of posts and one batch of users. A failed batch stays
/// queued for the next tick. Ticks are never concurrent: the next one is
/// scheduled only after the previous one finished, and a tick that is
/// running when the gates close or the interval changes runs to the end.
pub struct BatchRefreshCoordinator {
  inner: Arc<Inner>,
}

impl BatchRefreshCoordinator {
  pub fn new(
    registry: SubscriptionRegistry,
    refresher: Arc<dyn RefreshService>,
    auth: AuthState,
    visibility: PageVisibility,
    config: SharedConfig,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        registry,
        refresher,
        auth,
        visibility,
        config,
        lifecycle: Mutex::default(),
        tick_lock: tokio::sync::Mutex::new(()),
      }),
    }
  }

  pub fn registry(&self) -> &SubscriptionRegistry {
    &self.inner.registry
  }

  /// Start following auth and visibility. Idempotent.
  ///
  /// Must be called inside a Tokio runtime.
  pub fn start(&self) {
    {
      let mut lifecycle = self.inner.lock();
      if !lifecycle.is_started {
        lifecycle.is_started = true;
        let inner = Arc::clone(&self.inner);
        let auth_rx = self.inner.auth.subscribe();
        let viewer_id = auth_rx.borrow().viewer_id.clone();
        let visibility_rx = self.inner.visibility.subscribe();
        lifecycle.listener = Some(tokio::spawn(inner.listen(auth_rx, visibility_rx, viewer_id)));
        info!("refresh coordinator started");
      }
    }
    self.inner.evaluate();
  }

  /// Stop ticking and drop every subscription.
  pub fn stop(&self) {
    self.inner.shutdown();
    self.inner.registry.reset();
    info!("refresh coordinator stopped");
  }

  /// Report the current route. Subscriptions are reset when it changes.
  pub fn set_route(&self, route: &str) {
    let changed = {
      let mut lifecycle = self.inner.lock();
      let previous = lifecycle.current_route.replace(route.to_string());
      matches!(previous, Some(previous) if previous != route)
    };

    if changed {
      debug!(route, "route changed, resetting subscriptions");
      self.inner.registry.reset();
    }
  }

  /// Update the config. A new interval applies from the next sleep; a sleep
  /// in progress is restarted with it.
  pub fn configure(&self, patch: RefreshConfigPatch) {
    let (before, after) = self.inner.config.update(&patch);
    if before.batch_interval_ms != after.batch_interval_ms {
      let lifecycle = self.inner.lock();
      if let Some(timer) = &lifecycle.timer {
        debug!(interval_ms = after.batch_interval_ms, "rescheduling refresh ticks");
        timer.wake.notify_one();
      }
    }
    self.inner.evaluate();
  }

  pub fn state(&self) -> CoordinatorState {
    let lifecycle = self.inner.lock();
    if !lifecycle.is_started {
      CoordinatorState::Stopped
    } else if lifecycle.timer.is_some() {
      CoordinatorState::Ticking
    } else {
      CoordinatorState::Idle
    }
  }

  /// Run one tick right away, regardless of the gates.
  ///
  /// Waits for a scheduled tick that is already running.
  pub async fn tick_now(&self) {
    let _running = self.inner.tick_lock.lock().await;
    self.inner.tick().await;
  }
}

impl Drop for BatchRefreshCoordinator {
  fn drop(&mut self) {
    // Spawned tasks hold the inner state; end them so it is released.
    self.inner.shutdown();
  }
}

impl Inner {
  fn lock(&self) -> MutexGuard<'_, Lifecycle> {
    self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn gates_open(&self) -> bool {
    let auth = self.auth.snapshot();
    auth.is_authenticated() && auth.has_profile && self.visibility.is_visible()
  }

  /// Start or stop the timer to match the gates.
  fn evaluate(self: &Arc<Self>) {
    let mut lifecycle = self.lock();
    let should_tick = lifecycle.is_started && self.gates_open();

    match (should_tick, lifecycle.timer.is_some()) {
      (true, false) => {
        debug!("refresh ticking resumed");
        self.schedule(&mut lifecycle);
      }
      (false, true) => {
        if let Some(timer) = lifecycle.timer.take() {
          timer.retire();
        }
        debug!("refresh ticking paused");
      }
      _ => {}
    }
  }

  /// Replace any current timer with a fresh one.
  fn schedule(self: &Arc<Self>, lifecycle: &mut Lifecycle) {
    if let Some(timer) = lifecycle.timer.take() {
      timer.retire();
    }

    lifecycle.next_generation += 1;
    let generation = lifecycle.next_generation;
    let wake = Arc::new(Notify::new());
    tokio::spawn(Arc::clone(self).run_ticks(generation, Arc::clone(&wake)));
    lifecycle.timer = Some(Timer { generation, wake });
  }

  fn shutdown(&self) {
    let mut lifecycle = self.lock();
    lifecycle.is_started = false;
    if let Some(timer) = lifecycle.timer.take() {
      timer.retire();
    }
    if let Some(listener) = lifecycle.listener.take() {
      listener.abort();
    }
  }

  fn is_current(&self, generation: u64) -> bool {
    let lifecycle = self.lock();
    lifecycle.timer.as_ref().map(|timer| timer.generation) == Some(generation)
  }

  /// Whether the timer of `generation` should schedule another tick.
  /// Clears the timer slot when it should not.
  fn keep_ticking(&self, generation: u64) -> bool {
    let mut lifecycle = self.lock();
    let current = lifecycle.timer.as_ref().map(|timer| timer.generation);
    if current != Some(generation) {
      // Retired, or superseded by a newer timer
      return false;
    }

    if lifecycle.is_started && self.gates_open() {
      return true;
    }

    lifecycle.timer = None;
    debug!("refresh ticking paused");
    false
  }

  async fn run_ticks(self: Arc<Self>, generation: u64, wake: Arc<Notify>) {
    loop {
      let interval = self.config.get().batch_interval();
      tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = wake.notified() => {
          if self.is_current(generation) {
            // Interval changed, sleep again with the new one
            continue;
          }
          return;
        }
      }

      {
        let _running = self.tick_lock.lock().await;
        if !self.is_current(generation) {
          return;
        }
        if AssertUnwindSafe(self.tick()).catch_unwind().await.is_err() {
          error!("refresh tick panicked");
        }
      }

      if !self.keep_ticking(generation) {
        return;
      }
    }
  }

  async fn listen(
    self: Arc<Self>,
    mut auth_rx: watch::Receiver<AuthSnapshot>,
    mut visibility_rx: watch::Receiver<bool>,
    mut viewer_id: Option<UserId>,
  ) {
    loop {
      tokio::select! {
        changed = auth_rx.changed() => {
          if changed.is_err() {
            return;
          }
          let current = auth_rx.borrow_and_update().viewer_id.clone();
          if current != viewer_id {
            // Subscriptions belong to the viewer that made them
            if viewer_id.is_some() {
              debug!("viewer changed, resetting subscriptions");
              self.registry.reset();
            }
            viewer_id = current;
          }
        }
        changed = visibility_rx.changed() => {
          if changed.is_err() {
            return;
          }
          visibility_rx.borrow_and_update();
        }
      }

      self.evaluate();
    }
  }

  async fn tick(&self) {
    self.registry.sweep_stale().await;

    let config = self.config.get();
    let viewer_id = self.auth.snapshot().viewer_id;

    let posts = self
      .registry
      .next_batch(EntityKind::Post, config.max_batch_size(EntityKind::Post));
    if !posts.is_empty() {
      match viewer_id.as_ref() {
        Some(viewer_id) => {
          let result = self
            .refresher
            .force_refresh_posts_by_ids(&posts, viewer_id)
            .await;
          self.settle_batch(EntityKind::Post, &posts, result.map(|ids| ids.len()));
        }
        None => debug!(count = posts.len(), "no viewer, skipping post batch"),
      }
    }

    let users = self
      .registry
      .next_batch(EntityKind::User, config.max_batch_size(EntityKind::User));
    if !users.is_empty() {
      let result = self
        .refresher
        .force_refresh_users_by_ids(&users, viewer_id.as_ref())
        .await;
      self.settle_batch(EntityKind::User, &users, result.map(|ids| ids.len()));
    }
  }

  /// A successful batch leaves the queue. Ids the remote omitted were not
  /// stamped, so the next sweep queues them again behind the others.
  fn settle_batch<E: std::fmt::Display>(
    &self,
    kind: EntityKind,
    batch: &[String],
    result: Result<usize, E>,
  ) {
    match result {
      Ok(refreshed) => {
        self.registry.dequeue(kind, batch);
        debug!(%kind, requested = batch.len(), refreshed, "refreshed batch");
      }
      Err(e) => {
        warn!(%kind, count = batch.len(), error = %e, "batch refresh failed, keeping it queued");
      }
    }
  }
}
