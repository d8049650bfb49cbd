//! Which entities are on screen, and which of them are waiting for a refresh.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{trace, warn};

use super::config::SharedConfig;
use super::freshness::StalenessCheck;
use crate::cache::EntityKind;

/// Insertion-ordered set; ids queued again go to the back.
#[derive(Debug, Default)]
struct PendingQueue {
  order: VecDeque<String>,
  members: HashSet<String>,
}

impl PendingQueue {
  fn insert(&mut self, id: String) {
    if self.members.insert(id.clone()) {
      self.order.push_back(id);
    }
  }

  fn remove(&mut self, id: &str) {
    if self.members.remove(id) {
      self.order.retain(|queued| queued != id);
    }
  }

  fn front(&self, max: usize) -> Vec<String> {
    self.order.iter().take(max).cloned().collect()
  }

  fn to_vec(&self) -> Vec<String> {
    self.order.iter().cloned().collect()
  }
}

#[derive(Debug, Default)]
struct Tracked {
  subscribed: BTreeSet<String>,
  /// Confirmed stale, waiting for the next batch
  queue: PendingQueue,
}

#[derive(Debug, Default)]
struct SubscriptionState {
  posts: Tracked,
  users: Tracked,
  /// A user stays subscribed while any visible element refers to them
  user_ref_count: HashMap<String, usize>,
}

impl SubscriptionState {
  fn tracked(&mut self, kind: EntityKind) -> &mut Tracked {
    match kind {
      EntityKind::Post => &mut self.posts,
      EntityKind::User => &mut self.users,
    }
  }
}

/// Ref-counted registry of visible posts and users plus their refresh queues.
///
/// All state changes happen under a short synchronous lock. The staleness
/// check triggered by a first subscription runs as a detached task and only
/// enqueues if the entity is still subscribed when it completes, so a
/// subscribe immediately followed by an unsubscribe leaves nothing behind.
///
/// Subscribing must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct SubscriptionRegistry {
  state: Arc<Mutex<SubscriptionState>>,
  checker: Arc<dyn StalenessCheck>,
  config: SharedConfig,
}

impl SubscriptionRegistry {
  pub fn new(checker: Arc<dyn StalenessCheck>, config: SharedConfig) -> Self {
    Self {
      state: Arc::default(),
      checker,
      config,
    }
  }

  fn lock(&self) -> MutexGuard<'_, SubscriptionState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn subscribe_post(&self, id: &str) {
    if !self.lock().posts.subscribed.insert(id.to_string()) {
      return;
    }
    self.spawn_staleness_check(EntityKind::Post, id.to_string());
  }

  pub fn unsubscribe_post(&self, id: &str) {
    let mut state = self.lock();
    state.posts.subscribed.remove(id);
    state.posts.queue.remove(id);
  }

  pub fn subscribe_user(&self, id: &str) {
    let first = {
      let mut state = self.lock();
      let count = state.user_ref_count.entry(id.to_string()).or_insert(0);
      *count += 1;
      if *count == 1 {
        state.users.subscribed.insert(id.to_string());
        true
      } else {
        false
      }
    };

    if first {
      self.spawn_staleness_check(EntityKind::User, id.to_string());
    }
  }

  pub fn unsubscribe_user(&self, id: &str) {
    let mut state = self.lock();
    let Some(count) = state.user_ref_count.get_mut(id) else {
      return;
    };

    *count -= 1;
    if *count == 0 {
      state.user_ref_count.remove(id);
      state.users.subscribed.remove(id);
      state.users.queue.remove(id);
    }
  }

  /// Drop every subscription and queued refresh.
  pub fn reset(&self) {
    *self.lock() = SubscriptionState::default();
  }

  pub fn is_subscribed(&self, kind: EntityKind, id: &str) -> bool {
    self.lock().tracked(kind).subscribed.contains(id)
  }

  pub fn user_ref_count(&self, id: &str) -> usize {
    self.lock().user_ref_count.get(id).copied().unwrap_or(0)
  }

  pub fn subscribed(&self, kind: EntityKind) -> Vec<String> {
    self.lock().tracked(kind).subscribed.iter().cloned().collect()
  }

  pub fn queued(&self, kind: EntityKind) -> Vec<String> {
    self.lock().tracked(kind).queue.to_vec()
  }

  /// Queue the ids that are still subscribed. Returns how many were queued.
  pub fn enqueue_if_subscribed(&self, kind: EntityKind, ids: Vec<String>) -> usize {
    let mut state = self.lock();
    let tracked = state.tracked(kind);
    let mut queued = 0;

    for id in ids {
      if tracked.subscribed.contains(&id) {
        tracked.queue.insert(id);
        queued += 1;
      }
    }

    queued
  }

  /// Up to `max` queued ids. They stay queued until [`dequeue`](Self::dequeue).
  pub fn next_batch(&self, kind: EntityKind, max: usize) -> Vec<String> {
    self.lock().tracked(kind).queue.front(max)
  }

  pub fn dequeue(&self, kind: EntityKind, ids: &[String]) {
    let mut state = self.lock();
    let tracked = state.tracked(kind);
    for id in ids {
      tracked.queue.remove(id);
    }
  }

  /// Check every subscribed entity and queue the stale ones.
  ///
  /// A failing check queues everything it was asked about.
  pub async fn sweep_stale(&self) {
    for kind in [EntityKind::Post, EntityKind::User] {
      let ids = self.subscribed(kind);
      if ids.is_empty() {
        continue;
      }

      let ttl = self.config.get().ttl(kind);
      let result = self.checker.find_stale_ids(kind, &ids, ttl).await;
      let stale = match result {
        Ok(stale) => stale,
        Err(e) => {
          warn!(%kind, count = ids.len(), error = %e, "staleness sweep failed, queueing all");
          ids
        }
      };

      self.enqueue_if_subscribed(kind, stale);
    }
  }

  fn spawn_staleness_check(&self, kind: EntityKind, id: String) {
    let registry = self.clone();
    let ttl = self.config.get().ttl(kind);

    tokio::spawn(async move {
      let ids = vec![id];
      let result = registry.checker.find_stale_ids(kind, &ids, ttl).await;
      let stale = match result {
        Ok(stale) => stale,
        Err(e) => {
          // Fail open: a refresh too many beats a stale entity on screen
          warn!(%kind, id = %ids[0], error = %e, "staleness check failed, queueing anyway");
          ids
        }
      };

      if registry.enqueue_if_subscribed(kind, stale) > 0 {
        trace!(%kind, "queued stale entity");
      }
    });
  }
}
