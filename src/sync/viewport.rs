//! Translates per-element visibility into registry subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::subscriptions::SubscriptionRegistry;
use crate::remote::types::{PostId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Shown {
  post_id: PostId,
  author_id: UserId,
}

#[derive(Debug, Default)]
struct ViewportState {
  elements: HashMap<String, Shown>,
  /// Several elements may render the same post (a quote and its original)
  post_refs: HashMap<PostId, usize>,
}

/// Tracks which rendered elements are on screen.
///
/// A post is subscribed while at least one element shows it; its author
/// is subscribed once per such element.
#[derive(Clone)]
pub struct ViewportTracker {
  registry: SubscriptionRegistry,
  state: Arc<Mutex<ViewportState>>,
}

impl ViewportTracker {
  pub fn new(registry: SubscriptionRegistry) -> Self {
    Self {
      registry,
      state: Arc::default(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, ViewportState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Record that `element` (showing `post_id` by `author_id`) became
  /// visible or hidden. Repeating the current state does nothing.
  pub fn set_visible(&self, element: &str, post_id: &str, author_id: &str, visible: bool) {
    let shown = Shown {
      post_id: post_id.to_string(),
      author_id: author_id.to_string(),
    };

    let mut state = self.lock();
    match (visible, state.elements.get(element).cloned()) {
      (true, Some(current)) if current == shown => {}
      (true, current) => {
        // The element was recycled for another post
        if let Some(previous) = current {
          self.hide(&mut state, previous);
        }
        self.show(&mut state, element, shown);
      }
      (false, Some(_)) => {
        if let Some(previous) = state.elements.remove(element) {
          self.hide(&mut state, previous);
        }
      }
      (false, None) => {}
    }
  }

  /// Forget every element without touching the registry.
  ///
  /// Pair with [`SubscriptionRegistry::reset`].
  pub fn clear(&self) {
    *self.lock() = ViewportState::default();
  }

  pub fn visible_elements(&self) -> usize {
    self.lock().elements.len()
  }

  fn show(&self, state: &mut ViewportState, element: &str, shown: Shown) {
    let refs = state.post_refs.entry(shown.post_id.clone()).or_insert(0);
    *refs += 1;
    if *refs == 1 {
      self.registry.subscribe_post(&shown.post_id);
    }
    self.registry.subscribe_user(&shown.author_id);
    state.elements.insert(element.to_string(), shown);
  }

  fn hide(&self, state: &mut ViewportState, shown: Shown) {
    if let Some(refs) = state.post_refs.get_mut(&shown.post_id) {
      *refs -= 1;
      if *refs == 0 {
        state.post_refs.remove(&shown.post_id);
        self.registry.unsubscribe_post(&shown.post_id);
      }
    }
    self.registry.unsubscribe_user(&shown.author_id);
  }
}
