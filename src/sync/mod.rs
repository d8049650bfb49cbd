//! Keeps what is on screen fresh.
//!
//! Visible entities are subscribed in a [`SubscriptionRegistry`], checked
//! against their TTL through a [`StalenessCheck`], and refreshed in bounded
//! batches by the [`BatchRefreshCoordinator`] while the viewer is signed in
//! and the client is visible.

mod config;
mod coordinator;
mod freshness;
mod signals;
mod subscriptions;
mod viewport;

pub use config::{RefreshConfig, RefreshConfigPatch, SharedConfig};
pub use coordinator::{BatchRefreshCoordinator, CoordinatorState};
pub use freshness::{now_millis, EntitySource, FreshnessIndex, RefreshService, StalenessCheck};
pub use signals::{AuthSnapshot, AuthState, PageVisibility};
pub use subscriptions::SubscriptionRegistry;
pub use viewport::ViewportTracker;
