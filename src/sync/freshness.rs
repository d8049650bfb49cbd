//! Per-entity freshness stamps, staleness queries and forced refreshes.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{CacheStorage, Cacheable, EntityKind};
use crate::error::{CacheError, RefreshError, RemoteError};
use crate::remote::types::{Post, PostId, User, UserId};

/// Answers which entities need a refresh.
#[async_trait]
pub trait StalenessCheck: Send + Sync {
  /// Subset of `ids`, in order, not refreshed within `ttl`. Ids never
  /// refreshed are always included.
  async fn find_stale_ids(
    &self,
    kind: EntityKind,
    ids: &[String],
    ttl: Duration,
  ) -> Result<Vec<String>, CacheError>;
}

/// Re-fetches entity details and persists them.
#[async_trait]
pub trait RefreshService: Send + Sync {
  /// Returns the ids actually refreshed.
  async fn force_refresh_posts_by_ids(
    &self,
    ids: &[PostId],
    viewer_id: &UserId,
  ) -> Result<Vec<PostId>, RefreshError>;

  /// Returns the ids actually refreshed.
  async fn force_refresh_users_by_ids(
    &self,
    ids: &[UserId],
    viewer_id: Option<&UserId>,
  ) -> Result<Vec<UserId>, RefreshError>;
}

/// Remote source of full entity details.
#[async_trait]
pub trait EntitySource: Send + Sync {
  async fn fetch_posts_by_ids(&self, ids: &[PostId], viewer_id: &UserId)
    -> Result<Vec<Post>, RemoteError>;

  async fn fetch_users_by_ids(
    &self,
    ids: &[UserId],
    viewer_id: Option<&UserId>,
  ) -> Result<Vec<User>, RemoteError>;
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

/// Freshness index backed by the cache storage.
pub struct FreshnessIndex<S: CacheStorage> {
  storage: Arc<S>,
  remote: Arc<dyn EntitySource>,
}

impl<S: CacheStorage> FreshnessIndex<S> {
  pub fn new(storage: Arc<S>, remote: Arc<dyn EntitySource>) -> Self {
    Self { storage, remote }
  }

  /// Stamp `ids` as refreshed at `at_ms`.
  pub fn mark_refreshed(&self, kind: EntityKind, ids: &[String], at_ms: i64) -> Result<(), CacheError> {
    self.storage.stamp_updated(kind, ids, at_ms)
  }

  /// Persist what the remote returned and stamp only those ids.
  fn persist_refreshed<T: Cacheable>(
    &self,
    requested: &[String],
    fetched: Vec<T>,
  ) -> Result<Vec<String>, RefreshError> {
    let wanted: HashSet<&str> = requested.iter().map(String::as_str).collect();
    let entities: Vec<T> = fetched
      .into_iter()
      .filter(|entity| wanted.contains(entity.cache_key().as_str()))
      .collect();

    self.storage.store_entities(&entities)?;

    let refreshed: Vec<String> = entities.iter().map(|entity| entity.cache_key()).collect();
    self
      .storage
      .stamp_updated(T::entity_kind(), &refreshed, now_millis())?;

    if refreshed.len() < requested.len() {
      debug!(
        kind = %T::entity_kind(),
        requested = requested.len(),
        refreshed = refreshed.len(),
        "remote omitted some entities"
      );
    }

    Ok(refreshed)
  }
}

#[async_trait]
impl<S: CacheStorage + 'static> StalenessCheck for FreshnessIndex<S> {
  async fn find_stale_ids(
    &self,
    kind: EntityKind,
    ids: &[String],
    ttl: Duration,
  ) -> Result<Vec<String>, CacheError> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    let stamps = self.storage.last_updated(kind, ids)?;
    let now = now_millis();
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

    Ok(
      ids
        .iter()
        .filter(|id| match stamps.get(id.as_str()) {
          Some(at) => now.saturating_sub(*at) > ttl_ms,
          None => true,
        })
        .cloned()
        .collect(),
    )
  }
}

#[async_trait]
impl<S: CacheStorage + 'static> RefreshService for FreshnessIndex<S> {
  async fn force_refresh_posts_by_ids(
    &self,
    ids: &[PostId],
    viewer_id: &UserId,
  ) -> Result<Vec<PostId>, RefreshError> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let posts = self.remote.fetch_posts_by_ids(ids, viewer_id).await?;
    self.persist_refreshed(ids, posts)
  }

  async fn force_refresh_users_by_ids(
    &self,
    ids: &[UserId],
    viewer_id: Option<&UserId>,
  ) -> Result<Vec<UserId>, RefreshError> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let users = self.remote.fetch_users_by_ids(ids, viewer_id).await?;
    self.persist_refreshed(ids, users)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::testing::FakeEntitySource;

  fn index(remote: Arc<FakeEntitySource>) -> (Arc<SqliteStorage>, FreshnessIndex<SqliteStorage>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    (Arc::clone(&storage), FreshnessIndex::new(storage, remote))
  }

  fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
  }

  #[tokio::test]
  async fn test_unknown_ids_are_stale() {
    let (_, index) = index(Arc::new(FakeEntitySource::default()));

    let stale = index
      .find_stale_ids(EntityKind::Post, &ids(&["a", "b"]), Duration::from_secs(60))
      .await
      .unwrap();

    assert_eq!(stale, ids(&["a", "b"]));
  }

  #[tokio::test]
  async fn test_ttl_decides_staleness() {
    let (_, index) = index(Arc::new(FakeEntitySource::default()));
    let now = now_millis();
    index
      .mark_refreshed(EntityKind::Post, &ids(&["fresh"]), now)
      .unwrap();
    index
      .mark_refreshed(EntityKind::Post, &ids(&["old"]), now - 10_000)
      .unwrap();

    let stale = index
      .find_stale_ids(
        EntityKind::Post,
        &ids(&["old", "fresh", "never"]),
        Duration::from_secs(5),
      )
      .await
      .unwrap();

    assert_eq!(stale, ids(&["old", "never"]));
  }

  #[tokio::test]
  async fn test_kinds_are_tracked_separately() {
    let (_, index) = index(Arc::new(FakeEntitySource::default()));
    index
      .mark_refreshed(EntityKind::User, &ids(&["x"]), now_millis())
      .unwrap();

    let stale = index
      .find_stale_ids(EntityKind::Post, &ids(&["x"]), Duration::from_secs(60))
      .await
      .unwrap();

    assert_eq!(stale, ids(&["x"]));
  }

  #[tokio::test]
  async fn test_force_refresh_stamps_only_returned_ids() {
    let remote = Arc::new(FakeEntitySource::knowing(&["p1", "p3"], &[]));
    let (storage, index) = index(Arc::clone(&remote));

    let refreshed = index
      .force_refresh_posts_by_ids(&ids(&["p1", "p2", "p3"]), &"viewer".to_string())
      .await
      .unwrap();

    assert_eq!(refreshed, ids(&["p1", "p3"]));
    assert!(storage.get_entity::<Post>("p1").unwrap().is_some());
    assert!(storage.get_entity::<Post>("p2").unwrap().is_none());

    let stale = index
      .find_stale_ids(EntityKind::Post, &ids(&["p1", "p2", "p3"]), Duration::from_secs(60))
      .await
      .unwrap();
    assert_eq!(stale, ids(&["p2"]));
  }

  #[tokio::test]
  async fn test_force_refresh_failure_stamps_nothing() {
    let remote = Arc::new(FakeEntitySource::failing());
    let (_, index) = index(remote);

    let err = index
      .force_refresh_users_by_ids(&ids(&["u1"]), None)
      .await
      .unwrap_err();
    assert!(matches!(err, RefreshError::Remote(_)));

    let stale = index
      .find_stale_ids(EntityKind::User, &ids(&["u1"]), Duration::from_secs(60))
      .await
      .unwrap();
    assert_eq!(stale, ids(&["u1"]));
  }

  #[tokio::test]
  async fn test_force_refresh_users_passes_viewer() {
    let remote = Arc::new(FakeEntitySource::knowing(&[], &["u1"]));
    let (_, index) = index(Arc::clone(&remote));
    let viewer = "me".to_string();

    let refreshed = index
      .force_refresh_users_by_ids(&ids(&["u1"]), Some(&viewer))
      .await
      .unwrap();

    assert_eq!(refreshed, ids(&["u1"]));
    assert_eq!(remote.user_viewers(), vec![Some("me".to_string())]);
  }
}
