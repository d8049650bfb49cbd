//! Feed client that wraps the API client with the local-first cache.

use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{
  CacheStorage, Cursor, OrderedStreamStore, RemoteStreamSource, Slice, SliceRequest, SqliteStorage,
  StreamKey, StreamSliceFetcher,
};
use crate::error::{CacheError, FetchError, RefreshError};
use crate::sync::{EntitySource, FreshnessIndex, RefreshService};

use super::cache::FeedKey;
use super::client::ApiClient;
use super::types::{Post, PostId, PostRef, PostStream, User, UserId, UserRef, UserStream};

/// Feed client with transparent caching support.
///
/// Feed pages are served cache-first; entity details are read from the
/// cache and refreshed through the freshness index so every refresh is
/// stamped.
#[derive(Clone)]
pub struct FeedClient {
  storage: Arc<SqliteStorage>,
  posts: Arc<StreamSliceFetcher<PostStream, SqliteStorage>>,
  users: Arc<StreamSliceFetcher<UserStream, SqliteStorage>>,
  freshness: Arc<FreshnessIndex<SqliteStorage>>,
}

impl FeedClient {
  pub fn new(
    storage: Arc<SqliteStorage>,
    post_source: Arc<dyn RemoteStreamSource<PostStream>>,
    user_source: Arc<dyn RemoteStreamSource<UserStream>>,
    entity_source: Arc<dyn EntitySource>,
  ) -> Self {
    Self {
      posts: Arc::new(StreamSliceFetcher::new(Arc::clone(&storage), post_source)),
      users: Arc::new(StreamSliceFetcher::new(Arc::clone(&storage), user_source)),
      freshness: Arc::new(FreshnessIndex::new(Arc::clone(&storage), entity_source)),
      storage,
    }
  }

  /// Wire everything to one HTTP client.
  pub fn with_api(storage: Arc<SqliteStorage>, api: ApiClient) -> Self {
    let api = Arc::new(api);
    Self::new(storage, api.clone(), api.clone(), api)
  }

  /// Freshness index, shared with the refresh coordinator.
  pub fn freshness(&self) -> Arc<FreshnessIndex<SqliteStorage>> {
    Arc::clone(&self.freshness)
  }

  /// Get a page of a post feed.
  pub async fn post_feed(
    &self,
    feed: &FeedKey,
    limit: usize,
    cursor: Option<Cursor>,
  ) -> Result<Slice<PostRef>, FetchError> {
    self
      .posts
      .get_or_fetch_slice(SliceRequest {
        stream: feed,
        limit,
        cursor,
      })
      .await
  }

  /// Get a page of a user feed.
  pub async fn user_feed(
    &self,
    feed: &FeedKey,
    limit: usize,
    cursor: Option<Cursor>,
  ) -> Result<Slice<UserRef>, FetchError> {
    self
      .users
      .get_or_fetch_slice(SliceRequest {
        stream: feed,
        limit,
        cursor,
      })
      .await
  }

  /// Pull the newest posts of a feed into its head. Returns how many were new.
  pub async fn refresh_post_feed(&self, feed: &FeedKey, limit: usize) -> Result<usize, FetchError> {
    let added = self.posts.refresh_head(feed, limit).await?;
    debug!(feed = %feed.description(), added, "refreshed feed head");
    Ok(added)
  }

  /// Put a freshly created post at the head of a feed.
  pub fn prepend_posts(&self, feed: &FeedKey, posts: Vec<PostRef>) -> Result<(), CacheError> {
    self.post_streams().prepend_items(&feed.cache_hash(), posts)?;
    Ok(())
  }

  /// Drop posts from a feed (deleted, blocked author, ...).
  pub fn remove_posts(&self, feed: &FeedKey, ids: &[PostId]) -> Result<(), CacheError> {
    self.post_streams().remove_items(&feed.cache_hash(), ids)
  }

  /// Fetch and store details for posts the cache has never seen.
  pub async fn hydrate_posts(
    &self,
    ids: &[PostId],
    viewer_id: &UserId,
  ) -> Result<Vec<PostId>, RefreshError> {
    self.freshness.force_refresh_posts_by_ids(ids, viewer_id).await
  }

  /// Fetch and store details for users the cache has never seen.
  pub async fn hydrate_users(
    &self,
    ids: &[UserId],
    viewer_id: Option<&UserId>,
  ) -> Result<Vec<UserId>, RefreshError> {
    self.freshness.force_refresh_users_by_ids(ids, viewer_id).await
  }

  /// Get a cached post.
  pub fn get_post(&self, id: &str) -> Result<Option<Post>, CacheError> {
    Ok(self.storage.get_entity::<Post>(id)?.map(|cached| cached.entity))
  }

  /// Get a cached user.
  pub fn get_user(&self, id: &str) -> Result<Option<User>, CacheError> {
    Ok(self.storage.get_entity::<User>(id)?.map(|cached| cached.entity))
  }

  /// Wipe every feed, entity and freshness stamp (logout).
  pub fn clear(&self) -> Result<(), CacheError> {
    self.storage.clear_all()?;
    info!("local cache cleared");
    Ok(())
  }

  fn post_streams(&self) -> &OrderedStreamStore<PostStream, SqliteStorage> {
    self.posts.streams()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{FakeEntitySource, FakeStreamSource};

  fn client(streams: FakeStreamSource, entities: FakeEntitySource) -> FeedClient {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let streams = Arc::new(streams);
    FeedClient::new(storage, streams.clone(), streams, Arc::new(entities))
  }

  fn timeline() -> FeedKey {
    FeedKey::Timeline {
      viewer: "me".to_string(),
    }
  }

  #[tokio::test]
  async fn test_post_feed_then_hydrate_misses() {
    let client = client(
      FakeStreamSource::with_posts(5),
      FakeEntitySource::knowing(&["p0", "p1"], &[]),
    );

    let slice = client.post_feed(&timeline(), 2, None).await.unwrap();
    assert_eq!(slice.cache_miss_ids, vec!["p0".to_string(), "p1".to_string()]);

    let hydrated = client
      .hydrate_posts(&slice.cache_miss_ids, &"me".to_string())
      .await
      .unwrap();
    assert_eq!(hydrated.len(), 2);
    assert!(client.get_post("p0").unwrap().is_some());

    let again = client.post_feed(&timeline(), 2, None).await.unwrap();
    assert!(again.cache_miss_ids.is_empty());
  }

  #[tokio::test]
  async fn test_user_feed_uses_user_store() {
    let client = client(FakeStreamSource::with_posts(3), FakeEntitySource::default());
    let followers = FeedKey::Followers {
      user: "me".to_string(),
    };

    let slice = client.user_feed(&followers, 2, None).await.unwrap();

    let ids: Vec<&str> = slice.items.iter().map(|user| user.id.as_str()).collect();
    assert_eq!(ids, vec!["u0", "u1"]);
  }

  #[tokio::test]
  async fn test_prepend_and_remove_posts() {
    let client = client(FakeStreamSource::with_posts(3), FakeEntitySource::default());
    let feed = timeline();
    client.post_feed(&feed, 3, None).await.unwrap();

    client
      .prepend_posts(
        &feed,
        vec![PostRef {
          id: "mine".to_string(),
          author: "me".to_string(),
          created_at: FakeStreamSource::timestamp_of(0) + 1,
        }],
      )
      .unwrap();
    client.remove_posts(&feed, &["p1".to_string()]).unwrap();

    let slice = client.post_feed(&feed, 3, None).await.unwrap();
    let ids: Vec<&str> = slice.items.iter().map(|post| post.id.as_str()).collect();
    assert_eq!(ids, vec!["mine", "p0", "p2"]);
  }

  #[tokio::test]
  async fn test_clear_forgets_feeds_and_entities() {
    let client = client(
      FakeStreamSource::with_posts(3),
      FakeEntitySource::knowing(&["p0"], &[]),
    );
    let feed = timeline();
    client.post_feed(&feed, 2, None).await.unwrap();
    client
      .hydrate_posts(&["p0".to_string()], &"me".to_string())
      .await
      .unwrap();

    client.clear().unwrap();

    assert!(client.get_post("p0").unwrap().is_none());
    assert!(client
      .post_streams()
      .find_by_id(&feed.cache_hash())
      .unwrap()
      .is_none());
  }
}
