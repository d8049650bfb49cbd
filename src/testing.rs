//! In-process fakes shared by the unit tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::{EntityKind, RemoteStreamSource, StreamFetchParams};
use crate::error::{CacheError, RefreshError, RemoteError};
use crate::remote::cache::FeedKey;
use crate::remote::types::{Post, PostId, PostRef, PostStream, User, UserId, UserRef, UserStream};
use crate::sync::{EntitySource, RefreshService, StalenessCheck};

/// Let spawned tasks run to completion.
pub async fn settle() {
  for _ in 0..16 {
    tokio::task::yield_now().await;
  }
}

/// A remote stream of `n` entries, index 0 being the newest.
///
/// Serves post streams as `p{i}` by `author{i}` and user streams as `u{i}`,
/// both stamped with [`FakeStreamSource::timestamp_of`].
pub struct FakeStreamSource {
  len: usize,
  fail: bool,
  calls: Mutex<Vec<(Option<i64>, usize)>>,
}

impl FakeStreamSource {
  pub fn with_posts(len: usize) -> Self {
    Self {
      len,
      fail: false,
      calls: Mutex::default(),
    }
  }

  pub fn failing() -> Self {
    Self {
      fail: true,
      ..Self::with_posts(0)
    }
  }

  pub fn timestamp_of(index: usize) -> i64 {
    1_700_000_000_000 - (index as i64) * 1_000
  }

  /// `count` post refs starting at `offset`.
  pub fn page(&self, offset: usize, count: usize) -> Vec<PostRef> {
    (offset..self.len.min(offset + count)).map(post_ref).collect()
  }

  /// `(start, limit)` of every fetch, in order.
  pub fn calls(&self) -> Vec<(Option<i64>, usize)> {
    self.calls.lock().unwrap().clone()
  }

  fn matching(&self, params: &StreamFetchParams<'_, FeedKey>) -> Result<Vec<usize>, RemoteError> {
    self.calls.lock().unwrap().push((params.start, params.limit));
    if self.fail {
      return Err(RemoteError::Unavailable("remote is down".into()));
    }

    Ok(
      (0..self.len)
        .filter(|i| params.start.map_or(true, |start| Self::timestamp_of(*i) < start))
        .take(params.limit)
        .collect(),
    )
  }
}

fn post_ref(index: usize) -> PostRef {
  PostRef {
    id: format!("p{}", index),
    author: format!("author{}", index),
    created_at: FakeStreamSource::timestamp_of(index),
  }
}

#[async_trait]
impl RemoteStreamSource<PostStream> for FakeStreamSource {
  async fn fetch(&self, params: StreamFetchParams<'_, FeedKey>) -> Result<Vec<PostRef>, RemoteError> {
    Ok(self.matching(&params)?.into_iter().map(post_ref).collect())
  }
}

#[async_trait]
impl RemoteStreamSource<UserStream> for FakeStreamSource {
  async fn fetch(&self, params: StreamFetchParams<'_, FeedKey>) -> Result<Vec<UserRef>, RemoteError> {
    Ok(
      self
        .matching(&params)?
        .into_iter()
        .map(|i| UserRef {
          id: format!("u{}", i),
          listed_at: Self::timestamp_of(i),
        })
        .collect(),
    )
  }
}

/// Entity details for a fixed set of known ids.
#[derive(Default)]
pub struct FakeEntitySource {
  posts: HashSet<String>,
  users: HashSet<String>,
  fail: bool,
  user_viewers: Mutex<Vec<Option<String>>>,
}

impl FakeEntitySource {
  pub fn knowing(posts: &[&str], users: &[&str]) -> Self {
    Self {
      posts: posts.iter().map(|id| id.to_string()).collect(),
      users: users.iter().map(|id| id.to_string()).collect(),
      ..Self::default()
    }
  }

  pub fn failing() -> Self {
    Self {
      fail: true,
      ..Self::default()
    }
  }

  /// Viewer passed to each user fetch.
  pub fn user_viewers(&self) -> Vec<Option<String>> {
    self.user_viewers.lock().unwrap().clone()
  }
}

#[async_trait]
impl EntitySource for FakeEntitySource {
  async fn fetch_posts_by_ids(
    &self,
    ids: &[PostId],
    _viewer_id: &UserId,
  ) -> Result<Vec<Post>, RemoteError> {
    if self.fail {
      return Err(RemoteError::Unavailable("remote is down".into()));
    }
    Ok(
      ids
        .iter()
        .filter(|id| self.posts.contains(*id))
        .map(|id| Post {
          id: id.clone(),
          author: "someone".to_string(),
          created_at: 0,
          extra: serde_json::Map::new(),
        })
        .collect(),
    )
  }

  async fn fetch_users_by_ids(
    &self,
    ids: &[UserId],
    viewer_id: Option<&UserId>,
  ) -> Result<Vec<User>, RemoteError> {
    self.user_viewers.lock().unwrap().push(viewer_id.cloned());
    if self.fail {
      return Err(RemoteError::Unavailable("remote is down".into()));
    }
    Ok(
      ids
        .iter()
        .filter(|id| self.users.contains(*id))
        .map(|id| User {
          id: id.clone(),
          display_name: None,
          extra: serde_json::Map::new(),
        })
        .collect(),
    )
  }
}

/// Staleness check answering "everything" or "nothing".
pub struct FakeChecker {
  all_stale: AtomicBool,
  fail: AtomicBool,
  calls: AtomicUsize,
}

impl FakeChecker {
  pub fn all_stale() -> Self {
    Self {
      all_stale: AtomicBool::new(true),
      fail: AtomicBool::new(false),
      calls: AtomicUsize::new(0),
    }
  }

  pub fn none_stale() -> Self {
    Self {
      all_stale: AtomicBool::new(false),
      ..Self::all_stale()
    }
  }

  pub fn failing() -> Self {
    Self {
      fail: AtomicBool::new(true),
      ..Self::none_stale()
    }
  }

  pub fn set_all_stale(&self, stale: bool) {
    self.all_stale.store(stale, Ordering::SeqCst);
  }

  pub fn set_failing(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl StalenessCheck for FakeChecker {
  async fn find_stale_ids(
    &self,
    _kind: EntityKind,
    ids: &[String],
    _ttl: Duration,
  ) -> Result<Vec<String>, CacheError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.fail.load(Ordering::SeqCst) {
      return Err(CacheError::Read("database is locked".into()));
    }
    if self.all_stale.load(Ordering::SeqCst) {
      Ok(ids.to_vec())
    } else {
      Ok(Vec::new())
    }
  }
}

/// Refresh service recording every batch it is handed.
///
/// With a delay, each batch sleeps before answering; in-flight batches are
/// counted so tests can tell whether refreshes overlapped.
#[derive(Default)]
pub struct FakeRefresher {
  fail: bool,
  delay: Option<Duration>,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
  finished: AtomicUsize,
  post_calls: Mutex<Vec<(Vec<PostId>, UserId)>>,
  user_calls: Mutex<Vec<(Vec<UserId>, Option<UserId>)>>,
}

impl FakeRefresher {
  pub fn failing() -> Self {
    Self {
      fail: true,
      ..Self::default()
    }
  }

  pub fn slow(delay: Duration) -> Self {
    Self {
      delay: Some(delay),
      ..Self::default()
    }
  }

  pub fn post_calls(&self) -> Vec<(Vec<PostId>, UserId)> {
    self.post_calls.lock().unwrap().clone()
  }

  pub fn user_calls(&self) -> Vec<(Vec<UserId>, Option<UserId>)> {
    self.user_calls.lock().unwrap().clone()
  }

  /// Batches that ran to completion.
  pub fn finished(&self) -> usize {
    self.finished.load(Ordering::SeqCst)
  }

  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  async fn answer(&self, ids: &[String]) -> Result<Vec<String>, RefreshError> {
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    self.finished.fetch_add(1, Ordering::SeqCst);

    if self.fail {
      return Err(RemoteError::Unavailable("remote is down".into()).into());
    }
    Ok(ids.to_vec())
  }
}

#[async_trait]
impl RefreshService for FakeRefresher {
  async fn force_refresh_posts_by_ids(
    &self,
    ids: &[PostId],
    viewer_id: &UserId,
  ) -> Result<Vec<PostId>, RefreshError> {
    self
      .post_calls
      .lock()
      .unwrap()
      .push((ids.to_vec(), viewer_id.clone()));
    self.answer(ids).await
  }

  async fn force_refresh_users_by_ids(
    &self,
    ids: &[UserId],
    viewer_id: Option<&UserId>,
  ) -> Result<Vec<UserId>, RefreshError> {
    self
      .user_calls
      .lock()
      .unwrap()
      .push((ids.to_vec(), viewer_id.cloned()));
    self.answer(ids).await
  }
}
