//! Cache-first paginated reads over stream records.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::stream_store::{OrderedStreamStore, StreamRecord};
use super::traits::{
  Cursor, RemoteStreamSource, SliceSource, StreamFetchParams, StreamItem, StreamKey, StreamKind,
};
use crate::error::{CacheError, FetchError};

/// A page request against one stream.
#[derive(Debug)]
pub struct SliceRequest<'a, Q> {
  pub stream: &'a Q,
  pub limit: usize,
  /// Continue after this item; `None` loads the head of the stream
  pub cursor: Option<Cursor>,
}

/// One page of a stream.
#[derive(Debug, Clone)]
pub struct Slice<T> {
  pub items: Vec<T>,
  /// Where to continue from; `None` once the remote has no more items
  pub next_cursor: Option<Cursor>,
  /// Items of this page whose detail record is not cached yet
  pub cache_miss_ids: Vec<String>,
  pub source: SliceSource,
}

/// Serves stream pages from the local store, going to the network only for
/// what the store cannot answer.
///
/// 1. No cursor and a long enough record: return the cached head
/// 2. No cursor and no record: fetch the newest page, store it
/// 3. Cursor and a record: fetch past the cursor, append to the record
/// 4. Cursor but no record (local store wiped): behave like 2
///
/// Remote and read errors propagate. Write errors are logged; the page is
/// still returned and the next read persists again.
pub struct StreamSliceFetcher<K: StreamKind, S: CacheStorage> {
  storage: Arc<S>,
  streams: OrderedStreamStore<K, S>,
  remote: Arc<dyn RemoteStreamSource<K>>,
}

impl<K: StreamKind, S: CacheStorage> StreamSliceFetcher<K, S> {
  pub fn new(storage: Arc<S>, remote: Arc<dyn RemoteStreamSource<K>>) -> Self {
    Self {
      streams: OrderedStreamStore::new(Arc::clone(&storage)),
      storage,
      remote,
    }
  }

  /// The underlying stream store.
  pub fn streams(&self) -> &OrderedStreamStore<K, S> {
    &self.streams
  }

  pub async fn get_or_fetch_slice(
    &self,
    request: SliceRequest<'_, K::Key>,
  ) -> Result<Slice<K::Item>, FetchError> {
    let SliceRequest {
      stream,
      limit,
      cursor,
    } = request;

    if limit == 0 {
      return Ok(Slice {
        items: Vec::new(),
        next_cursor: cursor,
        cache_miss_ids: Vec::new(),
        source: SliceSource::Cache,
      });
    }

    let key = stream.cache_hash();
    let record = self.streams.find_by_id(&key)?;

    match (cursor, record) {
      (Some(cursor), Some(_)) => self.fetch_after(stream, &key, cursor, limit).await,
      (Some(cursor), None) => {
        debug!(
          stream = %stream.description(),
          cursor = %cursor.item_key,
          "no local record behind cursor, loading from the top"
        );
        self.initial_load(stream, &key, limit).await
      }
      (None, Some(StreamRecord { items, .. })) if items.len() >= limit => {
        let items: Vec<K::Item> = items.into_iter().take(limit).collect();
        let next_cursor = items.last().map(StreamItem::cursor);
        self.finish(items, next_cursor, SliceSource::Cache)
      }
      (None, Some(StreamRecord { items, .. })) if !items.is_empty() => {
        self.top_up(stream, &key, items, limit).await
      }
      (None, _) => self.initial_load(stream, &key, limit).await,
    }
  }

  /// Fetch the newest items and put the unseen ones at the head of the
  /// stream. Returns how many items were new.
  pub async fn refresh_head(&self, stream: &K::Key, limit: usize) -> Result<usize, FetchError> {
    let key = stream.cache_hash();
    let before = self
      .streams
      .find_by_id(&key)?
      .map(|record| record.items.len())
      .unwrap_or(0);

    let fetched = self
      .remote
      .fetch(StreamFetchParams {
        stream,
        start: None,
        limit,
      })
      .await?;

    let after = self.streams.prepend_items(&key, fetched)?.items.len();
    Ok(after.saturating_sub(before))
  }

  async fn initial_load(
    &self,
    stream: &K::Key,
    key: &str,
    limit: usize,
  ) -> Result<Slice<K::Item>, FetchError> {
    let fetched = self
      .remote
      .fetch(StreamFetchParams {
        stream,
        start: None,
        limit,
      })
      .await?;

    let exhausted = fetched.len() < limit;
    self.persist(key, self.streams.upsert(key, fetched.clone()));

    let next_cursor = cursor_unless(exhausted, &fetched);
    self.finish(fetched, next_cursor, SliceSource::Network)
  }

  async fn fetch_after(
    &self,
    stream: &K::Key,
    key: &str,
    cursor: Cursor,
    limit: usize,
  ) -> Result<Slice<K::Item>, FetchError> {
    let (fetched, exhausted) = self
      .fetch_page_after(stream, &cursor, limit, HashSet::new())
      .await?;

    self.persist(key, self.streams.append_items(key, fetched.clone()));

    let next_cursor = cursor_unless(exhausted, &fetched);
    self.finish(fetched, next_cursor, SliceSource::Network)
  }

  /// Cached head is shorter than the page; fetch the remainder.
  async fn top_up(
    &self,
    stream: &K::Key,
    key: &str,
    mut cached: Vec<K::Item>,
    limit: usize,
  ) -> Result<Slice<K::Item>, FetchError> {
    let Some(tail) = cached.last().map(StreamItem::cursor) else {
      return self.initial_load(stream, key, limit).await;
    };
    let known: HashSet<String> = cached.iter().map(StreamItem::item_key).collect();
    let shortfall = limit - cached.len();

    let (fetched, exhausted) = self.fetch_page_after(stream, &tail, shortfall, known).await?;

    if !fetched.is_empty() {
      self.persist(key, self.streams.append_items(key, fetched.clone()));
    }

    let source = if fetched.is_empty() {
      SliceSource::Cache
    } else {
      SliceSource::Mixed
    };
    cached.extend(fetched);

    let next_cursor = cursor_unless(exhausted, &cached);
    self.finish(cached, next_cursor, source)
  }

  /// Fetch up to `limit` items strictly past `cursor`, skipping `known`.
  /// Also reports whether the remote ran out of items.
  async fn fetch_page_after(
    &self,
    stream: &K::Key,
    cursor: &Cursor,
    limit: usize,
    mut known: HashSet<String>,
  ) -> Result<(Vec<K::Item>, bool), FetchError> {
    let raw = self
      .remote
      .fetch(StreamFetchParams {
        stream,
        start: Some(cursor.timestamp),
        limit,
      })
      .await?;

    let exhausted = raw.len() < limit;
    known.insert(cursor.item_key.clone());

    let fetched = raw
      .into_iter()
      .filter(|item| known.insert(item.item_key()))
      .collect();

    Ok((fetched, exhausted))
  }

  fn persist(&self, key: &str, result: Result<StreamRecord<K::Item>, CacheError>) {
    if let Err(e) = result {
      warn!(store = K::STORE, stream = key, error = %e, "failed to persist stream page");
    }
  }

  fn finish(
    &self,
    items: Vec<K::Item>,
    next_cursor: Option<Cursor>,
    source: SliceSource,
  ) -> Result<Slice<K::Item>, FetchError> {
    let ids: Vec<String> = items.iter().map(StreamItem::item_key).collect();
    let cache_miss_ids = self.storage.missing_entities(K::ENTITY, &ids)?;

    Ok(Slice {
      items,
      next_cursor,
      cache_miss_ids,
      source,
    })
  }
}

fn cursor_unless<T: StreamItem>(exhausted: bool, items: &[T]) -> Option<Cursor> {
  if exhausted {
    None
  } else {
    items.last().map(StreamItem::cursor)
  }
}
