//! Persistent, ordered, de-duplicated stream records.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use super::storage::CacheStorage;
use super::traits::{StreamItem, StreamKind};
use crate::error::CacheError;

type Result<T> = std::result::Result<T, CacheError>;

/// A stored stream: its key and its items in feed order.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord<T> {
  pub id: String,
  pub items: Vec<T>,
}

/// Keyed store of ordered item lists for one stream kind.
///
/// Every write keeps the record free of duplicate item keys. Read-modify-write
/// operations run inside a single storage transaction.
pub struct OrderedStreamStore<K: StreamKind, S: CacheStorage> {
  storage: Arc<S>,
  _kind: PhantomData<fn() -> K>,
}

impl<K: StreamKind, S: CacheStorage> OrderedStreamStore<K, S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      _kind: PhantomData,
    }
  }

  /// Insert a new record. Fails with [`CacheError::WriteConflict`] if `id` exists.
  pub fn create(&self, id: &str, items: Vec<K::Item>) -> Result<StreamRecord<K::Item>> {
    let items = dedup(items);
    self.storage.insert_stream(K::STORE, id, &items)?;
    Ok(record(id, items))
  }

  /// Insert or fully replace a record.
  pub fn upsert(&self, id: &str, items: Vec<K::Item>) -> Result<StreamRecord<K::Item>> {
    let items = dedup(items);
    self.storage.put_stream(K::STORE, id, &items)?;
    Ok(record(id, items))
  }

  pub fn find_by_id(&self, id: &str) -> Result<Option<StreamRecord<K::Item>>> {
    Ok(
      self
        .storage
        .get_stream(K::STORE, id)?
        .map(|items| record(id, items)),
    )
  }

  pub fn delete_by_id(&self, id: &str) -> Result<()> {
    self.storage.delete_stream(K::STORE, id)
  }

  /// Remove every record of this stream kind.
  pub fn clear(&self) -> Result<()> {
    self.storage.clear_streams(K::STORE)
  }

  /// First item of the stream, if the record exists and is not empty.
  pub fn get_head(&self, id: &str) -> Result<Option<K::Item>> {
    Ok(
      self
        .storage
        .get_stream::<K::Item>(K::STORE, id)?
        .and_then(|items| items.into_iter().next()),
    )
  }

  /// Put items that are not yet in the stream at its head.
  ///
  /// Items already present keep their position; the remaining new items keep
  /// their relative order. A missing record is created from `new_items`.
  pub fn prepend_items(&self, id: &str, new_items: Vec<K::Item>) -> Result<StreamRecord<K::Item>> {
    let items = self
      .storage
      .modify_stream(K::STORE, id, |current| {
        Some(match current {
          None => dedup(new_items),
          Some(existing) => {
            let mut merged = only_new(&existing, new_items);
            merged.extend(existing);
            merged
          }
        })
      })?
      .unwrap_or_default();

    Ok(record(id, items))
  }

  /// Put items that are not yet in the stream at its tail.
  ///
  /// Same de-duplication rule as [`prepend_items`](Self::prepend_items); used
  /// when older pages arrive through cursor continuation.
  pub fn append_items(&self, id: &str, new_items: Vec<K::Item>) -> Result<StreamRecord<K::Item>> {
    let items = self
      .storage
      .modify_stream(K::STORE, id, |current| {
        Some(match current {
          None => dedup(new_items),
          Some(mut existing) => {
            let tail = only_new(&existing, new_items);
            existing.extend(tail);
            existing
          }
        })
      })?
      .unwrap_or_default();

    Ok(record(id, items))
  }

  /// Filter the given item keys out of the stream.
  ///
  /// A missing record is left missing.
  pub fn remove_items(&self, id: &str, item_keys: &[String]) -> Result<()> {
    let doomed: HashSet<&str> = item_keys.iter().map(String::as_str).collect();

    self.storage.modify_stream::<K::Item, _>(K::STORE, id, |current| {
      current.map(|items| {
        items
          .into_iter()
          .filter(|item| !doomed.contains(item.item_key().as_str()))
          .collect()
      })
    })?;

    Ok(())
  }
}

impl<K: StreamKind, S: CacheStorage> Clone for OrderedStreamStore<K, S> {
  fn clone(&self) -> Self {
    Self::new(Arc::clone(&self.storage))
  }
}

fn record<T>(id: &str, items: Vec<T>) -> StreamRecord<T> {
  StreamRecord {
    id: id.to_string(),
    items,
  }
}

/// Drop repeated item keys, keeping the first occurrence.
fn dedup<T: StreamItem>(items: Vec<T>) -> Vec<T> {
  let mut seen = HashSet::with_capacity(items.len());
  items
    .into_iter()
    .filter(|item| seen.insert(item.item_key()))
    .collect()
}

/// Items from `incoming` whose keys are absent from `existing`, de-duplicated.
fn only_new<T: StreamItem>(existing: &[T], incoming: Vec<T>) -> Vec<T> {
  let mut seen: HashSet<String> = existing.iter().map(|item| item.item_key()).collect();
  incoming
    .into_iter()
    .filter(|item| seen.insert(item.item_key()))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::remote::types::{PostRef, PostStream};

  fn store() -> OrderedStreamStore<PostStream, SqliteStorage> {
    OrderedStreamStore::new(Arc::new(SqliteStorage::open_in_memory().unwrap()))
  }

  fn refs(ids: &[&str]) -> Vec<PostRef> {
    ids
      .iter()
      .enumerate()
      .map(|(i, id)| PostRef {
        id: id.to_string(),
        author: "alice".to_string(),
        created_at: 1_000 - i as i64,
      })
      .collect()
  }

  fn keys(record: &StreamRecord<PostRef>) -> Vec<&str> {
    record.items.iter().map(|item| item.id.as_str()).collect()
  }

  #[test]
  fn test_create_fails_on_existing_id() {
    let store = store();
    store.create("feed", refs(&["a"])).unwrap();

    let err = store.create("feed", refs(&["b"])).unwrap_err();
    assert!(matches!(err, CacheError::WriteConflict { .. }));

    // Original contents survive the failed insert
    let record = store.find_by_id("feed").unwrap().unwrap();
    assert_eq!(keys(&record), vec!["a"]);
  }

  #[test]
  fn test_upsert_replaces_contents() {
    let store = store();
    store.upsert("feed", refs(&["a", "b"])).unwrap();
    store.upsert("feed", refs(&["c"])).unwrap();

    let record = store.find_by_id("feed").unwrap().unwrap();
    assert_eq!(keys(&record), vec!["c"]);
  }

  #[test]
  fn test_writes_drop_duplicate_keys() {
    let store = store();
    let record = store.upsert("feed", refs(&["a", "b", "a"])).unwrap();
    assert_eq!(keys(&record), vec!["a", "b"]);
  }

  #[test]
  fn test_get_head() {
    let store = store();
    assert!(store.get_head("feed").unwrap().is_none());

    store.upsert("feed", vec![]).unwrap();
    assert!(store.get_head("feed").unwrap().is_none());

    store.upsert("feed", refs(&["a", "b"])).unwrap();
    assert_eq!(store.get_head("feed").unwrap().unwrap().id, "a");
  }

  #[test]
  fn test_prepend_skips_existing_items() {
    let store = store();
    store.upsert("feed", refs(&["existing"])).unwrap();

    let record = store
      .prepend_items("feed", refs(&["new", "existing", "another"]))
      .unwrap();

    assert_eq!(keys(&record), vec!["new", "another", "existing"]);
    let stored = store.find_by_id("feed").unwrap().unwrap();
    assert_eq!(keys(&stored), vec!["new", "another", "existing"]);
  }

  #[test]
  fn test_prepend_creates_missing_record() {
    let store = store();
    let record = store.prepend_items("feed", refs(&["a", "b"])).unwrap();
    assert_eq!(keys(&record), vec!["a", "b"]);
    assert!(store.find_by_id("feed").unwrap().is_some());
  }

  #[test]
  fn test_append_skips_existing_items() {
    let store = store();
    store.upsert("feed", refs(&["a", "b"])).unwrap();

    let record = store.append_items("feed", refs(&["b", "c", "c", "d"])).unwrap();
    assert_eq!(keys(&record), vec!["a", "b", "c", "d"]);
  }

  #[test]
  fn test_remove_items() {
    let store = store();
    store.upsert("feed", refs(&["a", "b", "c"])).unwrap();

    store
      .remove_items("feed", &["b".to_string(), "zzz".to_string()])
      .unwrap();

    let record = store.find_by_id("feed").unwrap().unwrap();
    assert_eq!(keys(&record), vec!["a", "c"]);
  }

  #[test]
  fn test_remove_items_on_missing_record_is_noop() {
    let store = store();
    store.remove_items("feed", &["a".to_string()]).unwrap();
    assert!(store.find_by_id("feed").unwrap().is_none());
  }

  #[test]
  fn test_delete_and_clear() {
    let store = store();
    store.upsert("one", refs(&["a"])).unwrap();
    store.upsert("two", refs(&["b"])).unwrap();

    store.delete_by_id("one").unwrap();
    assert!(store.find_by_id("one").unwrap().is_none());
    assert!(store.find_by_id("two").unwrap().is_some());

    store.clear().unwrap();
    assert!(store.find_by_id("two").unwrap().is_none());
  }
}
