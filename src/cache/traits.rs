//! Core traits and types for the caching system.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::RemoteError;

/// Kind of entity tracked by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
  Post,
  User,
}

impl EntityKind {
  /// Entity type name for storage organization
  pub fn as_str(self) -> &'static str {
    match self {
      EntityKind::Post => "post",
      EntityKind::User => "user",
    }
  }
}

impl std::fmt::Display for EntityKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Trait for entity detail records that can be cached.
///
/// Implementors must provide a unique cache key; the kind decides which
/// partition of the entity cache and freshness index the record lands in.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier for this entity (post id, user id)
  fn cache_key(&self) -> String;

  fn entity_kind() -> EntityKind;
}

/// An entry of an ordered stream.
///
/// Streams hold lightweight references, not full entities. The item key is
/// the identity used for de-duplication; the timestamp is what the remote
/// paginates on.
pub trait StreamItem: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  fn item_key(&self) -> String;

  /// Milliseconds since the Unix epoch
  fn timestamp(&self) -> i64;

  /// Cursor pointing just past this item.
  fn cursor(&self) -> Cursor {
    Cursor {
      item_key: self.item_key(),
      timestamp: self.timestamp(),
    }
  }
}

/// Key identifying one stream, locally and remotely.
pub trait StreamKey: Send + Sync {
  /// Stable storage key
  fn cache_hash(&self) -> String;

  /// Human-readable description, for logs
  fn description(&self) -> String;
}

/// A family of streams sharing an item type and a storage partition.
pub trait StreamKind: Send + Sync + 'static {
  type Item: StreamItem;
  type Key: StreamKey;

  /// Store name, partitions records between stream kinds
  const STORE: &'static str;

  /// Kind of the entities the items refer to
  const ENTITY: EntityKind;
}

/// Continuation token for remote pagination: the last item seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
  pub item_key: String,
  pub timestamp: i64,
}

/// Indicates where a slice came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceSource {
  /// Served entirely from the local stream record
  Cache,
  /// Fetched from the network
  Network,
  /// Cached head topped up from the network
  Mixed,
}

/// Parameters of one remote page request.
#[derive(Debug)]
pub struct StreamFetchParams<'a, Q> {
  pub stream: &'a Q,
  /// Only items strictly older than this timestamp; `None` means newest
  pub start: Option<i64>,
  pub limit: usize,
}

/// Remote paginated source of stream items, newest first.
#[async_trait]
pub trait RemoteStreamSource<K: StreamKind>: Send + Sync {
  async fn fetch(&self, params: StreamFetchParams<'_, K::Key>) -> Result<Vec<K::Item>, RemoteError>;
}
