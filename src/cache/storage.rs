//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{Cacheable, EntityKind, StreamItem};
use crate::error::CacheError;

type Result<T> = std::result::Result<T, CacheError>;

/// A single cached entity.
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  /// The cached entity
  pub entity: T,
  /// When the entity was cached
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Streams are addressed by `(store, key)`. A stream record can exist with
/// zero items, which is distinct from the record being absent.
pub trait CacheStorage: Send + Sync {
  /// Insert a new stream record, failing if one already exists.
  fn insert_stream<T: StreamItem>(&self, store: &'static str, key: &str, items: &[T]) -> Result<()>;

  /// Insert or fully replace a stream record.
  fn put_stream<T: StreamItem>(&self, store: &'static str, key: &str, items: &[T]) -> Result<()>;

  /// Get the items of a stream record in order.
  fn get_stream<T: StreamItem>(&self, store: &'static str, key: &str) -> Result<Option<Vec<T>>>;

  /// Delete a stream record. Deleting a missing record is not an error.
  fn delete_stream(&self, store: &'static str, key: &str) -> Result<()>;

  /// Delete every stream record in a store.
  fn clear_streams(&self, store: &'static str) -> Result<()>;

  /// Read-modify-write a stream record inside one transaction.
  ///
  /// `f` receives the current items (`None` when the record is missing) and
  /// returns the new items, or `None` to leave the store untouched. Returns
  /// whatever `f` returned.
  fn modify_stream<T, F>(&self, store: &'static str, key: &str, f: F) -> Result<Option<Vec<T>>>
  where
    T: StreamItem,
    F: FnOnce(Option<Vec<T>>) -> Option<Vec<T>>;

  /// Store entity detail records (upsert by key).
  fn store_entities<T: Cacheable>(&self, entities: &[T]) -> Result<()>;

  /// Get a single entity detail record.
  fn get_entity<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>>;

  /// Keys, in input order, that have no detail record.
  fn missing_entities(&self, kind: EntityKind, keys: &[String]) -> Result<Vec<String>>;

  /// Last refresh time (ms since epoch) for the keys that have one.
  fn last_updated(&self, kind: EntityKind, keys: &[String]) -> Result<HashMap<String, i64>>;

  /// Record that the given keys were refreshed at `at_ms`.
  fn stamp_updated(&self, kind: EntityKind, keys: &[String], at_ms: i64) -> Result<()>;

  /// Wipe every table (logout).
  fn clear_all(&self) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::Write(format!("failed to create cache directory {}: {}", parent.display(), e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::Read(format!("failed to open cache database at {}: {}", path.display(), e))
    })?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database living only in memory.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory().map_err(CacheError::read)?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("feedsync").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| CacheError::Write(format!("failed to run cache migrations: {}", e)))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::Read(format!("lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per stream record, so empty streams still exist
CREATE TABLE IF NOT EXISTS stream_records (
    store TEXT NOT NULL,
    stream_key TEXT NOT NULL,
    item_count INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store, stream_key)
);

-- Stream items (preserves order, no duplicate item per stream)
CREATE TABLE IF NOT EXISTS stream_items (
    store TEXT NOT NULL,
    stream_key TEXT NOT NULL,
    item_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (store, stream_key, item_key)
);

CREATE INDEX IF NOT EXISTS idx_stream_items_position
    ON stream_items(store, stream_key, position);

-- Entity detail cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_key)
);

-- Last successful refresh per entity, milliseconds since epoch
CREATE TABLE IF NOT EXISTS freshness (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    last_updated_at INTEGER NOT NULL,
    PRIMARY KEY (entity_type, entity_key)
);
"#;

fn stream_exists(conn: &Connection, store: &str, key: &str) -> Result<bool> {
  conn
    .query_row(
      "SELECT 1 FROM stream_records WHERE store = ? AND stream_key = ?",
      params![store, key],
      |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(CacheError::read)
}

fn read_stream<T: StreamItem>(conn: &Connection, store: &str, key: &str) -> Result<Option<Vec<T>>> {
  if !stream_exists(conn, store, key)? {
    return Ok(None);
  }

  let mut stmt = conn
    .prepare(
      "SELECT data FROM stream_items
       WHERE store = ? AND stream_key = ?
       ORDER BY position",
    )
    .map_err(CacheError::read)?;

  let rows: Vec<Vec<u8>> = stmt
    .query_map(params![store, key], |row| row.get::<_, Vec<u8>>(0))
    .map_err(CacheError::read)?
    .collect::<rusqlite::Result<_>>()
    .map_err(CacheError::read)?;

  let items = rows
    .iter()
    .map(|data| serde_json::from_slice(data))
    .collect::<serde_json::Result<Vec<T>>>()?;

  Ok(Some(items))
}

/// Replace the record's items. Caller owns the transaction.
fn write_stream<T: StreamItem>(conn: &Connection, store: &str, key: &str, items: &[T]) -> Result<()> {
  conn
    .execute(
      "DELETE FROM stream_items WHERE store = ? AND stream_key = ?",
      params![store, key],
    )
    .map_err(CacheError::write)?;

  conn
    .execute(
      "INSERT OR REPLACE INTO stream_records (store, stream_key, item_count, updated_at)
       VALUES (?, ?, ?, datetime('now'))",
      params![store, key, items.len()],
    )
    .map_err(CacheError::write)?;

  let mut stmt = conn
    .prepare(
      "INSERT INTO stream_items (store, stream_key, item_key, position, data)
       VALUES (?, ?, ?, ?, ?)",
    )
    .map_err(CacheError::write)?;

  for (position, item) in items.iter().enumerate() {
    let data = serde_json::to_vec(item)?;
    stmt
      .execute(params![store, key, item.item_key(), position, data])
      .map_err(CacheError::write)?;
  }

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn insert_stream<T: StreamItem>(&self, store: &'static str, key: &str, items: &[T]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::write)?;

    if stream_exists(&tx, store, key)? {
      return Err(CacheError::WriteConflict {
        store,
        id: key.to_string(),
      });
    }

    write_stream(&tx, store, key, items)?;
    tx.commit().map_err(CacheError::write)
  }

  fn put_stream<T: StreamItem>(&self, store: &'static str, key: &str, items: &[T]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::write)?;
    write_stream(&tx, store, key, items)?;
    tx.commit().map_err(CacheError::write)
  }

  fn get_stream<T: StreamItem>(&self, store: &'static str, key: &str) -> Result<Option<Vec<T>>> {
    let conn = self.lock()?;
    read_stream(&conn, store, key)
  }

  fn delete_stream(&self, store: &'static str, key: &str) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::write)?;

    tx.execute(
      "DELETE FROM stream_items WHERE store = ? AND stream_key = ?",
      params![store, key],
    )
    .map_err(CacheError::write)?;
    tx.execute(
      "DELETE FROM stream_records WHERE store = ? AND stream_key = ?",
      params![store, key],
    )
    .map_err(CacheError::write)?;

    tx.commit().map_err(CacheError::write)
  }

  fn clear_streams(&self, store: &'static str) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::write)?;

    tx.execute("DELETE FROM stream_items WHERE store = ?", params![store])
      .map_err(CacheError::write)?;
    tx.execute("DELETE FROM stream_records WHERE store = ?", params![store])
      .map_err(CacheError::write)?;

    tx.commit().map_err(CacheError::write)
  }

  fn modify_stream<T, F>(&self, store: &'static str, key: &str, f: F) -> Result<Option<Vec<T>>>
  where
    T: StreamItem,
    F: FnOnce(Option<Vec<T>>) -> Option<Vec<T>>,
  {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::write)?;

    let current = read_stream::<T>(&tx, store, key)?;
    let next = f(current);

    if let Some(items) = &next {
      write_stream(&tx, store, key, items)?;
      tx.commit().map_err(CacheError::write)?;
    }

    Ok(next)
  }

  fn store_entities<T: Cacheable>(&self, entities: &[T]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::write)?;
    let entity_type = T::entity_kind().as_str();

    {
      let mut stmt = tx
        .prepare(
          "INSERT OR REPLACE INTO entity_cache (entity_type, entity_key, data, cached_at)
           VALUES (?, ?, ?, datetime('now'))",
        )
        .map_err(CacheError::write)?;

      for entity in entities {
        let data = serde_json::to_vec(entity)?;
        stmt
          .execute(params![entity_type, entity.cache_key(), data])
          .map_err(CacheError::write)?;
      }
    }

    tx.commit().map_err(CacheError::write)
  }

  fn get_entity<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>> {
    let conn = self.lock()?;
    let entity_type = T::entity_kind().as_str();

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM entity_cache
         WHERE entity_type = ? AND entity_key = ?",
        params![entity_type, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(CacheError::read)?;

    match row {
      Some((data, cached_at)) => Ok(Some(CachedEntity {
        entity: serde_json::from_slice(&data)?,
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn missing_entities(&self, kind: EntityKind, keys: &[String]) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT 1 FROM entity_cache WHERE entity_type = ? AND entity_key = ?")
      .map_err(CacheError::read)?;

    let mut missing = Vec::new();
    for key in keys {
      let found = stmt
        .query_row(params![kind.as_str(), key], |_| Ok(()))
        .optional()
        .map_err(CacheError::read)?;
      if found.is_none() {
        missing.push(key.clone());
      }
    }

    Ok(missing)
  }

  fn last_updated(&self, kind: EntityKind, keys: &[String]) -> Result<HashMap<String, i64>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT last_updated_at FROM freshness WHERE entity_type = ? AND entity_key = ?")
      .map_err(CacheError::read)?;

    let mut stamps = HashMap::with_capacity(keys.len());
    for key in keys {
      let at: Option<i64> = stmt
        .query_row(params![kind.as_str(), key], |row| row.get(0))
        .optional()
        .map_err(CacheError::read)?;
      if let Some(at) = at {
        stamps.insert(key.clone(), at);
      }
    }

    Ok(stamps)
  }

  fn stamp_updated(&self, kind: EntityKind, keys: &[String], at_ms: i64) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(CacheError::write)?;

    {
      let mut stmt = tx
        .prepare(
          "INSERT OR REPLACE INTO freshness (entity_type, entity_key, last_updated_at)
           VALUES (?, ?, ?)",
        )
        .map_err(CacheError::write)?;
      for key in keys {
        stmt
          .execute(params![kind.as_str(), key, at_ms])
          .map_err(CacheError::write)?;
      }
    }

    tx.commit().map_err(CacheError::write)
  }

  fn clear_all(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(
        "BEGIN;
         DELETE FROM stream_items;
         DELETE FROM stream_records;
         DELETE FROM entity_cache;
         DELETE FROM freshness;
         COMMIT;",
      )
      .map_err(CacheError::write)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| CacheError::Read(format!("failed to parse datetime '{}': {}", s, e)))
}
