//! Local-first persistence for streams and entities.
//!
//! This module provides a domain-agnostic caching mechanism that:
//! - Stores ordered, deduplicated stream records per stream kind
//! - Serves stream pages cache-first, continuing on the network by cursor
//! - Keeps entity detail records and their last refresh time

mod slice;
mod storage;
mod stream_store;
mod traits;

pub use slice::{Slice, SliceRequest, StreamSliceFetcher};
pub use storage::{CacheStorage, CachedEntity, SqliteStorage};
pub use stream_store::{OrderedStreamStore, StreamRecord};
pub use traits::{
  Cacheable, Cursor, EntityKind, RemoteStreamSource, SliceSource, StreamFetchParams, StreamItem,
  StreamKey, StreamKind,
};
