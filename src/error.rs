//! Error types for the cache, remote and refresh layers.
//!
//! The binary edge (config loading, `main`) reports through `color_eyre`;
//! everything underneath returns one of these so callers can tell a failed
//! write from a failed read or a failed network call.

use thiserror::Error;

/// Errors raised by the persistent cache.
#[derive(Error, Debug)]
pub enum CacheError {
  /// Strict insert hit an existing record
  #[error("record {id} already exists in {store}")]
  WriteConflict { store: &'static str, id: String },

  /// Reading from the store failed; fatal to that read only
  #[error("cache read failed: {0}")]
  Read(String),

  /// Writing to the store failed; callers usually log and continue
  #[error("cache write failed: {0}")]
  Write(String),

  #[error("failed to (de)serialize cached value: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl CacheError {
  pub(crate) fn read(e: impl std::fmt::Display) -> Self {
    CacheError::Read(e.to_string())
  }

  pub(crate) fn write(e: impl std::fmt::Display) -> Self {
    CacheError::Write(e.to_string())
  }
}

/// Errors raised while talking to the remote API.
#[derive(Error, Debug)]
pub enum RemoteError {
  #[error("request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("{url} returned {status}")]
  Status {
    status: reqwest::StatusCode,
    url: String,
  },

  #[error("invalid url: {0}")]
  Url(#[from] url::ParseError),

  /// Used by in-process sources (tests, fixtures) that fail without HTTP
  #[error("{0}")]
  Unavailable(String),
}

/// Errors surfaced by the cache-first slice reader.
#[derive(Error, Debug)]
pub enum FetchError {
  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Remote(#[from] RemoteError),
}

/// Errors surfaced by a forced refresh of entity details.
#[derive(Error, Debug)]
pub enum RefreshError {
  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Remote(#[from] RemoteError),
}
