//! Local-first data layer for a decentralized social client.
//!
//! [`cache`] persists ordered feeds and entity details in SQLite and serves
//! feed pages cache-first. [`sync`] keeps the entities on screen fresh with
//! batched background refreshes. [`remote`] talks to the feed API.

pub mod cache;
pub mod error;
pub mod remote;
pub mod sync;

#[cfg(test)]
mod testing;
