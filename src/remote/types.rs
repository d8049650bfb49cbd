use serde::{Deserialize, Serialize};

pub type PostId = String;
pub type UserId = String;

/// A post as it appears in a feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRef {
  pub id: PostId,
  pub author: UserId,
  /// Milliseconds since the Unix epoch
  pub created_at: i64,
}

/// A user as listed in a user stream (followers, influencers, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
  pub id: UserId,
  /// When the user entered this list, milliseconds since the Unix epoch
  pub listed_at: i64,
}

/// Full post details.
///
/// Only the fields needed for ordering and refresh are typed; the rest of the
/// payload is kept as-is so it round-trips through the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
  pub id: PostId,
  pub author: UserId,
  pub created_at: i64,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Full user profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: UserId,
  pub display_name: Option<String>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Streams of posts (timelines, hashtags, replies)
#[derive(Debug, Clone, Copy)]
pub struct PostStream;

/// Streams of users (followers, following, influencers)
#[derive(Debug, Clone, Copy)]
pub struct UserStream;
