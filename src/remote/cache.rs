//! Caching implementations for feed types.

use sha2::{Digest, Sha256};

use crate::cache::{Cacheable, EntityKind, StreamItem, StreamKey, StreamKind};

use super::types::{Post, PostRef, PostStream, User, UserRef, UserStream};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Post {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_kind() -> EntityKind {
    EntityKind::Post
  }
}

impl Cacheable for User {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_kind() -> EntityKind {
    EntityKind::User
  }
}

// ============================================================================
// Stream items and kinds
// ============================================================================

impl StreamItem for PostRef {
  fn item_key(&self) -> String {
    self.id.clone()
  }

  fn timestamp(&self) -> i64 {
    self.created_at
  }
}

impl StreamItem for UserRef {
  fn item_key(&self) -> String {
    self.id.clone()
  }

  fn timestamp(&self) -> i64 {
    self.listed_at
  }
}

impl StreamKind for PostStream {
  type Item = PostRef;
  type Key = FeedKey;
  const STORE: &'static str = "post_streams";
  const ENTITY: EntityKind = EntityKind::Post;
}

impl StreamKind for UserStream {
  type Item = UserRef;
  type Key = FeedKey;
  const STORE: &'static str = "user_streams";
  const ENTITY: EntityKind = EntityKind::User;
}

// ============================================================================
// Feed keys
// ============================================================================

/// Identifies a feed, both locally and on the remote API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedKey {
  /// Home timeline of a viewer
  Timeline { viewer: String },
  /// Posts authored by a user
  UserPosts { user: String },
  /// Posts carrying a hashtag
  Hashtag { tag: String },
  /// Replies to a post
  Replies { post: String },
  /// Users following a user
  Followers { user: String },
  /// Users a user follows
  Following { user: String },
  /// Suggested accounts
  Influencers,
}

impl FeedKey {
  /// Whether this feed lists users rather than posts.
  pub fn is_user_feed(&self) -> bool {
    matches!(
      self,
      Self::Followers { .. } | Self::Following { .. } | Self::Influencers
    )
  }

  fn canonical(&self) -> String {
    match self {
      Self::Timeline { viewer } => format!("timeline:{}", viewer),
      Self::UserPosts { user } => format!("user_posts:{}", user),
      Self::Hashtag { tag } => format!("hashtag:{}", normalize_tag(tag)),
      Self::Replies { post } => format!("replies:{}", post),
      Self::Followers { user } => format!("followers:{}", user),
      Self::Following { user } => format!("following:{}", user),
      Self::Influencers => "influencers".to_string(),
    }
  }

  /// Path segments under `/streams/` on the remote API.
  pub fn remote_segments(&self) -> Vec<String> {
    match self {
      Self::Timeline { viewer } => vec!["timeline".into(), viewer.clone()],
      Self::UserPosts { user } => vec!["users".into(), user.clone(), "posts".into()],
      Self::Hashtag { tag } => vec!["hashtags".into(), normalize_tag(tag)],
      Self::Replies { post } => vec!["posts".into(), post.clone(), "replies".into()],
      Self::Followers { user } => vec!["users".into(), user.clone(), "followers".into()],
      Self::Following { user } => vec!["users".into(), user.clone(), "following".into()],
      Self::Influencers => vec!["influencers".into()],
    }
  }
}

impl StreamKey for FeedKey {
  fn cache_hash(&self) -> String {
    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match self {
      Self::Timeline { viewer } => format!("timeline of {}", viewer),
      Self::UserPosts { user } => format!("posts by {}", user),
      Self::Hashtag { tag } => format!("posts tagged #{}", normalize_tag(tag)),
      Self::Replies { post } => format!("replies to {}", post),
      Self::Followers { user } => format!("followers of {}", user),
      Self::Following { user } => format!("accounts followed by {}", user),
      Self::Influencers => "influencers".to_string(),
    }
  }
}

/// Normalize a hashtag for consistent hashing.
/// Trims whitespace, a leading '#', and lowercases.
fn normalize_tag(tag: &str) -> String {
  tag.trim().trim_start_matches('#').to_lowercase()
}
