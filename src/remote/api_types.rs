//! Serde types matching the feed API request and response bodies.
//!
//! These types are separate from domain types so the wire shape can change
//! without touching what the cache stores.

use serde::{Deserialize, Serialize};

use super::types::{Post, UserId};

// ============================================================================
// Stream endpoints
// ============================================================================

/// One page of `GET /streams/...`
#[derive(Debug, Deserialize)]
pub struct ApiStreamPage<T> {
  #[serde(default = "Vec::new")]
  pub items: Vec<T>,
}

// ============================================================================
// By-ids endpoints
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiByIdsRequest<'a> {
  pub ids: &'a [String],
  #[serde(skip_serializing_if = "Option::is_none")]
  pub viewer_id: Option<&'a UserId>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPostsResponse {
  #[serde(default)]
  pub posts: Vec<Post>,
}

#[derive(Debug, Deserialize)]
pub struct ApiUsersResponse {
  #[serde(default)]
  pub users: Vec<ApiUser>,
}

/// User as sent by the API, which names the display name in camelCase.
#[derive(Debug, Deserialize)]
pub struct ApiUser {
  pub id: UserId,
  #[serde(rename = "displayName")]
  pub display_name: Option<String>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

impl From<ApiUser> for super::types::User {
  fn from(user: ApiUser) -> Self {
    Self {
      id: user.id,
      display_name: user.display_name,
      extra: user.extra,
    }
  }
}
