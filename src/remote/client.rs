use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::api_types::{ApiByIdsRequest, ApiPostsResponse, ApiStreamPage, ApiUsersResponse};
use super::cache::FeedKey;
use super::types::{Post, PostId, PostRef, PostStream, User, UserId, UserRef, UserStream};
use crate::cache::{RemoteStreamSource, StreamFetchParams, StreamKey};
use crate::error::RemoteError;
use crate::sync::EntitySource;

/// Feed API client
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl ApiClient {
  pub fn new(base_url: &str, token: Option<String>) -> Result<Self, RemoteError> {
    let base_url = Url::parse(base_url)?;
    if base_url.cannot_be_a_base() {
      return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase.into());
    }

    let http = reqwest::Client::builder()
      .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
      .build()?;

    Ok(Self {
      http,
      base_url,
      token,
    })
  }

  /// Build `{base}/{segments...}`, percent-encoding every segment
  fn endpoint<I>(&self, segments: I) -> Result<Url, RemoteError>
  where
    I: IntoIterator,
    I::Item: AsRef<str>,
  {
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| RemoteError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
      Ok(response)
    } else {
      Err(RemoteError::Status {
        status,
        url: response.url().to_string(),
      })
    }
  }

  /// Get one page of a stream, newest first, strictly older than `start`
  pub async fn get_stream_page<T: DeserializeOwned>(
    &self,
    feed: &FeedKey,
    start: Option<i64>,
    limit: usize,
  ) -> Result<Vec<T>, RemoteError> {
    let mut url = self.endpoint(std::iter::once("streams".to_string()).chain(feed.remote_segments()))?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("limit", &limit.to_string());
      if let Some(start) = start {
        query.append_pair("start", &start.to_string());
      }
    }

    debug!(feed = %feed.description(), ?start, limit, "fetching stream page");

    let response = self.authorized(self.http.get(url)).send().await?;
    let page: ApiStreamPage<T> = Self::check_status(response)?.json().await?;
    Ok(page.items)
  }

  async fn post_by_ids<R: DeserializeOwned>(
    &self,
    resource: &str,
    ids: &[String],
    viewer_id: Option<&UserId>,
  ) -> Result<R, RemoteError> {
    let url = self.endpoint([resource, "by-ids"])?;
    let body = ApiByIdsRequest { ids, viewer_id };

    debug!(resource, count = ids.len(), "fetching by ids");

    let response = self
      .authorized(self.http.post(url))
      .json(&body)
      .send()
      .await?;
    Ok(Self::check_status(response)?.json().await?)
  }
}

#[async_trait]
impl RemoteStreamSource<PostStream> for ApiClient {
  async fn fetch(&self, params: StreamFetchParams<'_, FeedKey>) -> Result<Vec<PostRef>, RemoteError> {
    if params.stream.is_user_feed() {
      return Err(RemoteError::Unavailable(format!(
        "{} is not a post feed",
        params.stream.description()
      )));
    }
    self
      .get_stream_page(params.stream, params.start, params.limit)
      .await
  }
}

#[async_trait]
impl RemoteStreamSource<UserStream> for ApiClient {
  async fn fetch(&self, params: StreamFetchParams<'_, FeedKey>) -> Result<Vec<UserRef>, RemoteError> {
    if !params.stream.is_user_feed() {
      return Err(RemoteError::Unavailable(format!(
        "{} is not a user feed",
        params.stream.description()
      )));
    }
    self
      .get_stream_page(params.stream, params.start, params.limit)
      .await
  }
}

#[async_trait]
impl EntitySource for ApiClient {
  async fn fetch_posts_by_ids(
    &self,
    ids: &[PostId],
    viewer_id: &UserId,
  ) -> Result<Vec<Post>, RemoteError> {
    let response: ApiPostsResponse = self.post_by_ids("posts", ids, Some(viewer_id)).await?;
    Ok(response.posts)
  }

  async fn fetch_users_by_ids(
    &self,
    ids: &[UserId],
    viewer_id: Option<&UserId>,
  ) -> Result<Vec<User>, RemoteError> {
    let response: ApiUsersResponse = self.post_by_ids("users", ids, viewer_id).await?;
    Ok(response.users.into_iter().map(User::from).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use wiremock::matchers::{body_json, header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_stream_page_request_shape() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/streams/timeline/alice"))
      .and(query_param("limit", "2"))
      .and(query_param("start", "1700"))
      .and(header("authorization", "Bearer secret"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "items": [
          {"id": "p2", "author": "bob", "created_at": 1600},
          {"id": "p1", "author": "carol", "created_at": 1500}
        ]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let client = ApiClient::new(&format!("{}/api/", server.uri()), Some("secret".into())).unwrap();
    let feed = FeedKey::Timeline {
      viewer: "alice".into(),
    };

    let items = RemoteStreamSource::<PostStream>::fetch(
      &client,
      StreamFetchParams {
        stream: &feed,
        start: Some(1700),
        limit: 2,
      },
    )
    .await
    .unwrap();

    let ids: Vec<&str> = items.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, vec!["p2", "p1"]);
  }

  #[tokio::test]
  async fn test_hashtag_segment_is_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/streams/hashtags/rust"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
      .expect(1)
      .mount(&server)
      .await;

    let client = ApiClient::new(&server.uri(), None).unwrap();
    let feed = FeedKey::Hashtag { tag: "#Rust".into() };

    let items: Vec<PostRef> = client.get_stream_page(&feed, None, 10).await.unwrap();
    assert!(items.is_empty());
  }

  #[tokio::test]
  async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;

    let client = ApiClient::new(&server.uri(), None).unwrap();
    let err = client
      .get_stream_page::<UserRef>(&FeedKey::Influencers, None, 5)
      .await
      .unwrap_err();

    match err {
      RemoteError::Status { status, .. } => assert_eq!(status.as_u16(), 503),
      other => panic!("unexpected error: {other}"),
    }
  }

  #[tokio::test]
  async fn test_wrong_feed_kind_is_rejected() {
    let client = ApiClient::new("http://localhost:1", None).unwrap();
    let feed = FeedKey::Influencers;

    let err = RemoteStreamSource::<PostStream>::fetch(
      &client,
      StreamFetchParams {
        stream: &feed,
        start: None,
        limit: 5,
      },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RemoteError::Unavailable(_)));
  }

  #[tokio::test]
  async fn test_posts_by_ids_sends_viewer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/posts/by-ids"))
      .and(body_json(json!({"ids": ["p1", "p2"], "viewerId": "me"})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "posts": [{"id": "p1", "author": "bob", "created_at": 10, "likes": 3}]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let client = ApiClient::new(&server.uri(), None).unwrap();
    let posts = client
      .fetch_posts_by_ids(&["p1".to_string(), "p2".to_string()], &"me".to_string())
      .await
      .unwrap();

    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].extra.get("likes"), Some(&json!(3)));
  }

  #[tokio::test]
  async fn test_users_by_ids_without_viewer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/users/by-ids"))
      .and(body_json(json!({"ids": ["u1"]})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "users": [{"id": "u1", "displayName": "Alice"}]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let client = ApiClient::new(&server.uri(), None).unwrap();
    let users = client
      .fetch_users_by_ids(&["u1".to_string()], None)
      .await
      .unwrap();

    assert_eq!(users[0].display_name.as_deref(), Some("Alice"));
  }

  #[test]
  fn test_rejects_unusable_base_url() {
    assert!(ApiClient::new("mailto:someone@example.com", None).is_err());
    assert!(ApiClient::new("not a url", None).is_err());
  }
}
