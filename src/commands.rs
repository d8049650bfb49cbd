//! Subcommand implementations for the headless client.

use chrono::{DateTime, Utc};
use clap::{Args, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use feedsync::cache::{CacheStorage, Cursor, EntityKind, SqliteStorage, StreamKey};
use feedsync::remote::{ApiClient, FeedClient, FeedKey};
use feedsync::sync::{
  AuthState, BatchRefreshCoordinator, PageVisibility, SharedConfig, SubscriptionRegistry,
  ViewportTracker,
};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FeedKind {
  Timeline,
  UserPosts,
  Hashtag,
  Replies,
  Followers,
  Following,
  Influencers,
}

/// Which feed to read.
#[derive(Debug, Clone, Args)]
pub struct FeedArgs {
  #[arg(value_enum)]
  pub kind: FeedKind,

  /// User id, hashtag or post id, depending on the feed (timeline defaults
  /// to the configured viewer)
  pub target: Option<String>,

  /// Page size
  #[arg(short, long, default_value_t = 20)]
  pub limit: usize,
}

impl FeedArgs {
  pub fn feed_key(&self, viewer_id: Option<&str>) -> Result<FeedKey> {
    let target = || {
      self
        .target
        .clone()
        .ok_or_else(|| eyre!("The {:?} feed needs a target", self.kind))
    };

    Ok(match self.kind {
      FeedKind::Timeline => FeedKey::Timeline {
        viewer: match (&self.target, viewer_id) {
          (Some(target), _) => target.clone(),
          (None, Some(viewer)) => viewer.to_string(),
          (None, None) => return Err(eyre!("The timeline needs a target or api.viewer_id")),
        },
      },
      FeedKind::UserPosts => FeedKey::UserPosts { user: target()? },
      FeedKind::Hashtag => FeedKey::Hashtag { tag: target()? },
      FeedKind::Replies => FeedKey::Replies { post: target()? },
      FeedKind::Followers => FeedKey::Followers { user: target()? },
      FeedKind::Following => FeedKey::Following { user: target()? },
      FeedKind::Influencers => FeedKey::Influencers,
    })
  }
}

/// Parse a cursor printed as `id@timestamp`.
pub fn parse_cursor(value: &str) -> Result<Cursor> {
  let (item_key, timestamp) = value
    .rsplit_once('@')
    .ok_or_else(|| eyre!("Cursor must look like <id>@<timestamp>, got {:?}", value))?;
  let timestamp = timestamp
    .parse()
    .map_err(|e| eyre!("Invalid cursor timestamp {:?}: {}", timestamp, e))?;

  if item_key.is_empty() {
    return Err(eyre!("Cursor is missing the item id"));
  }

  Ok(Cursor {
    item_key: item_key.to_string(),
    timestamp,
  })
}

fn format_cursor(cursor: &Cursor) -> String {
  format!("{}@{}", cursor.item_key, cursor.timestamp)
}

fn format_time(ms: i64) -> String {
  DateTime::<Utc>::from_timestamp_millis(ms)
    .map(|at| at.to_rfc3339())
    .unwrap_or_else(|| ms.to_string())
}

fn open_client(config: &Config) -> Result<FeedClient> {
  let path = config.cache.db_path()?;
  let storage = SqliteStorage::open(&path)
    .map_err(|e| eyre!("Failed to open cache at {}: {}", path.display(), e))?;
  let api = ApiClient::new(&config.api.url, Config::get_api_token())
    .map_err(|e| eyre!("Invalid API url {}: {}", config.api.url, e))?;
  Ok(FeedClient::with_api(Arc::new(storage), api))
}

/// Print one page of a feed.
pub async fn feed(config: &Config, args: &FeedArgs, after: Option<Cursor>, refresh: bool) -> Result<()> {
  let client = open_client(config)?;
  let viewer_id = config.api.viewer_id.as_deref();
  let feed = args.feed_key(viewer_id)?;

  if feed.is_user_feed() {
    let slice = client.user_feed(&feed, args.limit, after).await?;
    for user in &slice.items {
      let name = client
        .get_user(&user.id)?
        .and_then(|user| user.display_name)
        .unwrap_or_default();
      println!("{}\t{}\t{}", user.id, format_time(user.listed_at), name);
    }
    print_footer(slice.next_cursor.as_ref(), slice.cache_miss_ids.len());
    return Ok(());
  }

  if refresh && after.is_none() {
    let added = client.refresh_post_feed(&feed, args.limit).await?;
    info!(feed = %feed.description(), added, "pulled newest posts");
  }

  let slice = client.post_feed(&feed, args.limit, after).await?;
  if let (Some(viewer_id), false) = (viewer_id, slice.cache_miss_ids.is_empty()) {
    if let Err(e) = client
      .hydrate_posts(&slice.cache_miss_ids, &viewer_id.to_string())
      .await
    {
      warn!(error = %e, "could not load post details");
    }
  }

  for post in &slice.items {
    println!("{}\t{}\t{}", post.id, post.author, format_time(post.created_at));
  }
  print_footer(slice.next_cursor.as_ref(), slice.cache_miss_ids.len());
  Ok(())
}

fn print_footer(next: Option<&Cursor>, misses: usize) {
  match next {
    Some(cursor) => println!("-- next: {}", format_cursor(cursor)),
    None => println!("-- end of feed"),
  }
  if misses > 0 {
    println!("-- {} item(s) had no cached details", misses);
  }
}

/// Keep the posts and authors of one feed page fresh until ctrl-c.
pub async fn watch(config: &Config, args: &FeedArgs) -> Result<()> {
  let viewer_id = config
    .api
    .viewer_id
    .clone()
    .ok_or_else(|| eyre!("watch needs api.viewer_id to be set"))?;
  let client = open_client(config)?;
  let feed = args.feed_key(Some(&viewer_id))?;
  if feed.is_user_feed() {
    return Err(eyre!("watch only supports post feeds"));
  }

  let slice = client.post_feed(&feed, args.limit, None).await?;

  let freshness = client.freshness();
  let shared = SharedConfig::new(config.refresh.clone());
  let registry = SubscriptionRegistry::new(freshness.clone(), shared.clone());
  let auth = AuthState::new();
  let visibility = PageVisibility::new(true);
  let coordinator =
    BatchRefreshCoordinator::new(registry.clone(), freshness, auth.clone(), visibility, shared);
  let viewport = ViewportTracker::new(registry.clone());

  coordinator.set_route(&feed.description());
  for post in &slice.items {
    viewport.set_visible(&post.id, &post.id, &post.author, true);
  }
  auth.sign_in(viewer_id, config.api.has_profile);
  coordinator.start();

  info!(
    feed = %feed.description(),
    posts = slice.items.len(),
    state = ?coordinator.state(),
    "watching"
  );

  let shutdown = tokio::signal::ctrl_c();
  tokio::pin!(shutdown);
  let mut report = tokio::time::interval(Duration::from_secs(10));
  loop {
    tokio::select! {
      _ = &mut shutdown => break,
      _ = report.tick() => {
        info!(
          state = ?coordinator.state(),
          queued_posts = registry.queued(EntityKind::Post).len(),
          queued_users = registry.queued(EntityKind::User).len(),
          "refresh status"
        );
      }
    }
  }

  coordinator.stop();
  viewport.clear();
  Ok(())
}

/// Wipe the local cache.
pub fn clear(config: &Config) -> Result<()> {
  let path = config.cache.db_path()?;
  if !path.exists() {
    println!("No cache at {}", path.display());
    return Ok(());
  }

  let storage = SqliteStorage::open(&path)
    .map_err(|e| eyre!("Failed to open cache at {}: {}", path.display(), e))?;
  storage.clear_all()?;
  println!("Cleared {}", path.display());
  Ok(())
}
