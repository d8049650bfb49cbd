//! The feed API: wire types, HTTP client and the cached facade.

pub mod api_types;
pub mod cache;
pub mod client;
pub mod feed_client;
pub mod types;

pub use cache::FeedKey;
pub use client::ApiClient;
pub use feed_client::FeedClient;
