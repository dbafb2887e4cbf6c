//! Platform connectors
//!
//! Each supported platform provides a [`Connector`]: fetch one page of a
//! user's timeline, perform one destructive action on one item, and declare
//! its rate limit and ordering guarantees. Connectors are standalone types
//! selected by configuration key; the engine never knows which one it drives.
//!
//! # Examples
//!
//! ```no_run
//! use libebbtide::platforms::{Connector, PageRequest};
//! use libebbtide::types::Timeline;
//!
//! # async fn example(connector: &dyn Connector) -> libebbtide::error::Result<()> {
//! let request = PageRequest::first("alice.bsky.social", 50, Timeline::Posts);
//! let page = connector.fetch_page(&request).await?;
//! for post in &page.items {
//!     println!("{} {}", post.created_at, post.id);
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::criteria::Action;
use crate::error::Result;
use crate::types::{Platform, Post, Timeline};

pub mod bluesky;
pub mod mastodon;

// Mock connector is available for all builds (not just tests) to support integration tests
// and offline fixtures
pub mod mock;

/// Request for one page of a timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Account identifier as the platform understands it (handle, DID, or
    /// account id). Empty means the authenticated account.
    pub user: String,
    /// Opaque pagination token; empty for the start of the timeline
    pub token: String,
    pub batch_size: u32,
    pub timeline: Timeline,
}

impl PageRequest {
    /// Request for the first page of a timeline
    pub fn first(user: impl Into<String>, batch_size: u32, timeline: Timeline) -> Self {
        Self {
            user: user.into(),
            token: String::new(),
            batch_size,
            timeline,
        }
    }

    pub fn is_first(&self) -> bool {
        self.token.is_empty()
    }
}

/// One fetched page, newest item first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<Post>,
    /// Opaque token for the next page; empty when the platform reports none
    pub next_token: String,
}

impl Page {
    pub fn new(items: Vec<Post>, next_token: impl Into<String>) -> Self {
        Self {
            items,
            next_token: next_token.into(),
        }
    }

    /// An empty page, which signals end of timeline
    pub fn end() -> Self {
        Self::default()
    }
}

/// Ordering guarantee a connector gives for a timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineOrder {
    /// `created_at` is non-increasing across the whole walk
    NewestFirst,
    /// Pages are ordered by something other than `created_at`, so an old
    /// item says nothing about the items after it
    Unordered,
}

/// Capability interface every platform connector implements
#[async_trait]
pub trait Connector: Send + Sync {
    /// The platform this connector talks to
    fn platform(&self) -> Platform;

    /// Fetch one page of the timeline named in `request`
    ///
    /// An empty `items` list with no error means end of timeline.
    ///
    /// # Errors
    ///
    /// Any `PlatformError` is fatal to the current run.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page>;

    /// Perform `action` on `post`
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::NotFound` when the item is already gone, and
    /// other `PlatformError`s when the action failed.
    async fn execute(&self, action: Action, post: &Post) -> Result<()>;

    /// Minimum spacing between successive page fetches
    fn rate_limit_interval(&self) -> Duration;

    /// Whether the connector needs credentials to operate
    fn auth_required(&self) -> bool {
        true
    }

    /// Ordering guarantee for `timeline`
    fn ordering(&self, _timeline: Timeline) -> TimelineOrder {
        TimelineOrder::NewestFirst
    }
}

/// Connectors keyed by platform, shared across runs
pub type ConnectorSet = BTreeMap<Platform, Arc<dyn Connector>>;

/// Create connectors for every enabled platform in `config`
///
/// Each connector is authenticated before it is returned. When `only` is
/// given, platforms outside that list are skipped.
///
/// # Errors
///
/// Returns the first authentication or configuration error encountered.
pub async fn create_connectors(config: &Config, only: Option<&[Platform]>) -> Result<ConnectorSet> {
    let wanted = |platform: Platform| only.map_or(true, |list| list.contains(&platform));
    let mut connectors = ConnectorSet::new();

    if let Some(bluesky_config) = config.bluesky.as_ref().filter(|c| c.enabled) {
        if wanted(Platform::Bluesky) {
            let client = bluesky::BlueskyClient::from_config(bluesky_config).await?;
            connectors.insert(Platform::Bluesky, Arc::new(client));
        }
    }

    if let Some(mastodon_config) = config.mastodon.as_ref().filter(|c| c.enabled) {
        if wanted(Platform::Mastodon) {
            let client = mastodon::MastodonClient::from_config(mastodon_config)?;
            client.authenticate().await?;
            connectors.insert(Platform::Mastodon, Arc::new(client));
        }
    }

    if let Some(mock_config) = config.mock.as_ref().filter(|c| c.enabled) {
        if wanted(Platform::Mock) {
            let connector = mock::MockConnector::from_fixture(&mock_config.fixture)?;
            connectors.insert(Platform::Mock, Arc::new(connector));
        }
    }

    tracing::debug!(count = connectors.len(), "created platform connectors");
    Ok(connectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_page_request() {
        let request = PageRequest::first("me", 25, Timeline::Likes);
        assert!(request.is_first());
        assert_eq!(request.batch_size, 25);
        assert_eq!(request.timeline, Timeline::Likes);
    }

    #[test]
    fn test_end_page_is_empty() {
        let page = Page::end();
        assert!(page.items.is_empty());
        assert!(page.next_token.is_empty());
    }

    #[tokio::test]
    async fn test_create_connectors_with_nothing_enabled() {
        let config = Config::default_config();
        let connectors = create_connectors(&config, None).await.unwrap();
        assert!(connectors.is_empty());
    }
}
