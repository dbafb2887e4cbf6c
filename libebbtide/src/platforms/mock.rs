//! Mock connector for testing
//!
//! A scripted, in-memory connector that serves a fixed sequence of pages and
//! records every call. Failures can be injected per fetch call or per item,
//! which lets engine and orchestrator tests exercise every termination path
//! without network access.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

use crate::criteria::Action;
use crate::error::{ConfigError, PlatformError, Result};
use crate::platforms::{Connector, Page, PageRequest, TimelineOrder};
use crate::types::{Platform, Post, PostKind, Timeline};

/// Configuration for mock connector behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Platform identity reported by the connector
    pub platform: Platform,

    /// Pages served in order; page `i` is requested with token `page-{i}`
    pub pages: Vec<Vec<Post>>,

    /// Override the next token a page reports (keyed by page index)
    pub next_token_overrides: HashMap<usize, String>,

    /// 1-based fetch call numbers that fail with a network error
    pub failing_fetch_calls: HashSet<usize>,

    /// Item ids whose action fails
    pub failing_items: HashSet<String>,

    /// Item ids that are already gone on the platform
    pub gone_items: HashSet<String>,

    /// Declared rate limit interval
    pub interval: Duration,

    /// Declared ordering guarantee
    pub ordering: TimelineOrder,

    /// Delay before completing each call (simulates network latency)
    pub delay: Duration,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Mock,
            pages: Vec::new(),
            next_token_overrides: HashMap::new(),
            failing_fetch_calls: HashSet::new(),
            failing_items: HashSet::new(),
            gone_items: HashSet::new(),
            interval: Duration::ZERO,
            ordering: TimelineOrder::NewestFirst,
            delay: Duration::ZERO,
        }
    }
}

/// Mock connector for testing
#[derive(Debug)]
pub struct MockConnector {
    config: MockConfig,
    fetch_requests: Mutex<Vec<PageRequest>>,
    executed: Mutex<Vec<(Action, String)>>,
}

impl MockConnector {
    /// Create a new mock connector with the given configuration
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            fetch_requests: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// A connector serving `pages` as the given platform
    pub fn with_pages(platform: Platform, pages: Vec<Vec<Post>>) -> Self {
        Self::new(MockConfig {
            platform,
            pages,
            ..Default::default()
        })
    }

    /// A connector serving the pages stored in a JSON fixture file
    ///
    /// The file holds an array of pages, each an array of posts. Posts keep
    /// whatever platform they were recorded with.
    pub fn from_fixture(path: &str) -> Result<Self> {
        let expanded = shellexpand::full(path)
            .map_err(|e| ConfigError::invalid("mock.fixture", e.to_string()))?;
        let content = std::fs::read_to_string(expanded.as_ref()).map_err(ConfigError::ReadError)?;
        let pages: Vec<Vec<Post>> = serde_json::from_str(&content).map_err(|e| {
            ConfigError::invalid("mock.fixture", format!("{}: {}", expanded, e))
        })?;

        tracing::debug!(path = %expanded, pages = pages.len(), "loaded mock fixture");
        Ok(Self::with_pages(Platform::Mock, pages))
    }

    /// Token under which page `index` is requested
    pub fn token_for(index: usize) -> String {
        if index == 0 {
            String::new()
        } else {
            format!("page-{}", index)
        }
    }

    /// Number of times `fetch_page` was called
    pub fn fetch_calls(&self) -> usize {
        self.fetch_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Every page request received, in order
    pub fn fetch_requests(&self) -> Vec<PageRequest> {
        self.fetch_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of times `execute` was called
    pub fn execute_calls(&self) -> usize {
        self.executed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Every action performed, as (action, post id)
    pub fn executed(&self) -> Vec<(Action, String)> {
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn page_index(&self, token: &str) -> Result<usize> {
        if token.is_empty() {
            return Ok(0);
        }
        token
            .strip_prefix("page-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| PlatformError::Decode(format!("unknown mock token '{}'", token)).into())
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn platform(&self) -> Platform {
        self.config.platform
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let call_number = {
            let mut requests = self.fetch_requests.lock().unwrap_or_else(|e| e.into_inner());
            requests.push(request.clone());
            requests.len()
        };

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if self.config.failing_fetch_calls.contains(&call_number) {
            return Err(PlatformError::Network(format!(
                "mock fetch {} failed",
                call_number
            ))
            .into());
        }

        let index = self.page_index(&request.token)?;
        let Some(items) = self.config.pages.get(index) else {
            return Ok(Page::end());
        };

        let next_token = match self.config.next_token_overrides.get(&index) {
            Some(token) => token.clone(),
            None if index + 1 < self.config.pages.len() => Self::token_for(index + 1),
            None => String::new(),
        };

        Ok(Page::new(items.clone(), next_token))
    }

    async fn execute(&self, action: Action, post: &Post) -> Result<()> {
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((action, post.id.clone()));

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if self.config.gone_items.contains(&post.id) {
            return Err(PlatformError::NotFound(post.id.clone()).into());
        }

        if self.config.failing_items.contains(&post.id) {
            return Err(PlatformError::Action(format!("mock {} of {} failed", action, post.id)).into());
        }

        Ok(())
    }

    fn rate_limit_interval(&self) -> Duration {
        self.config.interval
    }

    fn auth_required(&self) -> bool {
        false
    }

    fn ordering(&self, _timeline: Timeline) -> TimelineOrder {
        self.config.ordering
    }
}

/// Build `pages` pages of `per_page` original posts, newest first
///
/// The first post is `newest_age` old and each following post is `step`
/// older than the previous one. Ids are `post-0`, `post-1`, ...
pub fn aged_pages(
    platform: Platform,
    now: DateTime<Utc>,
    pages: usize,
    per_page: usize,
    newest_age: ChronoDuration,
    step: ChronoDuration,
) -> Vec<Vec<Post>> {
    (0..pages)
        .map(|page| {
            (0..per_page)
                .map(|offset| {
                    let n = page * per_page + offset;
                    let age = newest_age + step * n as i32;
                    Post::new(format!("post-{}", n), platform, PostKind::Original, now - age)
                        .with_content(format!("post number {}", n))
                })
                .collect()
        })
        .collect()
}
