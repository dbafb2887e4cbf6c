//! Mastodon connector
//!
//! Uses the megalodon library, so any instance that implements the Mastodon
//! API works (Mastodon, Pleroma, Akkoma, GoToSocial). Account statuses are
//! paged with `max_id` and arrive newest first. Favourites are paged through
//! the `Link` header and come back in favourite order, which says nothing
//! about the statuses' own timestamps, so that timeline is declared
//! unordered.
//!
//! The API has no boosts-only listing, so the reposts timeline filters
//! account statuses. Pages without a boost are skipped within one round, and
//! those extra calls are spaced by the client's own limiter.

use async_trait::async_trait;
use megalodon::entities::Status;
use megalodon::megalodon::{GetAccountStatusesInputOptions, GetFavouritesInputOptions};
use megalodon::{Megalodon, SNS};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::config::{parse_interval, read_secret_file, MastodonConfig};
use crate::criteria::Action;
use crate::error::{PlatformError, Result};
use crate::platforms::{Connector, Page, PageRequest, TimelineOrder};
use crate::rate_limiter::RateLimiter;
use crate::types::{Platform, Post, PostKind, Timeline};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Mastodon platform client
pub struct MastodonClient {
    /// The megalodon client for API interactions
    client: Box<dyn Megalodon + Send + Sync>,

    /// The instance URL (e.g., "https://mastodon.social")
    instance_url: String,

    /// Id of the authenticated account, set by `authenticate`
    account_id: RwLock<Option<String>>,

    /// Minimum spacing between API calls
    interval: Duration,

    /// Spaces the account status calls of a boost scan
    scan_limiter: RateLimiter,
}

impl MastodonClient {
    /// Create a new Mastodon client
    ///
    /// # Arguments
    ///
    /// * `instance_url` - The base URL of the Mastodon instance (e.g., "https://mastodon.social")
    /// * `access_token` - OAuth access token for authentication
    pub fn new(instance_url: String, access_token: String) -> Result<Self> {
        let client = megalodon::generator(
            SNS::Mastodon,
            instance_url.clone(),
            Some(access_token),
            None,
        )
        .map_err(|e| {
            PlatformError::Authentication(format!("Failed to create Mastodon client: {:?}", e))
        })?;

        Ok(Self {
            client,
            instance_url,
            account_id: RwLock::new(None),
            interval: DEFAULT_INTERVAL,
            scan_limiter: RateLimiter::new(HashMap::from([(Platform::Mastodon, DEFAULT_INTERVAL)])),
        })
    }

    /// Use `interval` as the minimum spacing between calls
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self.scan_limiter.set_interval(Platform::Mastodon, interval);
        self
    }

    /// Create a Mastodon client from configuration
    ///
    /// Reads the access token from the configured token file. The client is
    /// not authenticated yet; call [`MastodonClient::authenticate`].
    ///
    /// # Errors
    ///
    /// Returns an error if the token file cannot be read or is empty.
    pub fn from_config(config: &MastodonConfig) -> Result<Self> {
        let token = read_secret_file(&config.token_file, "Mastodon token")?;

        // Ensure instance URL has https:// prefix
        let instance_url =
            if config.instance.starts_with("http://") || config.instance.starts_with("https://") {
                config.instance.trim_end_matches('/').to_string()
            } else {
                format!("https://{}", config.instance.trim_end_matches('/'))
            };

        let client = Self::new(instance_url, token.expose_secret().to_string())?;
        match &config.rate_limit {
            Some(rate_limit) => {
                let interval = parse_interval("mastodon.rate_limit", rate_limit)?;
                Ok(client.with_interval(interval))
            }
            None => Ok(client),
        }
    }

    /// Verify the token and remember the account it belongs to
    pub async fn authenticate(&self) -> Result<()> {
        let response = self
            .client
            .verify_account_credentials()
            .await
            .map_err(|e| map_megalodon_error(e, "authenticate"))?;

        let account = response.json;
        debug!(instance = %self.instance_url, acct = %account.acct, "Mastodon credentials verified");
        *self.account_id.write().unwrap_or_else(PoisonError::into_inner) = Some(account.id);
        Ok(())
    }

    fn own_account_id(&self) -> Result<String> {
        self.account_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                PlatformError::Authentication("Mastodon client is not authenticated".to_string())
                    .into()
            })
    }

    /// Account id to walk for `user`
    ///
    /// Empty means the authenticated account; anything else must already be
    /// a numeric account id.
    fn account_for(&self, user: &str) -> Result<String> {
        let user = user.trim();
        if user.is_empty() {
            return self.own_account_id();
        }
        if user.chars().all(|c| c.is_ascii_digit()) {
            return Ok(user.to_string());
        }
        Err(PlatformError::Unsupported(format!(
            "Mastodon accounts are addressed by numeric id, got '{}'",
            user
        ))
        .into())
    }

    async fn account_statuses(&self, account: &str, max_id: Option<String>, limit: u32) -> Result<Vec<Status>> {
        let options = GetAccountStatusesInputOptions {
            limit: Some(limit),
            max_id,
            ..Default::default()
        };

        let response = self
            .client
            .get_account_statuses(account.to_string(), Some(&options))
            .await
            .map_err(|e| map_megalodon_error(e, "fetch account statuses"))?;

        Ok(response.json)
    }

    async fn fetch_statuses(&self, request: &PageRequest) -> Result<Page> {
        let account = self.account_for(&request.user)?;
        let max_id = (!request.is_first()).then(|| request.token.clone());
        let statuses = self
            .account_statuses(&account, max_id, request.batch_size)
            .await?;

        let next_token = statuses.last().map(|s| s.id.clone()).unwrap_or_default();
        let items = statuses.into_iter().map(status_to_post).collect();
        Ok(Page::new(items, next_token))
    }

    /// One page of boosts, skipping raw pages that hold none
    ///
    /// Scans until a page with a boost turns up or the account's statuses
    /// run out, so an empty page always means the timeline really ended.
    async fn fetch_reblogs(&self, request: &PageRequest) -> Result<Page> {
        let account = self.account_for(&request.user)?;
        let mut max_id = (!request.is_first()).then(|| request.token.clone());
        let mut scanned = 0usize;

        loop {
            self.scan_limiter.wait_turn(Platform::Mastodon).await;
            let statuses = self
                .account_statuses(&account, max_id.clone(), request.batch_size)
                .await?;
            scanned += 1;

            let last_id = statuses.last().map(|s| s.id.clone());
            let items: Vec<Post> = statuses
                .into_iter()
                .filter(|s| s.reblog.is_some())
                .map(status_to_post)
                .collect();

            match scan_step(last_id, items.len()) {
                ScanStep::Emit { next_token } => return Ok(Page::new(items, next_token)),
                ScanStep::End => return Ok(Page::end()),
                ScanStep::Continue { max_id: next } => {
                    debug!(scanned, max_id = %next, "no boosts on this page, scanning older statuses");
                    max_id = Some(next);
                }
            }
        }
    }

    async fn fetch_favourites(&self, request: &PageRequest) -> Result<Page> {
        let own_id = self.own_account_id()?;
        if !request.user.trim().is_empty() && request.user.trim() != own_id {
            return Err(PlatformError::Unsupported(
                "Mastodon only exposes the authenticated account's favourites".to_string(),
            )
            .into());
        }

        let options = GetFavouritesInputOptions {
            limit: Some(request.batch_size),
            max_id: (!request.is_first()).then(|| request.token.clone()),
            ..Default::default()
        };

        let response = self
            .client
            .get_favourites(Some(&options))
            .await
            .map_err(|e| map_megalodon_error(e, "fetch favourites"))?;

        let next_token = response
            .header
            .get("link")
            .and_then(|value| value.to_str().ok())
            .and_then(next_max_id)
            .unwrap_or_default();

        let items = response
            .json
            .into_iter()
            .map(|status| {
                let self_liked = status.account.id == own_id;
                let mut post = Post::new(status.id, Platform::Mastodon, PostKind::Like, status.created_at)
                    .with_content(status.content);
                post.self_liked = self_liked;
                post.uri = status.url;
                post
            })
            .collect();

        Ok(Page::new(items, next_token))
    }
}

/// Convert an account status into a post
///
/// A boost is keyed by the boosted status id, which is what unreblogging
/// takes, but keeps the boost's own timestamp.
fn status_to_post(status: Status) -> Post {
    let pinned = status.pinned.unwrap_or(false);

    let mut post = match status.reblog {
        Some(original) => Post::new(
            original.id,
            Platform::Mastodon,
            PostKind::Repost,
            status.created_at,
        )
        .with_content(original.content),
        None => {
            let kind = if status.in_reply_to_id.is_some() {
                PostKind::Reply
            } else {
                PostKind::Original
            };
            let mut post = Post::new(status.id, Platform::Mastodon, kind, status.created_at)
                .with_content(status.content);
            post.uri = status.url;
            post
        }
    };
    post.pinned = pinned;
    post
}

/// What a boost scan does after one page of account statuses
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanStep {
    /// The page held boosts; hand them out and resume after `next_token`
    Emit { next_token: String },
    /// No boosts here; scan the statuses older than `max_id`
    Continue { max_id: String },
    /// The account has no older statuses
    End,
}

fn scan_step(last_id: Option<String>, boosts: usize) -> ScanStep {
    match last_id {
        None => ScanStep::End,
        Some(next_token) if boosts > 0 => ScanStep::Emit { next_token },
        Some(max_id) => ScanStep::Continue { max_id },
    }
}

/// The API call that carries out `action` on an item of `kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    DeleteStatus,
    Unreblog,
    Unfavourite,
}

fn plan_call(action: Action, kind: PostKind) -> Result<Call> {
    match (action, kind) {
        (Action::Delete | Action::Unshare, PostKind::Repost) => Ok(Call::Unreblog),
        (Action::Delete | Action::Unlike, PostKind::Like) => Ok(Call::Unfavourite),
        (Action::Delete, _) => Ok(Call::DeleteStatus),
        _ => Err(PlatformError::Unsupported(format!("cannot {} a {} on Mastodon", action, kind)).into()),
    }
}

/// Extract the `max_id` of the `rel="next"` link from a `Link` header
fn next_max_id(link: &str) -> Option<String> {
    link.split(',')
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| {
            let url = part.split(';').next()?.trim().trim_start_matches('<').trim_end_matches('>');
            let query = url.split_once('?')?.1;
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "max_id")
                .map(|(_, value)| value.to_string())
        })
}

#[async_trait]
impl Connector for MastodonClient {
    fn platform(&self) -> Platform {
        Platform::Mastodon
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let page = match request.timeline {
            Timeline::Posts => self.fetch_statuses(request).await?,
            Timeline::Reposts => self.fetch_reblogs(request).await?,
            Timeline::Likes => self.fetch_favourites(request).await?,
        };

        debug!(
            timeline = %request.timeline,
            items = page.items.len(),
            next = %page.next_token,
            "fetched Mastodon page"
        );
        Ok(page)
    }

    async fn execute(&self, action: Action, post: &Post) -> Result<()> {
        match plan_call(action, post.kind)? {
            Call::DeleteStatus => {
                self.client
                    .delete_status(post.id.clone())
                    .await
                    .map_err(|e| map_megalodon_error(e, "delete status"))?;
            }
            Call::Unreblog => {
                self.client
                    .unreblog_status(post.id.clone())
                    .await
                    .map_err(|e| map_megalodon_error(e, "unreblog status"))?;
            }
            Call::Unfavourite => {
                self.client
                    .unfavourite_status(post.id.clone())
                    .await
                    .map_err(|e| map_megalodon_error(e, "unfavourite status"))?;
            }
        }

        debug!(status_id = %post.id, action = %action, "Mastodon action applied");
        Ok(())
    }

    fn rate_limit_interval(&self) -> Duration {
        self.interval
    }

    fn ordering(&self, timeline: Timeline) -> TimelineOrder {
        match timeline {
            Timeline::Likes => TimelineOrder::Unordered,
            Timeline::Posts | Timeline::Reposts => TimelineOrder::NewestFirst,
        }
    }
}

/// Map megalodon errors to PlatformError
///
/// - HTTP 401/403 → `PlatformError::Authentication`
/// - HTTP 404 → `PlatformError::NotFound` (the status is already gone)
/// - HTTP 429 → `PlatformError::RateLimit`
/// - HTTP 5xx, transport failures → `PlatformError::Network`
/// - Parse errors → `PlatformError::Decode`
fn map_megalodon_error(error: megalodon::error::Error, context: &str) -> PlatformError {
    map_error_message(&error.to_string(), context)
}

fn map_error_message(error_str: &str, context: &str) -> PlatformError {
    let error_lower = error_str.to_lowercase();

    match extract_http_status(error_str) {
        Some(401) | Some(403) => PlatformError::Authentication(format!(
            "Mastodon authentication failed ({}): {}. \
                Suggestion: Verify your OAuth token is valid and has not expired.",
            context, error_str
        )),
        Some(404) => PlatformError::NotFound(format!("Mastodon ({}): {}", context, error_str)),
        Some(429) => PlatformError::RateLimit(format!(
            "Mastodon rate limit exceeded ({}): {}",
            context, error_str
        )),
        Some(500..=599) => PlatformError::Network(format!(
            "Mastodon server error ({}): {}",
            context, error_str
        )),
        Some(code) => PlatformError::Action(format!(
            "Mastodon rejected the request ({}, HTTP {}): {}",
            context, code, error_str
        )),
        None => {
            if error_lower.contains("unauthorized")
                || error_lower.contains("forbidden")
                || error_lower.contains("authentication")
            {
                PlatformError::Authentication(format!(
                    "Mastodon authentication failed ({}): {}",
                    context, error_str
                ))
            } else if error_lower.contains("not found") || error_lower.contains("record not found") {
                PlatformError::NotFound(format!("Mastodon ({}): {}", context, error_str))
            } else if error_lower.contains("rate limit") || error_lower.contains("too many requests") {
                PlatformError::RateLimit(format!(
                    "Mastodon rate limit exceeded ({}): {}",
                    context, error_str
                ))
            } else if error_lower.contains("parse")
                || error_lower.contains("json")
                || error_lower.contains("deserialize")
            {
                PlatformError::Decode(format!(
                    "Mastodon response parse error ({}): {}",
                    context, error_str
                ))
            } else {
                PlatformError::Network(format!(
                    "Mastodon error ({}): {}. \
                        Suggestion: Check your network connection and instance availability.",
                    context, error_str
                ))
            }
        }
    }
}

/// Extract HTTP status code from error message
///
/// Looks for patterns like "HTTP 401", "status 403", "401:", etc.
fn extract_http_status(error_str: &str) -> Option<u16> {
    let prefixes = ["HTTP ", "status ", "code: ", "status_code: "];

    for prefix in &prefixes {
        if let Some(pos) = error_str.find(prefix) {
            let after_prefix = &error_str[pos + prefix.len()..];
            if let Some(code) = after_prefix.get(0..3).and_then(|s| s.parse::<u16>().ok()) {
                if (100..=599).contains(&code) {
                    return Some(code);
                }
            }
        }
    }

    // Standalone 3-digit codes followed by colon or space
    let bytes = error_str.as_bytes();
    for (i, window) in bytes.windows(4).enumerate() {
        let digits = &window[0..3];
        if digits.iter().all(u8::is_ascii_digit)
            && (window[3] == b':' || window[3] == b' ')
            && (i == 0 || !bytes[i - 1].is_ascii_digit())
        {
            let code = std::str::from_utf8(digits).ok()?.parse::<u16>().ok()?;
            if (100..=599).contains(&code) {
                return Some(code);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_with_token(token: &str) -> (MastodonConfig, NamedTempFile) {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", token).unwrap();
        let config = MastodonConfig {
            enabled: true,
            instance: "mastodon.social".to_string(),
            token_file: file.path().to_string_lossy().to_string(),
            rate_limit: None,
        };
        (config, file)
    }

    #[test]
    fn test_from_config_adds_scheme() {
        let (config, _file) = config_with_token("abc123\n");
        let client = MastodonClient::from_config(&config).unwrap();
        assert_eq!(client.instance_url, "https://mastodon.social");
        assert_eq!(client.platform(), Platform::Mastodon);
        assert_eq!(client.rate_limit_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_from_config_rejects_empty_token() {
        let (config, _file) = config_with_token("   ");
        assert!(MastodonClient::from_config(&config).is_err());
    }

    #[test]
    fn test_unauthenticated_client_has_no_account() {
        let (config, _file) = config_with_token("abc123");
        let client = MastodonClient::from_config(&config).unwrap();

        assert!(client.account_for("").is_err());
        assert_eq!(client.account_for("109876").unwrap(), "109876");
        assert!(matches!(
            client.account_for("@alice@example.org").unwrap_err().as_platform(),
            Some(PlatformError::Unsupported(_))
        ));
    }

    #[test]
    fn test_favourites_are_unordered() {
        let (config, _file) = config_with_token("abc123");
        let client = MastodonClient::from_config(&config).unwrap();

        assert_eq!(client.ordering(Timeline::Likes), TimelineOrder::Unordered);
        assert_eq!(client.ordering(Timeline::Posts), TimelineOrder::NewestFirst);
        assert_eq!(client.ordering(Timeline::Reposts), TimelineOrder::NewestFirst);
    }

    #[test]
    fn test_from_config_applies_rate_limit() {
        let (mut config, _file) = config_with_token("abc123");
        config.rate_limit = Some("5s".to_string());
        let client = MastodonClient::from_config(&config).unwrap();

        assert_eq!(client.rate_limit_interval(), Duration::from_secs(5));
        assert_eq!(client.scan_limiter.interval(Platform::Mastodon), Duration::from_secs(5));
    }

    #[test]
    fn test_scan_step() {
        assert_eq!(
            scan_step(Some("110".to_string()), 3),
            ScanStep::Emit {
                next_token: "110".to_string()
            }
        );
        // A full page of originals keeps the scan going instead of ending it
        assert_eq!(
            scan_step(Some("90".to_string()), 0),
            ScanStep::Continue {
                max_id: "90".to_string()
            }
        );
        assert_eq!(scan_step(None, 0), ScanStep::End);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_calls_are_spaced() {
        let (config, _file) = config_with_token("abc123");
        let client = MastodonClient::from_config(&config).unwrap();

        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            client.scan_limiter.wait_turn(Platform::Mastodon).await;
        }
        assert_eq!(start.elapsed(), DEFAULT_INTERVAL * 2);
    }

    #[test]
    fn test_plan_call() {
        assert_eq!(plan_call(Action::Delete, PostKind::Original).unwrap(), Call::DeleteStatus);
        assert_eq!(plan_call(Action::Delete, PostKind::Reply).unwrap(), Call::DeleteStatus);
        assert_eq!(plan_call(Action::Unshare, PostKind::Repost).unwrap(), Call::Unreblog);
        assert_eq!(plan_call(Action::Delete, PostKind::Repost).unwrap(), Call::Unreblog);
        assert_eq!(plan_call(Action::Unlike, PostKind::Like).unwrap(), Call::Unfavourite);
        assert!(plan_call(Action::Unlike, PostKind::Original).is_err());
        assert!(plan_call(Action::Unshare, PostKind::Like).is_err());
    }

    #[test]
    fn test_next_max_id_from_link_header() {
        let link = r#"<https://mastodon.social/api/v1/favourites?limit=40&max_id=10934>; rel="next", <https://mastodon.social/api/v1/favourites?limit=40&min_id=11000>; rel="prev""#;
        assert_eq!(next_max_id(link).as_deref(), Some("10934"));

        let prev_only = r#"<https://mastodon.social/api/v1/favourites?min_id=11000>; rel="prev""#;
        assert!(next_max_id(prev_only).is_none());
        assert!(next_max_id("").is_none());
    }

    #[test]
    fn test_extract_http_status() {
        assert_eq!(extract_http_status("HTTP 401 Unauthorized"), Some(401));
        assert_eq!(extract_http_status("status 503"), Some(503));
        assert_eq!(extract_http_status("404: Record not found"), Some(404));
        assert_eq!(extract_http_status("id 12345: nope"), None);
        assert_eq!(extract_http_status("connection refused"), None);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            map_error_message("HTTP 401 Unauthorized", "authenticate"),
            PlatformError::Authentication(_)
        ));
        assert!(map_error_message("404: Record not found", "delete status").is_already_gone());
        assert!(matches!(
            map_error_message("HTTP 429", "fetch favourites"),
            PlatformError::RateLimit(_)
        ));
        assert!(matches!(
            map_error_message("status 502 Bad Gateway", "x"),
            PlatformError::Network(_)
        ));
        assert!(matches!(
            map_error_message("HTTP 422 Unprocessable", "x"),
            PlatformError::Action(_)
        ));
        assert!(matches!(
            map_error_message("failed to parse json", "x"),
            PlatformError::Decode(_)
        ));
        assert!(matches!(
            map_error_message("connection reset by peer", "x"),
            PlatformError::Network(_)
        ));
    }

    #[test]
    fn test_error_mapping_includes_context() {
        match map_error_message("HTTP 500", "fetch account statuses") {
            PlatformError::Network(msg) => assert!(msg.contains("fetch account statuses")),
            other => panic!("expected network error, got {:?}", other),
        }
    }
}
