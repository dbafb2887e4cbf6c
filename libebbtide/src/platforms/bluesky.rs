//! Bluesky connector
//!
//! Talks AT Protocol XRPC to the account's PDS. Each timeline is one repo
//! collection; `com.atproto.repo.listRecords` returns records in reverse
//! record-key order, and record keys are timestamp ids, so pages arrive
//! newest first. Every action is a `deleteRecord` on the item's own record:
//! deleting a like record unlikes, deleting a repost record unshares.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{read_secret_file, BlueskyConfig};
use crate::criteria::Action;
use crate::error::{PlatformError, Result};
use crate::platforms::{Connector, Page, PageRequest};
use crate::types::{Platform, Post, PostKind, Timeline};

/// PDS used when none is configured
pub const DEFAULT_PDS: &str = "https://bsky.social";

const POST_COLLECTION: &str = "app.bsky.feed.post";
const LIKE_COLLECTION: &str = "app.bsky.feed.like";
const REPOST_COLLECTION: &str = "app.bsky.feed.repost";
const PROFILE_COLLECTION: &str = "app.bsky.actor.profile";

/// Access tokens live about two hours; log in again well before that
const SESSION_MAX_AGE: Duration = Duration::from_secs(90 * 60);

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
    did: String,
    handle: String,
}

struct Session {
    access_jwt: SecretString,
    did: String,
    handle: String,
    created: Instant,
}

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    #[serde(default)]
    cursor: Option<String>,
    records: Vec<RecordEntry>,
}

#[derive(Debug, Deserialize)]
struct RecordEntry {
    uri: String,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord {
    #[serde(default)]
    text: String,
    created_at: String,
    #[serde(default)]
    reply: Option<serde_json::Value>,
    #[serde(default)]
    embed: Option<EmbedRef>,
}

#[derive(Debug, Deserialize)]
struct EmbedRef {
    #[serde(rename = "$type", default)]
    kind: String,
}

/// A like or repost: a pointer at someone's post
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectRecord {
    subject: StrongRef,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct StrongRef {
    uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRecord {
    #[serde(default)]
    pinned_post: Option<StrongRef>,
}

#[derive(Debug, Deserialize)]
struct GetRecordResponse<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Debug, Default, Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// The parts of an `at://repo/collection/rkey` URI
#[derive(Debug, PartialEq, Eq)]
struct RecordKey<'a> {
    repo: &'a str,
    collection: &'a str,
    rkey: &'a str,
}

fn parse_at_uri(uri: &str) -> Result<RecordKey<'_>> {
    let mut parts = uri
        .strip_prefix("at://")
        .ok_or_else(|| PlatformError::Decode(format!("not an AT URI: {}", uri)))?
        .splitn(3, '/');

    match (parts.next(), parts.next(), parts.next()) {
        (Some(repo), Some(collection), Some(rkey))
            if !repo.is_empty() && !collection.is_empty() && !rkey.is_empty() =>
        {
            Ok(RecordKey {
                repo,
                collection,
                rkey,
            })
        }
        _ => Err(PlatformError::Decode(format!("incomplete AT URI: {}", uri)).into()),
    }
}

fn collection_for(timeline: Timeline) -> &'static str {
    match timeline {
        Timeline::Posts => POST_COLLECTION,
        Timeline::Likes => LIKE_COLLECTION,
        Timeline::Reposts => REPOST_COLLECTION,
    }
}

fn parse_timestamp(value: &str, uri: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            PlatformError::Decode(format!("bad createdAt '{}' on {}: {}", value, uri, e)).into()
        })
}

fn decode_value<T: DeserializeOwned>(entry: &RecordEntry) -> Result<T> {
    serde_json::from_value(entry.value.clone())
        .map_err(|e| PlatformError::Decode(format!("malformed record {}: {}", entry.uri, e)).into())
}

/// Turn listed records into posts
///
/// `repo_did` is the owner of the walked repo; a like whose subject lives in
/// that repo is a self-like. `pinned` is the URI of the profile's pinned post.
fn records_to_posts(
    timeline: Timeline,
    records: &[RecordEntry],
    repo_did: &str,
    pinned: Option<&str>,
) -> Result<Vec<Post>> {
    records
        .iter()
        .map(|entry| match timeline {
            Timeline::Posts => {
                let record: PostRecord = decode_value(entry)?;
                let kind = if record.reply.is_some() {
                    PostKind::Reply
                } else if record.embed.as_ref().is_some_and(|e| {
                    e.kind == "app.bsky.embed.record" || e.kind == "app.bsky.embed.recordWithMedia"
                }) {
                    PostKind::Quote
                } else {
                    PostKind::Original
                };

                let mut post = Post::new(
                    entry.uri.clone(),
                    Platform::Bluesky,
                    kind,
                    parse_timestamp(&record.created_at, &entry.uri)?,
                )
                .with_content(record.text);
                post.pinned = pinned == Some(entry.uri.as_str());
                post.uri = parse_at_uri(&entry.uri)
                    .ok()
                    .map(|key| format!("https://bsky.app/profile/{}/post/{}", key.repo, key.rkey));
                Ok(post)
            }
            Timeline::Likes | Timeline::Reposts => {
                let record: SubjectRecord = decode_value(entry)?;
                let kind = if timeline == Timeline::Likes {
                    PostKind::Like
                } else {
                    PostKind::Repost
                };

                let mut post = Post::new(
                    entry.uri.clone(),
                    Platform::Bluesky,
                    kind,
                    parse_timestamp(&record.created_at, &entry.uri)?,
                );
                post.self_liked = kind == PostKind::Like
                    && parse_at_uri(&record.subject.uri).is_ok_and(|key| key.repo == repo_did);
                post.content = record.subject.uri;
                Ok(post)
            }
        })
        .collect()
}

/// Map an XRPC error response to PlatformError
///
/// The status code decides the class; the AT Protocol error name in the
/// body refines it where the PDS answers 400 for auth and lookup failures.
fn map_xrpc_error(status: u16, body: &str, context: &str) -> PlatformError {
    let detail: XrpcErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = if detail.error.is_empty() {
        body.trim().to_string()
    } else if detail.message.is_empty() {
        detail.error.clone()
    } else {
        format!("{}: {}", detail.error, detail.message)
    };

    match (status, detail.error.as_str()) {
        (401 | 403, _)
        | (_, "AuthenticationRequired" | "InvalidToken" | "ExpiredToken" | "AccountTakedown") => {
            PlatformError::Authentication(format!(
                "Bluesky authentication failed during {}: {}. Check your handle and app password.",
                context, message
            ))
        }
        (404, _) | (_, "RecordNotFound") => {
            PlatformError::NotFound(format!("Bluesky {}: {}", context, message))
        }
        (429, _) | (_, "RateLimitExceeded") => PlatformError::RateLimit(format!(
            "Bluesky rate limit exceeded during {}: {}",
            context, message
        )),
        (500..=599, _) => PlatformError::Network(format!(
            "Bluesky PDS error during {} (HTTP {}): {}",
            context, status, message
        )),
        _ => PlatformError::Action(format!(
            "Bluesky rejected {} (HTTP {}): {}",
            context, status, message
        )),
    }
}

fn map_transport_error(error: reqwest::Error, context: &str) -> PlatformError {
    PlatformError::Network(format!(
        "Network error while contacting Bluesky PDS during {}: {}",
        context, error
    ))
}

pub struct BlueskyClient {
    http: reqwest::Client,
    pds_url: String,
    handle: String,
    app_password: SecretString,
    session: RwLock<Option<Arc<Session>>>,
    /// Handle to DID, for walking other repos
    dids: Mutex<HashMap<String, String>>,
    /// Pinned post URI per repo DID, refreshed at the start of each walk
    pinned: Mutex<HashMap<String, Option<String>>>,
}

impl std::fmt::Debug for BlueskyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlueskyClient")
            .field("pds_url", &self.pds_url)
            .field("handle", &self.handle)
            .field("app_password", &"***")
            .finish()
    }
}

impl BlueskyClient {
    /// Create an unauthenticated client
    ///
    /// # Arguments
    ///
    /// * `pds_url` - Base URL of the PDS (e.g., "https://bsky.social")
    /// * `handle` - The Bluesky handle (e.g., "user.bsky.social")
    /// * `app_password` - The app password for authentication
    pub fn new(pds_url: &str, handle: impl Into<String>, app_password: SecretString) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)))?;

        let pds_url = if pds_url.starts_with("http://") || pds_url.starts_with("https://") {
            pds_url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", pds_url.trim_end_matches('/'))
        };

        Ok(Self {
            http,
            pds_url,
            handle: handle.into(),
            app_password,
            session: RwLock::new(None),
            dids: Mutex::new(HashMap::new()),
            pinned: Mutex::new(HashMap::new()),
        })
    }

    /// Create a client from configuration and log in
    pub async fn from_config(config: &BlueskyConfig) -> Result<Self> {
        let app_password = read_secret_file(&config.app_password_file, "Bluesky app password")?;
        let pds_url = config.pds_url.as_deref().unwrap_or(DEFAULT_PDS);

        let client = Self::new(pds_url, config.handle.clone(), app_password)?;
        client.authenticate().await?;
        Ok(client)
    }

    /// Create a session with the PDS
    pub async fn authenticate(&self) -> Result<()> {
        self.login().await.map(|_| ())
    }

    fn xrpc(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.pds_url, method)
    }

    async fn login(&self) -> Result<Arc<Session>> {
        debug!(handle = %self.handle, "creating Bluesky session");

        let body = serde_json::json!({
            "identifier": self.handle,
            "password": self.app_password.expose_secret(),
        });
        let response: SessionResponse = self
            .call(
                self.http
                    .post(self.xrpc("com.atproto.server.createSession"))
                    .json(&body),
                "authentication",
            )
            .await?;

        let session = Arc::new(Session {
            access_jwt: SecretString::from(response.access_jwt),
            did: response.did,
            handle: response.handle,
            created: Instant::now(),
        });
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));

        debug!(did = %session.did, "Bluesky session created");
        Ok(session)
    }

    /// Current session, logging in again when it is missing or stale
    async fn session(&self) -> Result<Arc<Session>> {
        let current = self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match current {
            Some(session) if session.created.elapsed() < SESSION_MAX_AGE => Ok(session),
            _ => self.login().await,
        }
    }

    /// Send a request, map failures, and decode the JSON body
    async fn call<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder, context: &str) -> Result<T> {
        let response = self.send(request, context).await?;
        response.json::<T>().await.map_err(|e| {
            PlatformError::Decode(format!("Bluesky {} response: {}", context, e)).into()
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, context: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(e, context))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_xrpc_error(status.as_u16(), &body, context).into())
    }

    /// DID of the repo to walk for `user`
    async fn repo_did(&self, session: &Session, user: &str) -> Result<String> {
        let user = user.trim().trim_start_matches('@');
        if user.is_empty() || user == session.handle || user == session.did {
            return Ok(session.did.clone());
        }
        if user.starts_with("did:") {
            return Ok(user.to_string());
        }

        let cached = self
            .dids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .cloned();
        if let Some(did) = cached {
            return Ok(did);
        }

        let resolved: ResolveHandleResponse = self
            .call(
                self.http
                    .get(self.xrpc("com.atproto.identity.resolveHandle"))
                    .query(&[("handle", user)]),
                "handle resolution",
            )
            .await?;

        self.dids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.to_string(), resolved.did.clone());
        Ok(resolved.did)
    }

    /// URI of the repo's pinned post, fetched fresh when `refresh` is set
    async fn pinned_post(&self, session: &Session, did: &str, refresh: bool) -> Result<Option<String>> {
        if !refresh {
            let cached = self
                .pinned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(did)
                .cloned();
            if let Some(pinned) = cached {
                return Ok(pinned);
            }
        }

        let result: Result<GetRecordResponse<ProfileRecord>> = self
            .call(
                self.http
                    .get(self.xrpc("com.atproto.repo.getRecord"))
                    .bearer_auth(session.access_jwt.expose_secret())
                    .query(&[
                        ("repo", did),
                        ("collection", PROFILE_COLLECTION),
                        ("rkey", "self"),
                    ]),
                "profile lookup",
            )
            .await;

        let pinned = match result {
            Ok(profile) => profile.value.pinned_post.map(|r| r.uri),
            Err(e) if e.as_platform().is_some_and(PlatformError::is_already_gone) => None,
            Err(e) => return Err(e),
        };

        self.pinned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(did.to_string(), pinned.clone());
        Ok(pinned)
    }
}

#[async_trait]
impl Connector for BlueskyClient {
    fn platform(&self) -> Platform {
        Platform::Bluesky
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let session = self.session().await?;
        let repo = self.repo_did(&session, &request.user).await?;
        let collection = collection_for(request.timeline);

        let pinned = if request.timeline == Timeline::Posts {
            self.pinned_post(&session, &repo, request.is_first()).await?
        } else {
            None
        };

        let mut query = vec![
            ("repo", repo.clone()),
            ("collection", collection.to_string()),
            ("limit", request.batch_size.clamp(1, 100).to_string()),
        ];
        if !request.is_first() {
            query.push(("cursor", request.token.clone()));
        }

        let listing: ListRecordsResponse = self
            .call(
                self.http
                    .get(self.xrpc("com.atproto.repo.listRecords"))
                    .bearer_auth(session.access_jwt.expose_secret())
                    .query(&query),
                "list records",
            )
            .await?;

        let items = records_to_posts(request.timeline, &listing.records, &repo, pinned.as_deref())?;
        debug!(
            repo = %repo,
            collection,
            items = items.len(),
            has_cursor = listing.cursor.is_some(),
            "fetched Bluesky page"
        );

        Ok(Page::new(items, listing.cursor.unwrap_or_default()))
    }

    async fn execute(&self, action: Action, post: &Post) -> Result<()> {
        let key = parse_at_uri(&post.id)?;

        let applies = match action {
            Action::Delete => true,
            Action::Unlike => key.collection == LIKE_COLLECTION,
            Action::Unshare => key.collection == REPOST_COLLECTION,
        };
        if !applies {
            return Err(PlatformError::Unsupported(format!(
                "cannot {} a {} record",
                action, key.collection
            ))
            .into());
        }

        let session = self.session().await?;
        let body = serde_json::json!({
            "repo": key.repo,
            "collection": key.collection,
            "rkey": key.rkey,
        });

        self.send(
            self.http
                .post(self.xrpc("com.atproto.repo.deleteRecord"))
                .bearer_auth(session.access_jwt.expose_secret())
                .json(&body),
            "delete record",
        )
        .await?;

        debug!(uri = %post.id, action = %action, "deleted Bluesky record");
        Ok(())
    }

    fn rate_limit_interval(&self) -> Duration {
        DEFAULT_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DID: &str = "did:plc:alice";

    fn entry(uri: &str, value: serde_json::Value) -> RecordEntry {
        RecordEntry {
            uri: uri.to_string(),
            value,
        }
    }

    #[test]
    fn test_parse_at_uri() {
        let key = parse_at_uri("at://did:plc:alice/app.bsky.feed.post/3k2abc").unwrap();
        assert_eq!(
            key,
            RecordKey {
                repo: "did:plc:alice",
                collection: "app.bsky.feed.post",
                rkey: "3k2abc",
            }
        );

        assert!(parse_at_uri("https://bsky.app/profile/alice").is_err());
        assert!(parse_at_uri("at://did:plc:alice/app.bsky.feed.post").is_err());
    }

    #[test]
    fn test_post_records_classified() {
        let records = vec![
            entry(
                "at://did:plc:alice/app.bsky.feed.post/3",
                json!({"text": "hello", "createdAt": "2024-05-03T10:00:00.000Z"}),
            ),
            entry(
                "at://did:plc:alice/app.bsky.feed.post/2",
                json!({"text": "re", "createdAt": "2024-05-02T10:00:00Z", "reply": {"root": {}, "parent": {}}}),
            ),
            entry(
                "at://did:plc:alice/app.bsky.feed.post/1",
                json!({"text": "look", "createdAt": "2024-05-01T10:00:00Z",
                       "embed": {"$type": "app.bsky.embed.record", "record": {}}}),
            ),
        ];

        let posts = records_to_posts(
            Timeline::Posts,
            &records,
            DID,
            Some("at://did:plc:alice/app.bsky.feed.post/1"),
        )
        .unwrap();

        let kinds: Vec<_> = posts.iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![PostKind::Original, PostKind::Reply, PostKind::Quote]);
        assert_eq!(posts[0].content, "hello");
        assert!(!posts[0].pinned);
        assert!(posts[2].pinned);
        assert_eq!(
            posts[0].uri.as_deref(),
            Some("https://bsky.app/profile/did:plc:alice/post/3")
        );
        assert!(posts[0].created_at > posts[1].created_at);
    }

    #[test]
    fn test_like_records_detect_self_likes() {
        let records = vec![
            entry(
                "at://did:plc:alice/app.bsky.feed.like/2",
                json!({"subject": {"uri": "at://did:plc:alice/app.bsky.feed.post/9", "cid": "x"},
                       "createdAt": "2024-05-02T00:00:00Z"}),
            ),
            entry(
                "at://did:plc:alice/app.bsky.feed.like/1",
                json!({"subject": {"uri": "at://did:plc:bob/app.bsky.feed.post/7", "cid": "y"},
                       "createdAt": "2024-05-01T00:00:00Z"}),
            ),
        ];

        let posts = records_to_posts(Timeline::Likes, &records, DID, None).unwrap();

        assert!(posts.iter().all(|p| p.kind == PostKind::Like));
        assert!(posts[0].self_liked);
        assert!(!posts[1].self_liked);
        assert_eq!(posts[1].content, "at://did:plc:bob/app.bsky.feed.post/7");
    }

    #[test]
    fn test_repost_records() {
        let records = vec![entry(
            "at://did:plc:alice/app.bsky.feed.repost/1",
            json!({"subject": {"uri": "at://did:plc:alice/app.bsky.feed.post/9"},
                   "createdAt": "2024-05-02T00:00:00Z"}),
        )];

        let posts = records_to_posts(Timeline::Reposts, &records, DID, None).unwrap();
        assert_eq!(posts[0].kind, PostKind::Repost);
        assert!(!posts[0].self_liked);
    }

    #[test]
    fn test_malformed_record_is_decode_error() {
        let records = vec![entry(
            "at://did:plc:alice/app.bsky.feed.post/1",
            json!({"text": "no date"}),
        )];
        let err = records_to_posts(Timeline::Posts, &records, DID, None).unwrap_err();
        assert!(matches!(err.as_platform(), Some(PlatformError::Decode(_))));

        let records = vec![entry(
            "at://did:plc:alice/app.bsky.feed.post/1",
            json!({"createdAt": "yesterday"}),
        )];
        assert!(records_to_posts(Timeline::Posts, &records, DID, None).is_err());
    }

    #[test]
    fn test_error_mapping_by_status() {
        assert!(matches!(
            map_xrpc_error(401, "", "list records"),
            PlatformError::Authentication(_)
        ));
        assert!(matches!(map_xrpc_error(404, "", "x"), PlatformError::NotFound(_)));
        assert!(matches!(map_xrpc_error(429, "", "x"), PlatformError::RateLimit(_)));
        assert!(matches!(map_xrpc_error(502, "", "x"), PlatformError::Network(_)));
        assert!(matches!(map_xrpc_error(400, "", "x"), PlatformError::Action(_)));
    }

    #[test]
    fn test_error_mapping_by_xrpc_error_name() {
        let expired = r#"{"error":"ExpiredToken","message":"Token has expired"}"#;
        match map_xrpc_error(400, expired, "list records") {
            PlatformError::Authentication(msg) => {
                assert!(msg.contains("ExpiredToken: Token has expired"));
                assert!(msg.contains("list records"));
            }
            other => panic!("expected authentication error, got {:?}", other),
        }

        let missing = r#"{"error":"RecordNotFound","message":"Could not locate record"}"#;
        assert!(map_xrpc_error(400, missing, "profile lookup").is_already_gone());
    }

    #[test]
    fn test_client_normalizes_pds_url() {
        let client = BlueskyClient::new(
            "bsky.social/",
            "alice.bsky.social",
            SecretString::from("pw".to_string()),
        )
        .unwrap();
        assert_eq!(
            client.xrpc("com.atproto.repo.listRecords"),
            "https://bsky.social/xrpc/com.atproto.repo.listRecords"
        );
    }

    #[test]
    fn test_debug_hides_password() {
        let client = BlueskyClient::new(
            DEFAULT_PDS,
            "alice.bsky.social",
            SecretString::from("hunter2".to_string()),
        )
        .unwrap();
        let rendered = format!("{:?}", client);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("alice.bsky.social"));
    }

    #[tokio::test]
    async fn test_execute_rejects_mismatched_action() {
        let client = BlueskyClient::new(DEFAULT_PDS, "alice", SecretString::from("pw".to_string())).unwrap();
        let post = Post::new(
            "at://did:plc:alice/app.bsky.feed.post/1",
            Platform::Bluesky,
            PostKind::Original,
            Utc::now(),
        );

        let err = client.execute(Action::Unlike, &post).await.unwrap_err();
        assert!(matches!(err.as_platform(), Some(PlatformError::Unsupported(_))));
    }

    #[test]
    fn test_rate_limit_default() {
        let client = BlueskyClient::new(DEFAULT_PDS, "alice", SecretString::from("pw".to_string())).unwrap();
        assert_eq!(client.rate_limit_interval(), Duration::from_secs(1));
        assert!(client.auth_required());
    }
}
