//! Core types for Ebbtide

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::EbbtideError;

/// A platform Ebbtide knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Bluesky,
    Mastodon,
    /// In-memory connector used by tests and demos
    Mock,
}

impl Platform {
    /// Lowercase configuration key for the platform
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Bluesky => "bluesky",
            Platform::Mastodon => "mastodon",
            Platform::Mock => "mock",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = EbbtideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bluesky" | "bsky" => Ok(Platform::Bluesky),
            "mastodon" | "fediverse" => Ok(Platform::Mastodon),
            "mock" => Ok(Platform::Mock),
            other => Err(EbbtideError::InvalidInput(format!(
                "Unknown platform '{}'. Valid platforms: bluesky, mastodon",
                other
            ))),
        }
    }
}

/// What kind of record a timeline item is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    Original,
    Repost,
    Reply,
    Quote,
    Like,
}

impl std::fmt::Display for PostKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PostKind::Original => "original",
            PostKind::Repost => "repost",
            PostKind::Reply => "reply",
            PostKind::Quote => "quote",
            PostKind::Like => "like",
        };
        f.write_str(s)
    }
}

/// Which collection of the user's history a run walks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeline {
    /// Authored posts, replies and quotes, plus reposts on platforms that
    /// interleave them with the author's statuses
    #[default]
    Posts,
    Likes,
    Reposts,
}

impl std::fmt::Display for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Timeline::Posts => "posts",
            Timeline::Likes => "likes",
            Timeline::Reposts => "reposts",
        };
        f.write_str(s)
    }
}

impl FromStr for Timeline {
    type Err = EbbtideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "posts" | "post" => Ok(Timeline::Posts),
            "likes" | "like" | "favourites" | "favorites" => Ok(Timeline::Likes),
            "reposts" | "repost" | "reblogs" | "boosts" => Ok(Timeline::Reposts),
            other => Err(EbbtideError::InvalidInput(format!(
                "Unknown timeline '{}'. Valid timelines: posts, likes, reposts",
                other
            ))),
        }
    }
}

/// One content item or interaction record from a remote timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Platform-opaque identifier (AT URI for Bluesky, status id for Mastodon)
    pub id: String,
    pub platform: Platform,
    pub kind: PostKind,
    pub created_at: DateTime<Utc>,
    pub pinned: bool,
    /// The owner liked their own post
    pub self_liked: bool,
    pub content: String,
    /// Web permalink, when the platform provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl Post {
    pub fn new(
        id: impl Into<String>,
        platform: Platform,
        kind: PostKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            platform,
            kind,
            created_at,
            pinned: false,
            self_liked: false,
            content: String::new(),
            uri: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn self_liked(mut self) -> Self {
        self.self_liked = true;
        self
    }
}
