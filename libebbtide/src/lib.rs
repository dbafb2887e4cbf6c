//! Ebbtide - rate-limited retention pruning for the decentralized social web
//!
//! This library walks a user's timelines on Bluesky and Mastodon page by
//! page, decides for every item whether it should be kept, preserved, or
//! acted on, and performs those actions within each platform's rate limit.
//! The binaries (`ebb-list`, `ebb-prune`, `ebb-serve`) are thin shells
//! around [`Orchestrator`] and [`Service`].

pub mod config;
pub mod criteria;
pub mod engine;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod platforms;
pub mod rate_limiter;
pub mod report;
pub mod resolver;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use criteria::{Action, ActionMode, Criteria, CriteriaBuilder};
pub use engine::{Counts, Paginator, RoundResult, RunOutcome, Termination};
pub use error::{ConfigError, EbbtideError, PlatformError, Result};
pub use orchestrator::{Orchestrator, RunStatus, Service, StatusBoard, Summary, Target};
pub use resolver::Disposition;
pub use types::{Platform, Post, PostKind, Timeline};
