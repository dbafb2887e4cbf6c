//! Run criteria and threshold parsing
//!
//! A [`Criteria`] is the immutable policy of one run. It is always built
//! through [`CriteriaBuilder`], which rejects invalid combinations with a
//! [`ConfigError`] before any connector is touched.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{ConfigError, EbbtideError, Result};
use crate::types::{PostKind, Timeline};

/// Largest page size any supported platform accepts
pub const MAX_BATCH_SIZE: u32 = 100;

/// Page size used when none is configured
pub const DEFAULT_BATCH_SIZE: u32 = 50;

/// A destructive action a connector can perform on one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Delete,
    Unlike,
    Unshare,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Delete => "delete",
            Action::Unlike => "unlike",
            Action::Unshare => "unshare",
        };
        f.write_str(s)
    }
}

/// The configured action of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    Delete,
    Unlike,
    Unshare,
    /// Unlike likes, unshare reposts, delete everything else
    #[default]
    Auto,
}

impl ActionMode {
    /// The concrete action for a post of the given kind
    pub fn for_kind(self, kind: PostKind) -> Action {
        match self {
            ActionMode::Delete => Action::Delete,
            ActionMode::Unlike => Action::Unlike,
            ActionMode::Unshare => Action::Unshare,
            ActionMode::Auto => match kind {
                PostKind::Like => Action::Unlike,
                PostKind::Repost => Action::Unshare,
                PostKind::Original | PostKind::Reply | PostKind::Quote => Action::Delete,
            },
        }
    }
}

impl FromStr for ActionMode {
    type Err = EbbtideError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "delete" => Ok(ActionMode::Delete),
            "unlike" => Ok(ActionMode::Unlike),
            "unshare" | "unrepost" | "unreblog" => Ok(ActionMode::Unshare),
            "auto" => Ok(ActionMode::Auto),
            other => Err(ConfigError::invalid(
                "action",
                format!("'{}' is not one of delete, unlike, unshare, auto", other),
            )
            .into()),
        }
    }
}

/// Immutable policy for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criteria {
    pub max_age: Option<Duration>,
    pub before_date: Option<DateTime<Utc>>,
    pub preserve_pinned: bool,
    pub preserve_self_like: bool,
    pub action: ActionMode,
    pub dry_run: bool,
    /// When false the engine processes exactly one page
    pub continue_to_end: bool,
    pub batch_size: u32,
    pub timeline: Timeline,
}

impl Criteria {
    pub fn builder() -> CriteriaBuilder {
        CriteriaBuilder::default()
    }

    /// Criteria for a plain listing: no thresholds, never acts
    pub fn listing(timeline: Timeline) -> Self {
        Self {
            max_age: None,
            before_date: None,
            preserve_pinned: false,
            preserve_self_like: false,
            action: ActionMode::Auto,
            dry_run: true,
            continue_to_end: true,
            batch_size: DEFAULT_BATCH_SIZE,
            timeline,
        }
    }

    /// Whether an age or date threshold is configured
    pub fn has_threshold(&self) -> bool {
        self.max_age.is_some() || self.before_date.is_some()
    }
}

/// Validating builder for [`Criteria`]
#[derive(Debug, Clone)]
pub struct CriteriaBuilder {
    max_age: Option<Duration>,
    before_date: Option<DateTime<Utc>>,
    preserve_pinned: bool,
    preserve_self_like: bool,
    action: ActionMode,
    dry_run: bool,
    continue_to_end: bool,
    batch_size: u32,
    timeline: Timeline,
}

impl Default for CriteriaBuilder {
    fn default() -> Self {
        Self {
            max_age: None,
            before_date: None,
            preserve_pinned: false,
            preserve_self_like: false,
            action: ActionMode::Auto,
            dry_run: false,
            continue_to_end: true,
            batch_size: DEFAULT_BATCH_SIZE,
            timeline: Timeline::Posts,
        }
    }
}

impl CriteriaBuilder {
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn before_date(mut self, before_date: DateTime<Utc>) -> Self {
        self.before_date = Some(before_date);
        self
    }

    pub fn preserve_pinned(mut self, preserve: bool) -> Self {
        self.preserve_pinned = preserve;
        self
    }

    pub fn preserve_self_like(mut self, preserve: bool) -> Self {
        self.preserve_self_like = preserve;
        self
    }

    pub fn action(mut self, action: ActionMode) -> Self {
        self.action = action;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn continue_to_end(mut self, continue_to_end: bool) -> Self {
        self.continue_to_end = continue_to_end;
        self
    }

    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    /// Parse and set `max_age` from a human duration such as `30d` or `12h`
    pub fn max_age_str(self, input: &str) -> Result<Self> {
        let max_age = parse_max_age(input)?;
        Ok(self.max_age(max_age))
    }

    /// Parse and set `before_date` from a date string
    pub fn before_date_str(self, input: &str) -> Result<Self> {
        let before = parse_before_date(input, Utc::now())?;
        Ok(self.before_date(before))
    }

    /// Validate and build, using the current time for the future-date check
    pub fn build(self) -> Result<Criteria> {
        self.build_at(Utc::now())
    }

    pub fn build_at(self, now: DateTime<Utc>) -> Result<Criteria> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::invalid(
                "batch_size",
                format!("must be between 1 and {}", MAX_BATCH_SIZE),
            )
            .into());
        }

        if let Some(max_age) = self.max_age {
            if max_age <= Duration::zero() {
                return Err(ConfigError::invalid("max_age", "must be greater than zero").into());
            }
        }

        if let Some(before) = self.before_date {
            if before > now {
                return Err(ConfigError::invalid(
                    "before_date",
                    format!("{} is in the future", before.to_rfc3339()),
                )
                .into());
            }
        }

        Ok(Criteria {
            max_age: self.max_age,
            before_date: self.before_date,
            preserve_pinned: self.preserve_pinned,
            preserve_self_like: self.preserve_self_like,
            action: self.action,
            dry_run: self.dry_run,
            continue_to_end: self.continue_to_end,
            batch_size: self.batch_size,
            timeline: self.timeline,
        })
    }
}

/// Parse a maximum age such as `30d`, `2weeks` or `36h`
pub fn parse_max_age(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConfigError::invalid("max_age", "cannot be empty").into());
    }

    let std_duration = humantime::parse_duration(input)
        .map_err(|e| ConfigError::invalid("max_age", format!("'{}': {}", input, e)))?;

    Duration::from_std(std_duration)
        .map_err(|_| ConfigError::invalid("max_age", "duration out of range").into())
}

/// Parse a cut-off date
///
/// Accepts RFC 3339 timestamps, `YYYY-MM-DD` (midnight UTC), Unix
/// timestamps, and English expressions like `last month`.
pub fn parse_before_date(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConfigError::invalid("before_date", "cannot be empty").into());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    if let Ok(timestamp) = input.parse::<i64>() {
        return DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
            ConfigError::invalid("before_date", "timestamp out of range").into()
        });
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us)
        .map_err(|e| ConfigError::invalid("before_date", format!("'{}': {}", input, e)).into())
}
