//! Shared run status for service mode
//!
//! The [`StatusBoard`] is the only structure written by more than one task.
//! Every update takes the write lock, copies plain data in, and releases it;
//! the lock is never held across an `.await`. Readers get a full copy taken
//! under the read lock, so they never observe a half-applied update.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::engine::{Counts, RunOutcome};
use crate::orchestrator::Summary;
use crate::types::Platform;

/// Live status of one platform's service loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_secs")]
    pub last_duration: Option<Duration>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub failed_runs: u64,
    pub cumulative: Counts,
    /// Error of the most recent run, cleared when a run succeeds
    pub last_error: Option<String>,
    pub last_outcome: Option<RunOutcome>,
}

fn serialize_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// Thread-safe map of platform to [`RunStatus`]
///
/// Cloning the board clones the handle; all clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<BTreeMap<Platform, RunStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an idle entry for `platform` if it has none
    pub fn register(&self, platform: Platform) {
        let mut board = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        board.entry(platform).or_default();
    }

    /// Mark a pass as started
    pub fn mark_started(&self, platform: Platform, at: DateTime<Utc>) {
        {
            let mut board = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let status = board.entry(platform).or_default();
            status.running = true;
            status.last_run_at = Some(at);
            status.next_run_at = None;
        }

        metrics::gauge!("ebbtide_running", "platform" => platform.as_str()).set(1.0);
    }

    /// Fold a finished pass into the platform's status
    pub fn mark_finished(
        &self,
        platform: Platform,
        summary: &Summary,
        duration: Duration,
        next_run_at: Option<DateTime<Utc>>,
    ) {
        {
            let mut board = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let status = board.entry(platform).or_default();
            status.running = false;
            status.last_duration = Some(duration);
            status.next_run_at = next_run_at;
            status.total_runs += 1;
            status.cumulative.absorb(&summary.counts);
            status.last_outcome = summary.outcome.clone();
            status.last_error = match &summary.outcome {
                Some(RunOutcome::Failed { error }) => Some(error.clone()),
                _ => None,
            };
            if summary.is_failure() {
                status.failed_runs += 1;
            }
        }

        record_metrics(platform, summary, duration);
    }

    /// Consistent copy of every platform's status
    pub fn snapshot(&self) -> BTreeMap<Platform, RunStatus> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Copy of one platform's status
    pub fn get(&self, platform: Platform) -> Option<RunStatus> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&platform)
            .cloned()
    }
}

fn record_metrics(platform: Platform, summary: &Summary, duration: Duration) {
    let label = platform.as_str();

    metrics::gauge!("ebbtide_running", "platform" => label).set(0.0);
    metrics::counter!("ebbtide_runs_total", "platform" => label).increment(1);
    if summary.is_failure() {
        metrics::counter!("ebbtide_run_failures_total", "platform" => label).increment(1);
    }
    metrics::histogram!("ebbtide_run_duration_seconds", "platform" => label)
        .record(duration.as_secs_f64());

    let counts = &summary.counts;
    for (action, value) in [
        ("keep", counts.kept),
        ("delete", counts.deleted),
        ("unlike", counts.unliked),
        ("unshare", counts.unshared),
        ("preserve", counts.preserved),
        ("error", counts.errored),
    ] {
        if value > 0 {
            metrics::counter!("ebbtide_items_total", "platform" => label, "action" => action)
                .increment(value);
        }
    }
}
