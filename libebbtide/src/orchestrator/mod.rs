//! Run orchestration
//!
//! The [`Orchestrator`] owns the configured connectors and the shared rate
//! limiter. It starts one-shot runs (a single platform, or every platform
//! concurrently) and folds their rounds into a [`Summary`]. Service mode
//! lives in [`service`] and reports through the [`status::StatusBoard`].

use futures::{Stream, StreamExt};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::criteria::Criteria;
use crate::engine::{Counts, Paginator, RoundResult, RunOutcome};
use crate::error::{EbbtideError, Result};
use crate::platforms::{create_connectors, Connector, ConnectorSet};
use crate::rate_limiter::RateLimiter;
use crate::types::Platform;

pub mod service;
pub mod status;

pub use service::Service;
pub use status::{RunStatus, StatusBoard};

/// One (platform, user) pair to run against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub platform: Platform,
    /// Account to walk; empty means the authenticated account
    pub user: String,
}

impl Target {
    pub fn new(platform: Platform, user: impl Into<String>) -> Self {
        Self {
            platform,
            user: user.into(),
        }
    }

    /// The authenticated account on `platform`
    pub fn own(platform: Platform) -> Self {
        Self::new(platform, "")
    }
}

/// Aggregated result of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub platform: Platform,
    pub user: String,
    pub counts: Counts,
    pub rounds: u32,
    /// Number of page fetches attempted
    pub fetches: u32,
    pub outcome: Option<RunOutcome>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

fn serialize_secs<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

impl Summary {
    pub fn new(platform: Platform, user: impl Into<String>) -> Self {
        Self {
            platform,
            user: user.into(),
            counts: Counts::default(),
            rounds: 0,
            fetches: 0,
            outcome: None,
            duration: Duration::ZERO,
        }
    }

    /// A run that never started
    pub fn failed(platform: Platform, user: impl Into<String>, error: impl Into<String>) -> Self {
        let mut summary = Self::new(platform, user);
        summary.outcome = Some(RunOutcome::Failed {
            error: error.into(),
        });
        summary
    }

    /// Fold one round into the totals
    pub fn absorb(&mut self, round: &RoundResult) {
        self.rounds += 1;
        if round.fetched {
            self.fetches += 1;
        }
        self.counts.absorb(&round.counts);
        if round.outcome.is_some() {
            self.outcome = round.outcome.clone();
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome.as_ref().is_some_and(RunOutcome::is_failure)
    }
}

/// Entry point for runs against configured platforms
pub struct Orchestrator {
    connectors: ConnectorSet,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator over `connectors`
    ///
    /// Each connector's declared interval becomes its platform's default
    /// rate limit.
    pub fn new(connectors: ConnectorSet) -> Self {
        let limiter = RateLimiter::default();
        for (platform, connector) in &connectors {
            limiter.set_default(*platform, connector.rate_limit_interval());
        }

        Self {
            connectors,
            limiter: Arc::new(limiter),
            cancel: CancellationToken::new(),
        }
    }

    /// Connect to `platforms` as configured, applying rate limit overrides
    ///
    /// # Errors
    ///
    /// Returns configuration and authentication errors from the connectors.
    pub async fn from_config(config: &Config, platforms: &[Platform]) -> Result<Self> {
        let connectors = create_connectors(config, Some(platforms)).await?;
        Ok(Self::new(connectors).with_rate_limits(config.rate_limit_overrides()?))
    }

    /// Override rate limit intervals per platform
    pub fn with_rate_limits(self, overrides: HashMap<Platform, Duration>) -> Self {
        for (platform, interval) in overrides {
            self.limiter.set_interval(platform, interval);
        }
        self
    }

    /// Cancel every run started by this orchestrator when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Platforms with a registered connector, in stable order
    pub fn platforms(&self) -> Vec<Platform> {
        self.connectors.keys().copied().collect()
    }

    pub fn connector(&self, platform: Platform) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&platform).cloned()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// A run of `criteria` against `user` on `platform`, not yet started
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if no connector is registered for `platform`.
    pub fn paginator(&self, platform: Platform, user: &str, criteria: Criteria) -> Result<Paginator> {
        let connector = self.connector(platform).ok_or_else(|| {
            EbbtideError::InvalidInput(format!("platform '{}' is not configured", platform))
        })?;

        Ok(
            Paginator::new(connector, Arc::clone(&self.limiter), user, criteria)
                .with_cancellation(self.cancel.child_token()),
        )
    }

    /// Start a run and return its stream of rounds
    pub fn run(
        &self,
        platform: Platform,
        user: &str,
        criteria: Criteria,
    ) -> Result<impl Stream<Item = RoundResult> + Send + 'static> {
        Ok(self.paginator(platform, user, criteria)?.into_stream())
    }

    /// Run to completion, handing each round to `observer` as it arrives
    pub async fn run_to_summary<F>(
        &self,
        platform: Platform,
        user: &str,
        criteria: Criteria,
        observer: F,
    ) -> Result<Summary>
    where
        F: FnMut(&RoundResult),
    {
        let paginator = self.paginator(platform, user, criteria)?;
        Ok(drive(paginator, user, observer).await)
    }

    /// Run every target concurrently
    ///
    /// One summary per target, in target order. A target whose run fails,
    /// or whose platform is not configured, yields a failed summary and
    /// never affects the others.
    pub async fn run_all<F>(&self, targets: &[Target], criteria: &Criteria, observer: F) -> Vec<Summary>
    where
        F: Fn(&RoundResult) + Sync,
    {
        let observer = &observer;
        let runs = targets.iter().map(|target| async move {
            match self
                .run_to_summary(target.platform, &target.user, criteria.clone(), |round| observer(round))
                .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(platform = %target.platform, error = %e, "run could not start");
                    Summary::failed(target.platform, target.user.clone(), e.to_string())
                }
            }
        });

        futures::future::join_all(runs).await
    }
}

/// Consume a run, folding its rounds into a [`Summary`]
pub(crate) async fn drive<F>(paginator: Paginator, user: &str, mut observer: F) -> Summary
where
    F: FnMut(&RoundResult),
{
    let platform = paginator.platform();
    let started = Instant::now();
    let mut summary = Summary::new(platform, user);

    let mut rounds = Box::pin(paginator.into_stream());
    while let Some(round) = rounds.next().await {
        observer(&round);
        summary.absorb(&round);
    }

    summary.duration = started.elapsed();

    match &summary.outcome {
        Some(RunOutcome::Failed { error }) => {
            warn!(platform = %platform, rounds = summary.rounds, error = %error, "run failed")
        }
        Some(outcome) => info!(
            platform = %platform,
            rounds = summary.rounds,
            actioned = summary.counts.actions(),
            outcome = %outcome,
            "run finished"
        ),
        None => {}
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Termination;
    use crate::platforms::mock::{aged_pages, MockConfig, MockConnector};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn orchestrator_with(mocks: Vec<MockConnector>) -> Orchestrator {
        let mut connectors = ConnectorSet::new();
        for mock in mocks {
            connectors.insert(mock.platform(), Arc::new(mock));
        }
        Orchestrator::new(connectors)
    }

    fn pages(platform: Platform, count: usize, per_page: usize) -> Vec<Vec<crate::types::Post>> {
        aged_pages(
            platform,
            Utc::now(),
            count,
            per_page,
            ChronoDuration::days(60),
            ChronoDuration::hours(1),
        )
    }

    #[tokio::test]
    async fn test_run_to_summary_observes_every_round() {
        let orchestrator = orchestrator_with(vec![MockConnector::with_pages(
            Platform::Mock,
            pages(Platform::Mock, 3, 2),
        )]);
        let criteria = Criteria::builder().dry_run(true).build().unwrap();

        let mut seen = Vec::new();
        let summary = orchestrator
            .run_to_summary(Platform::Mock, "me", criteria, |round| seen.push(round.round))
            .await
            .unwrap();

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(summary.rounds, 3);
        assert_eq!(summary.fetches, 3);
        assert_eq!(summary.counts.deleted, 6);
        assert_eq!(
            summary.outcome,
            Some(RunOutcome::Completed {
                reason: Termination::EndOfTimeline
            })
        );
        assert!(!summary.is_failure());
    }

    #[tokio::test]
    async fn test_unknown_platform_is_rejected() {
        let orchestrator = orchestrator_with(vec![]);
        let criteria = Criteria::builder().build().unwrap();

        let result = orchestrator.run(Platform::Bluesky, "me", criteria);
        assert!(matches!(result, Err(EbbtideError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_run_all_isolates_failures() {
        let young = |platform| {
            aged_pages(
                platform,
                Utc::now(),
                3,
                2,
                ChronoDuration::days(1),
                ChronoDuration::days(1),
            )
        };
        let failing = MockConnector::new(MockConfig {
            platform: Platform::Bluesky,
            pages: young(Platform::Bluesky),
            failing_fetch_calls: HashSet::from([2]),
            ..Default::default()
        });
        let healthy = MockConnector::with_pages(Platform::Mastodon, young(Platform::Mastodon));
        let orchestrator = orchestrator_with(vec![failing, healthy]);

        let targets = vec![
            Target::own(Platform::Bluesky),
            Target::own(Platform::Mastodon),
            Target::own(Platform::Mock),
        ];
        let criteria = Criteria::builder()
            .max_age(ChronoDuration::days(30))
            .build()
            .unwrap();
        let observed = Mutex::new(0);

        let summaries = orchestrator
            .run_all(&targets, &criteria, |_| *observed.lock().unwrap() += 1)
            .await;

        assert_eq!(summaries.len(), 3);
        assert!(summaries[0].is_failure());
        assert_eq!(summaries[0].rounds, 2);
        assert_eq!(summaries[0].counts.kept, 2);
        assert!(!summaries[1].is_failure());
        assert_eq!(summaries[1].counts.kept, 6);
        assert_eq!(
            summaries[1].outcome.as_ref().and_then(RunOutcome::termination),
            Some(Termination::EndOfTimeline)
        );
        // Mock platform was never configured
        assert!(summaries[2].is_failure());
        assert_eq!(summaries[2].rounds, 0);
        assert_eq!(*observed.lock().unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hundred_posts_ten_pages() {
        let mock = Arc::new(MockConnector::new(MockConfig {
            pages: pages(Platform::Mock, 10, 10),
            interval: Duration::from_secs(1),
            ..Default::default()
        }));
        let mut connectors = ConnectorSet::new();
        connectors.insert(Platform::Mock, Arc::clone(&mock) as Arc<dyn Connector>);
        let orchestrator = Orchestrator::new(connectors);

        let criteria = Criteria::builder().batch_size(10).build().unwrap();
        let summary = orchestrator
            .run_to_summary(Platform::Mock, "me", criteria, |_| {})
            .await
            .unwrap();

        assert_eq!(summary.counts.deleted, 100);
        assert_eq!(mock.execute_calls(), 100);
        assert_eq!(mock.fetch_calls(), 10);
        assert_eq!(orchestrator.limiter().wait_count(Platform::Mock), 9);
        assert!(summary.duration >= Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_rate_limit_override() {
        let orchestrator = orchestrator_with(vec![MockConnector::new(MockConfig {
            interval: Duration::from_secs(5),
            ..Default::default()
        })])
        .with_rate_limits(HashMap::from([(Platform::Mock, Duration::from_millis(10))]));

        assert_eq!(
            orchestrator.limiter().interval(Platform::Mock),
            Duration::from_millis(10)
        );
        assert_eq!(orchestrator.platforms(), vec![Platform::Mock]);
    }

    #[tokio::test]
    async fn test_cancellation_propagates_to_runs() {
        let cancel = CancellationToken::new();
        let orchestrator = orchestrator_with(vec![MockConnector::with_pages(
            Platform::Mock,
            pages(Platform::Mock, 2, 2),
        )])
        .with_cancellation(cancel.clone());
        cancel.cancel();

        let summary = orchestrator
            .run_to_summary(Platform::Mock, "me", Criteria::builder().build().unwrap(), |_| {})
            .await
            .unwrap();

        assert_eq!(summary.outcome, Some(RunOutcome::Cancelled));
        assert_eq!(summary.fetches, 0);
    }

    #[test]
    fn test_summary_serializes_duration_as_seconds() {
        let mut summary = Summary::new(Platform::Mastodon, "me");
        summary.duration = Duration::from_millis(2500);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["duration"], 2.5);
        assert_eq!(json["platform"], "mastodon");
    }
}
