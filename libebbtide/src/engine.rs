//! Pagination engine
//!
//! Drives one (platform, user, criteria) run: fetch a page, resolve every
//! item, act on the ones that qualify, then decide whether another page is
//! worth fetching. Each finished round is yielded immediately as a
//! [`RoundResult`], so callers observe progress while the walk goes on.
//!
//! A run ends for exactly one of three reasons ([`Termination`]), fails on a
//! fetch error, or stops early when its cancellation token fires. Rounds of
//! one run are strictly sequential: round N's actions and termination
//! decision complete before round N+1 starts.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use libebbtide::engine::Paginator;
//! use libebbtide::criteria::Criteria;
//! use libebbtide::platforms::Connector;
//! use libebbtide::rate_limiter::RateLimiter;
//! use libebbtide::types::Timeline;
//!
//! # async fn example(connector: Arc<dyn Connector>) {
//! let limiter = Arc::new(RateLimiter::default());
//! let run = Paginator::new(connector, limiter, "me", Criteria::listing(Timeline::Posts));
//!
//! let mut rounds = Box::pin(run.into_stream());
//! while let Some(round) = rounds.next().await {
//!     println!("round {}: {} items", round.round, round.items.len());
//! }
//! # }
//! ```

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::criteria::Criteria;
use crate::error::PlatformError;
use crate::platforms::{Connector, Page, PageRequest, TimelineOrder};
use crate::rate_limiter::RateLimiter;
use crate::resolver::{resolve, Disposition};
use crate::types::{Platform, Post};

/// Why a run stopped fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Empty page, empty next token, or a repeated token
    EndOfTimeline,
    /// An item past the age/date threshold was seen on a newest-first timeline
    AgeThresholdReached,
    /// `continue_to_end` was off and one page was processed
    SingleBatchComplete,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Termination::EndOfTimeline => "end of timeline",
            Termination::AgeThresholdReached => "age threshold reached",
            Termination::SingleBatchComplete => "single batch complete",
        };
        f.write_str(s)
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { reason: Termination },
    /// A page could not be fetched (or broke the ordering contract)
    Failed { error: String },
    Cancelled,
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }

    pub fn termination(&self) -> Option<Termination> {
        match self {
            RunOutcome::Completed { reason } => Some(*reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed { reason } => write!(f, "completed ({})", reason),
            RunOutcome::Failed { error } => write!(f, "failed: {}", error),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-disposition tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub kept: u64,
    pub deleted: u64,
    pub unliked: u64,
    pub unshared: u64,
    pub preserved: u64,
    pub errored: u64,
}

impl Counts {
    /// Count one processed item
    pub fn record(&mut self, item: &ItemResult) {
        if item.error.is_some() {
            self.errored += 1;
            return;
        }
        match item.disposition {
            Disposition::Keep => self.kept += 1,
            Disposition::Preserve => self.preserved += 1,
            Disposition::Delete => self.deleted += 1,
            Disposition::Unlike => self.unliked += 1,
            Disposition::Unshare => self.unshared += 1,
        }
    }

    /// Fold another set of counts into this one
    pub fn absorb(&mut self, other: &Counts) {
        self.kept += other.kept;
        self.deleted += other.deleted;
        self.unliked += other.unliked;
        self.unshared += other.unshared;
        self.preserved += other.preserved;
        self.errored += other.errored;
    }

    /// Items that were (or in a dry run would have been) acted on
    pub fn actions(&self) -> u64 {
        self.deleted + self.unliked + self.unshared
    }

    /// Every item processed
    pub fn total(&self) -> u64 {
        self.kept + self.preserved + self.actions() + self.errored
    }
}

/// What happened to one item of a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemResult {
    pub post: Post,
    pub disposition: Disposition,
    /// The action failed; the disposition says which action was attempted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The platform reported the item as already gone
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_gone: bool,
}

/// Outcome of one fetch/resolve/act round
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundResult {
    pub platform: Platform,
    /// 1-based round number within the run
    pub round: u32,
    /// Token the page was requested with
    pub token: String,
    /// Whether a page was fetched this round
    pub fetched: bool,
    pub counts: Counts,
    pub items: Vec<ItemResult>,
    /// `None` while the run continues; set on the final round
    pub outcome: Option<RunOutcome>,
}

impl RoundResult {
    fn new(platform: Platform, round: u32, token: String) -> Self {
        Self {
            platform,
            round,
            token,
            fetched: false,
            counts: Counts::default(),
            items: Vec::new(),
            outcome: None,
        }
    }

    pub fn should_continue(&self) -> bool {
        self.outcome.is_none()
    }

    fn finish(mut self, outcome: RunOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

/// Cursor state owned by one run
#[derive(Debug, Default)]
struct Cursor {
    token: String,
    round: u32,
    /// Timestamp of the last item seen, for the ordering check
    last_seen: Option<DateTime<Utc>>,
}

/// One pagination-and-pruning run
pub struct Paginator {
    connector: Arc<dyn Connector>,
    limiter: Arc<RateLimiter>,
    user: String,
    criteria: Criteria,
    cancel: CancellationToken,
    now: Option<DateTime<Utc>>,
}

impl Paginator {
    pub fn new(
        connector: Arc<dyn Connector>,
        limiter: Arc<RateLimiter>,
        user: impl Into<String>,
        criteria: Criteria,
    ) -> Self {
        Self {
            connector,
            limiter,
            user: user.into(),
            criteria,
            cancel: CancellationToken::new(),
            now: None,
        }
    }

    /// Stop the run at the next item or round boundary when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve ages against a fixed instant instead of the wall clock
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn platform(&self) -> Platform {
        self.connector.platform()
    }

    /// Consume the run and return its lazy stream of rounds
    ///
    /// The stream ends after the round whose `outcome` is set.
    pub fn into_stream(self) -> impl Stream<Item = RoundResult> + Send + 'static {
        async_stream::stream! {
            let mut cursor = Cursor::default();
            loop {
                let round = self.run_round(&mut cursor).await;
                let finished = !round.should_continue();
                yield round;
                if finished {
                    break;
                }
            }
        }
    }

    async fn run_round(&self, cursor: &mut Cursor) -> RoundResult {
        let platform = self.platform();
        cursor.round += 1;
        let result = RoundResult::new(platform, cursor.round, cursor.token.clone());

        if self.cancel.is_cancelled() {
            return result.finish(RunOutcome::Cancelled);
        }

        if cursor.round == 1 {
            self.limiter.record_call(platform);
        } else {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return result.finish(RunOutcome::Cancelled),
                _ = self.limiter.wait_turn(platform) => {}
            }
        }

        let request = PageRequest {
            user: self.user.clone(),
            token: cursor.token.clone(),
            batch_size: self.criteria.batch_size,
            timeline: self.criteria.timeline,
        };

        let mut result = result;
        result.fetched = true;

        let page = match self.connector.fetch_page(&request).await {
            Ok(page) => page,
            Err(e) => {
                warn!(platform = %platform, round = cursor.round, error = %e, "failed to fetch page");
                return result.finish(RunOutcome::Failed {
                    error: e.to_string(),
                });
            }
        };

        if page.items.is_empty() {
            debug!(platform = %platform, round = cursor.round, "empty page, end of timeline");
            return result.finish(RunOutcome::Completed {
                reason: Termination::EndOfTimeline,
            });
        }

        let order = self.connector.ordering(self.criteria.timeline);
        if order == TimelineOrder::NewestFirst {
            if let Err(e) = check_ordering(&page, cursor.last_seen) {
                warn!(platform = %platform, round = cursor.round, error = %e, "page out of order");
                return result.finish(RunOutcome::Failed {
                    error: e.to_string(),
                });
            }
        }

        let Page { items, next_token } = page;
        cursor.last_seen = items.last().map(|post| post.created_at);

        let (result, threshold_reached, cancelled) = self.process_items(result, items, order).await;

        info!(
            platform = %platform,
            round = result.round,
            items = result.items.len(),
            kept = result.counts.kept,
            actioned = result.counts.actions(),
            preserved = result.counts.preserved,
            errored = result.counts.errored,
            dry_run = self.criteria.dry_run,
            "round complete"
        );

        if cancelled {
            return result.finish(RunOutcome::Cancelled);
        }

        if threshold_reached {
            return result.finish(RunOutcome::Completed {
                reason: Termination::AgeThresholdReached,
            });
        }

        if !self.criteria.continue_to_end {
            return result.finish(RunOutcome::Completed {
                reason: Termination::SingleBatchComplete,
            });
        }

        if next_token.is_empty() || next_token == cursor.token {
            return result.finish(RunOutcome::Completed {
                reason: Termination::EndOfTimeline,
            });
        }

        cursor.token = next_token;
        result
    }

    /// Resolve and act on every item of a page, in page order
    ///
    /// Returns the filled round plus whether the threshold was crossed and
    /// whether the run was cancelled between items.
    async fn process_items(
        &self,
        mut result: RoundResult,
        items: Vec<Post>,
        order: TimelineOrder,
    ) -> (RoundResult, bool, bool) {
        let now = self.now.unwrap_or_else(Utc::now);
        let mut threshold_reached = false;
        let mut cancelled = false;

        for post in items {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let resolution = resolve(&post, &self.criteria, now);

            if resolution.threshold_crossed
                && order == TimelineOrder::NewestFirst
                && !threshold_reached
            {
                debug!(
                    platform = %result.platform,
                    post_id = %post.id,
                    created_at = %post.created_at,
                    "threshold crossed, no further pages will be fetched"
                );
                threshold_reached = true;
            }

            let mut item = ItemResult {
                post,
                disposition: resolution.disposition,
                error: None,
                already_gone: false,
            };

            if let Some(action) = resolution.disposition.action() {
                if self.criteria.dry_run {
                    debug!(post_id = %item.post.id, action = %action, "dry run, skipping action");
                } else {
                    match self.connector.execute(action, &item.post).await {
                        Ok(()) => {
                            debug!(post_id = %item.post.id, action = %action, "action applied");
                        }
                        Err(e) if e.as_platform().is_some_and(PlatformError::is_already_gone) => {
                            info!(post_id = %item.post.id, action = %action, "item already gone");
                            item.already_gone = true;
                        }
                        Err(e) => {
                            warn!(post_id = %item.post.id, action = %action, error = %e, "action failed");
                            item.error = Some(e.to_string());
                        }
                    }
                }
            }

            result.counts.record(&item);
            result.items.push(item);
        }

        (result, threshold_reached, cancelled)
    }
}

/// Check that `page` is newest-first and continues from `last_seen`
fn check_ordering(page: &Page, last_seen: Option<DateTime<Utc>>) -> Result<(), PlatformError> {
    let mut previous = last_seen;
    for post in &page.items {
        if let Some(previous) = previous {
            if post.created_at > previous {
                return Err(PlatformError::Ordering(format!(
                    "item {} ({}) is newer than the item before it ({})",
                    post.id,
                    post.created_at.to_rfc3339(),
                    previous.to_rfc3339()
                )));
            }
        }
        previous = Some(post.created_at);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Action;
    use crate::platforms::mock::{aged_pages, MockConfig, MockConnector};
    use crate::types::{PostKind, Timeline};
    use chrono::{Duration, TimeZone};
    use futures::StreamExt;
    use std::collections::{HashMap, HashSet};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn post(id: &str, days_old: i64) -> Post {
        Post::new(id, Platform::Mock, PostKind::Original, now() - Duration::days(days_old))
    }

    async fn collect(connector: Arc<MockConnector>, criteria: Criteria) -> Vec<RoundResult> {
        let limiter = Arc::new(RateLimiter::default());
        Paginator::new(connector, limiter, "me", criteria)
            .with_now(now())
            .into_stream()
            .collect()
            .await
    }

    fn last_outcome(rounds: &[RoundResult]) -> RunOutcome {
        rounds.last().and_then(|r| r.outcome.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_empty_timeline_ends_immediately() {
        let connector = Arc::new(MockConnector::with_pages(Platform::Mock, vec![]));
        let rounds = collect(Arc::clone(&connector), Criteria::builder().build().unwrap()).await;

        assert_eq!(rounds.len(), 1);
        assert_eq!(
            last_outcome(&rounds),
            RunOutcome::Completed {
                reason: Termination::EndOfTimeline
            }
        );
        assert_eq!(connector.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_repeated_token_ends_timeline() {
        let connector = Arc::new(MockConnector::new(MockConfig {
            pages: vec![vec![post("a", 1)], vec![post("b", 2)]],
            next_token_overrides: HashMap::from([(1, "page-1".to_string())]),
            ..Default::default()
        }));

        let rounds = collect(Arc::clone(&connector), Criteria::builder().build().unwrap()).await;

        assert_eq!(rounds.len(), 2);
        assert_eq!(
            last_outcome(&rounds).termination(),
            Some(Termination::EndOfTimeline)
        );
        assert_eq!(connector.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_single_batch_mode_fetches_one_page() {
        let pages = aged_pages(Platform::Mock, now(), 3, 2, Duration::days(1), Duration::hours(1));
        let connector = Arc::new(MockConnector::with_pages(Platform::Mock, pages));
        let criteria = Criteria::builder()
            .continue_to_end(false)
            .dry_run(true)
            .build_at(now())
            .unwrap();

        let rounds = collect(Arc::clone(&connector), criteria).await;

        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].counts.deleted, 2);
        assert_eq!(
            last_outcome(&rounds).termination(),
            Some(Termination::SingleBatchComplete)
        );
        assert_eq!(connector.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_age_threshold_scenario() {
        let connector = Arc::new(MockConnector::new(MockConfig {
            pages: vec![
                vec![post("post1", 5), post("post2", 40), post("post3", 90)],
                vec![post("post4", 120)],
            ],
            ..Default::default()
        }));
        let criteria = Criteria::builder()
            .max_age(Duration::days(30))
            .preserve_pinned(false)
            .build_at(now())
            .unwrap();

        let rounds = collect(Arc::clone(&connector), criteria).await;

        assert_eq!(rounds.len(), 1);
        let dispositions: Vec<_> = rounds[0]
            .items
            .iter()
            .map(|i| (i.post.id.as_str(), i.disposition))
            .collect();
        assert_eq!(
            dispositions,
            vec![
                ("post1", Disposition::Keep),
                ("post2", Disposition::Delete),
                ("post3", Disposition::Delete),
            ]
        );
        assert_eq!(
            last_outcome(&rounds).termination(),
            Some(Termination::AgeThresholdReached)
        );
        assert_eq!(connector.fetch_calls(), 1);
        assert_eq!(
            connector.executed(),
            vec![
                (Action::Delete, "post2".to_string()),
                (Action::Delete, "post3".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_keep_items_do_not_stop_the_walk() {
        let pages = vec![
            vec![post("a", 1), post("b", 2)],
            vec![post("c", 3), post("d", 4)],
            vec![post("e", 45)],
        ];
        let connector = Arc::new(MockConnector::with_pages(Platform::Mock, pages));
        let criteria = Criteria::builder()
            .max_age(Duration::days(30))
            .build_at(now())
            .unwrap();

        let rounds = collect(Arc::clone(&connector), criteria).await;

        assert_eq!(rounds.len(), 3);
        assert_eq!(rounds[0].counts.kept, 2);
        assert_eq!(rounds[2].counts.deleted, 1);
        assert_eq!(
            last_outcome(&rounds).termination(),
            Some(Termination::AgeThresholdReached)
        );
    }

    #[tokio::test]
    async fn test_preserved_old_post_does_not_trigger_early_stop() {
        let pages = vec![
            vec![post("young", 2), post("pinned", 100).pinned()],
            vec![post("old", 120)],
        ];
        let connector = Arc::new(MockConnector::with_pages(Platform::Mock, pages));
        let criteria = Criteria::builder()
            .max_age(Duration::days(30))
            .preserve_pinned(true)
            .build_at(now())
            .unwrap();

        let rounds = collect(Arc::clone(&connector), criteria).await;

        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].counts.preserved, 1);
        assert_eq!(rounds[1].counts.deleted, 1);
        assert_eq!(
            last_outcome(&rounds).termination(),
            Some(Termination::AgeThresholdReached)
        );
    }

    #[tokio::test]
    async fn test_unordered_timeline_walks_to_the_end() {
        let connector = Arc::new(MockConnector::new(MockConfig {
            pages: vec![vec![post("old", 90), post("new", 1)], vec![post("older", 100)]],
            ordering: TimelineOrder::Unordered,
            ..Default::default()
        }));
        let criteria = Criteria::builder()
            .max_age(Duration::days(30))
            .build_at(now())
            .unwrap();

        let rounds = collect(Arc::clone(&connector), criteria).await;

        assert_eq!(rounds.len(), 2);
        assert_eq!(connector.execute_calls(), 2);
        assert_eq!(
            last_outcome(&rounds).termination(),
            Some(Termination::EndOfTimeline)
        );
    }

    #[tokio::test]
    async fn test_out_of_order_page_is_a_fetch_error() {
        let connector = Arc::new(MockConnector::with_pages(
            Platform::Mock,
            vec![vec![post("a", 10), post("b", 2)]],
        ));

        let rounds = collect(Arc::clone(&connector), Criteria::builder().build().unwrap()).await;

        assert!(last_outcome(&rounds).is_failure());
        assert!(rounds[0].items.is_empty());
        assert_eq!(connector.execute_calls(), 0);
    }

    #[tokio::test]
    async fn test_ordering_checked_across_pages() {
        let connector = Arc::new(MockConnector::with_pages(
            Platform::Mock,
            vec![vec![post("a", 10)], vec![post("b", 2)]],
        ));
        let criteria = Criteria::builder().dry_run(true).build().unwrap();

        let rounds = collect(Arc::clone(&connector), criteria).await;

        assert_eq!(rounds.len(), 2);
        match last_outcome(&rounds) {
            RunOutcome::Failed { error } => assert!(error.contains("ordering")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_error_stops_the_run() {
        let pages = aged_pages(Platform::Mock, now(), 3, 2, Duration::days(1), Duration::hours(1));
        let connector = Arc::new(MockConnector::new(MockConfig {
            pages,
            failing_fetch_calls: HashSet::from([2]),
            ..Default::default()
        }));

        let rounds = collect(Arc::clone(&connector), Criteria::builder().build().unwrap()).await;

        assert_eq!(rounds.len(), 2);
        assert!(rounds[0].should_continue());
        assert!(rounds[1].fetched);
        assert!(last_outcome(&rounds).is_failure());
        assert_eq!(connector.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_action_errors_are_counted_and_run_continues() {
        let connector = Arc::new(MockConnector::new(MockConfig {
            pages: vec![vec![post("a", 1), post("b", 2), post("c", 3)]],
            failing_items: HashSet::from(["b".to_string()]),
            gone_items: HashSet::from(["c".to_string()]),
            ..Default::default()
        }));

        let rounds = collect(Arc::clone(&connector), Criteria::builder().build().unwrap()).await;

        let counts = rounds[0].counts;
        assert_eq!(counts.deleted, 2);
        assert_eq!(counts.errored, 1);
        assert!(rounds[0].items[1].error.is_some());
        assert!(rounds[0].items[2].already_gone);
        assert_eq!(connector.execute_calls(), 3);
        assert_eq!(
            last_outcome(&rounds).termination(),
            Some(Termination::EndOfTimeline)
        );
    }

    #[tokio::test]
    async fn test_dry_run_never_executes_and_counts_match() {
        let pages = aged_pages(Platform::Mock, now(), 2, 3, Duration::days(20), Duration::days(5));

        let dry = Arc::new(MockConnector::with_pages(Platform::Mock, pages.clone()));
        let wet = Arc::new(MockConnector::with_pages(Platform::Mock, pages));
        let base = Criteria::builder().max_age(Duration::days(30));

        let dry_rounds = collect(Arc::clone(&dry), base.clone().dry_run(true).build_at(now()).unwrap()).await;
        let wet_rounds = collect(Arc::clone(&wet), base.dry_run(false).build_at(now()).unwrap()).await;

        assert_eq!(dry.execute_calls(), 0);
        assert!(wet.execute_calls() > 0);

        let dry_counts: Vec<_> = dry_rounds.iter().map(|r| r.counts).collect();
        let wet_counts: Vec<_> = wet_rounds.iter().map(|r| r.counts).collect();
        assert_eq!(dry_counts, wet_counts);
    }

    #[tokio::test]
    async fn test_page_request_carries_criteria() {
        let connector = Arc::new(MockConnector::with_pages(Platform::Mock, vec![vec![post("a", 1)]]));
        let criteria = Criteria::builder()
            .batch_size(7)
            .timeline(Timeline::Likes)
            .dry_run(true)
            .build()
            .unwrap();

        collect(Arc::clone(&connector), criteria).await;

        let requests = connector.fetch_requests();
        assert_eq!(requests[0].batch_size, 7);
        assert_eq!(requests[0].timeline, Timeline::Likes);
        assert_eq!(requests[0].user, "me");
        assert!(requests[0].is_first());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let connector = Arc::new(MockConnector::with_pages(Platform::Mock, vec![vec![post("a", 1)]]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let rounds: Vec<_> = Paginator::new(
            connector.clone(),
            Arc::new(RateLimiter::default()),
            "me",
            Criteria::builder().build().unwrap(),
        )
        .with_cancellation(cancel)
        .into_stream()
        .collect()
        .await;

        assert_eq!(rounds.len(), 1);
        assert_eq!(last_outcome(&rounds), RunOutcome::Cancelled);
        assert!(!rounds[0].fetched);
        assert_eq!(connector.fetch_calls(), 0);
    }

    /// Delegates to a mock and cancels the run from inside `execute`
    struct CancelOnExecute {
        inner: Arc<MockConnector>,
        cancel: CancellationToken,
    }

    #[async_trait::async_trait]
    impl Connector for CancelOnExecute {
        fn platform(&self) -> Platform {
            self.inner.platform()
        }

        async fn fetch_page(&self, request: &PageRequest) -> crate::error::Result<Page> {
            self.inner.fetch_page(request).await
        }

        async fn execute(&self, action: Action, post: &Post) -> crate::error::Result<()> {
            self.cancel.cancel();
            self.inner.execute(action, post).await
        }

        fn rate_limit_interval(&self) -> std::time::Duration {
            self.inner.rate_limit_interval()
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_page_finishes_in_flight_action() {
        let inner = Arc::new(MockConnector::with_pages(
            Platform::Mock,
            vec![vec![post("a", 10), post("b", 11), post("c", 12)], vec![post("d", 13)]],
        ));
        let cancel = CancellationToken::new();
        let connector = Arc::new(CancelOnExecute {
            inner: Arc::clone(&inner),
            cancel: cancel.clone(),
        });

        let rounds: Vec<_> = Paginator::new(
            connector,
            Arc::new(RateLimiter::default()),
            "me",
            Criteria::builder().build().unwrap(),
        )
        .with_cancellation(cancel)
        .with_now(now())
        .into_stream()
        .collect()
        .await;

        assert_eq!(rounds.len(), 1);
        assert_eq!(last_outcome(&rounds), RunOutcome::Cancelled);
        assert_eq!(rounds[0].items.len(), 1);
        assert_eq!(rounds[0].counts.deleted, 1);
        assert_eq!(inner.executed(), vec![(Action::Delete, "a".to_string())]);
        assert_eq!(inner.fetch_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_rate_limit_wait() {
        let connector = Arc::new(MockConnector::with_pages(
            Platform::Mock,
            vec![vec![post("a", 10)], vec![post("b", 11)]],
        ));
        let limiter = Arc::new(RateLimiter::new(HashMap::from([(
            Platform::Mock,
            std::time::Duration::from_secs(60),
        )])));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let rounds: Vec<_> = Paginator::new(
            connector.clone(),
            limiter,
            "me",
            Criteria::builder().dry_run(true).build().unwrap(),
        )
        .with_cancellation(cancel)
        .with_now(now())
        .into_stream()
        .collect()
        .await;

        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].counts.deleted, 1);
        assert!(!rounds[1].fetched);
        assert_eq!(last_outcome(&rounds), RunOutcome::Cancelled);
        assert_eq!(connector.fetch_calls(), 1);
        assert!(start.elapsed() < std::time::Duration::from_secs(60));
    }

    #[test]
    fn test_counts_fold() {
        let mut total = Counts::default();
        let round = Counts {
            kept: 1,
            deleted: 2,
            unliked: 3,
            unshared: 4,
            preserved: 5,
            errored: 6,
        };
        total.absorb(&round);
        total.absorb(&round);

        assert_eq!(total.actions(), 18);
        assert_eq!(total.total(), 42);
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = RunOutcome::Completed {
            reason: Termination::AgeThresholdReached,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["reason"], "age_threshold_reached");

        let json = serde_json::to_value(RunOutcome::Failed {
            error: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
    }
}
