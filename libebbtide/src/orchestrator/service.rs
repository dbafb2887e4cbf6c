//! Service mode
//!
//! One long-lived tokio task per target platform. Each task runs a full
//! pass immediately, records the outcome on the shared [`StatusBoard`],
//! then sleeps for the configured interval measured from the end of the
//! pass. A failed pass is logged and retried on the next tick; it never
//! stops the other platforms.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::criteria::Criteria;
use crate::orchestrator::{drive, Orchestrator, RunStatus, StatusBoard, Summary, Target};
use crate::types::Platform;

/// Handle to a running service
pub struct Service {
    board: StatusBoard,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Spawn one repeating task per target
    ///
    /// The service stops when `cancel` (or any parent of it) fires, or when
    /// [`Service::shutdown`] is called.
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        cancel: CancellationToken,
        targets: Vec<Target>,
        criteria: Criteria,
        interval: Duration,
    ) -> Self {
        let board = StatusBoard::new();
        let cancel = cancel.child_token();

        let tasks = targets
            .into_iter()
            .map(|target| {
                board.register(target.platform);
                let worker = Worker {
                    orchestrator: Arc::clone(&orchestrator),
                    board: board.clone(),
                    cancel: cancel.clone(),
                    target,
                    criteria: criteria.clone(),
                    interval,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(interval_secs = interval.as_secs(), "service started");

        Self {
            board,
            cancel,
            tasks,
        }
    }

    /// Handle to the live status board
    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Consistent copy of every platform's status
    pub fn snapshot(&self) -> BTreeMap<Platform, RunStatus> {
        self.board.snapshot()
    }

    /// Cancel every task and wait for all of them to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Wait for every task to exit without cancelling them
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "service task ended abnormally");
            }
        }
        info!("service stopped");
    }
}

struct Worker {
    orchestrator: Arc<Orchestrator>,
    board: StatusBoard,
    cancel: CancellationToken,
    target: Target,
    criteria: Criteria,
    interval: Duration,
}

impl Worker {
    async fn run(self) {
        let platform = self.target.platform;

        while !self.cancel.is_cancelled() {
            self.board.mark_started(platform, Utc::now());
            let started = Instant::now();

            let summary = self.pass().await;

            let duration = started.elapsed();
            let next_run_at = (!self.cancel.is_cancelled())
                .then(|| chrono::Duration::from_std(self.interval).ok())
                .flatten()
                .map(|interval| Utc::now() + interval);
            self.board
                .mark_finished(platform, &summary, duration, next_run_at);

            debug!(
                platform = %platform,
                duration_ms = duration.as_millis() as u64,
                "pass recorded, sleeping until next tick"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }

        debug!(platform = %platform, "service task exiting");
    }

    async fn pass(&self) -> Summary {
        let Target { platform, user } = &self.target;

        match self
            .orchestrator
            .paginator(*platform, user, self.criteria.clone())
        {
            Ok(paginator) => {
                drive(paginator.with_cancellation(self.cancel.clone()), user, |_| {}).await
            }
            Err(e) => {
                warn!(platform = %platform, error = %e, "pass could not start");
                Summary::failed(*platform, user.clone(), e.to_string())
            }
        }
    }
}
