//! Runtime instance of a test campaign.
//!
//! An execution launches bidirectional traffic sessions for each resolved
//! asset, persists one result row per direction, and tracks the live session
//! ids so that [`TestExecution::stop`] can cancel them, or
//! [`TestExecution::complete`] can wait for them to end on their own.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::iperf::{self, SessionMetrics};
use super::{Asset, Strategy, TestDefinition, TestStatus};
use crate::controlplane::{ControlPlane, TrafficRequest};
use crate::storage::{records, NewResult, Pool, StorageError};

const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    NotStarted,
    Running,
    Completed,
    Cancelled,
}

/// A live traffic session and the result row that records it.
#[derive(Debug, Clone)]
struct TrackedSession {
    result_id: i64,
    session_id: String,
}

/// Final disposition of one tracked session after [`TestExecution::stop`].
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub result_id: i64,
    pub session_id: String,
    pub status: TestStatus,
    pub metrics: Option<SessionMetrics>,
    pub output: Option<String>,
}

/// What [`TestExecution::stop`] did with the sessions it was tracking.
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub tracked: usize,
    pub outcomes: Vec<SessionOutcome>,
}

impl StopReport {
    fn count(&self, status: TestStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Sessions that were still live and accepted a stop request.
    pub fn cancelled(&self) -> usize {
        self.count(TestStatus::Aborted)
    }

    /// Sessions that were still live but rejected the stop request.
    pub fn failed(&self) -> usize {
        self.count(TestStatus::Failed)
    }

    /// Sessions that had already ended on their own.
    pub fn completed(&self) -> usize {
        self.count(TestStatus::Finished)
    }

    /// True when at least one session was tracked and every one was cancelled.
    pub fn all_cancelled(&self) -> bool {
        self.tracked > 0 && self.cancelled() == self.tracked
    }
}

/// Shared state between the execution handle and its background task.
#[derive(Clone)]
struct Runner {
    definition: Arc<TestDefinition>,
    control_plane: Arc<dyn ControlPlane>,
    pool: Pool,
    sessions: Arc<Mutex<Vec<TrackedSession>>>,
    state: Arc<Mutex<ExecutionState>>,
    cancel: CancellationToken,
}

pub struct TestExecution {
    runner: Runner,
    execution_id: Option<i64>,
    task: Option<JoinHandle<()>>,
}

impl TestExecution {
    pub fn new(definition: TestDefinition, control_plane: Arc<dyn ControlPlane>, pool: Pool) -> Self {
        Self {
            runner: Runner {
                definition: Arc::new(definition),
                control_plane,
                pool,
                sessions: Arc::new(Mutex::new(Vec::new())),
                state: Arc::new(Mutex::new(ExecutionState::NotStarted)),
                cancel: CancellationToken::new(),
            },
            execution_id: None,
            task: None,
        }
    }

    pub async fn state(&self) -> ExecutionState {
        *self.runner.state.lock().await
    }

    /// Spawn the execution task for `execution_id` over `assets`.
    pub fn start(&mut self, execution_id: i64, assets: Vec<Asset>) {
        if self.task.is_some() {
            warn!(execution_id, "execution already started");
            return;
        }

        self.execution_id = Some(execution_id);
        let runner = self.runner.clone();
        self.task = Some(tokio::spawn(async move {
            runner.run(execution_id, assets).await;
        }));
    }

    /// Wait for the execution task to finish on its own.
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(execution_id = ?self.execution_id, error = %e, "execution task panicked");
            }
        }
    }

    /// Cancel the task, wait for it to acknowledge, then stop every tracked
    /// session that is still live on the control plane.
    pub async fn stop(&mut self) -> StopReport {
        self.runner.cancel.cancel();
        self.wait().await;

        let tracked: Vec<TrackedSession> = std::mem::take(&mut *self.runner.sessions.lock().await);
        let report = self.runner.stop_sessions(tracked).await;

        if report.failed() > 0 {
            warn!(
                execution_id = ?self.execution_id,
                tracked = report.tracked,
                cancelled = report.cancelled(),
                failed = report.failed(),
                "some sessions could not be stopped"
            );
        }

        report
    }

    /// Treat the execution as having run its course, allowing up to `grace`
    /// for the task and its sessions to end on their own. Sessions that
    /// ended are FINISHED with metrics; anything still live afterwards is
    /// stopped.
    pub async fn complete(&mut self, grace: Duration) -> StopReport {
        let until = Instant::now() + grace;

        if let Some(task) = self.task.as_mut() {
            let finished = match tokio::time::timeout(grace, task).await {
                Ok(joined) => {
                    if let Err(e) = joined {
                        error!(execution_id = ?self.execution_id, error = %e, "execution task panicked");
                    }
                    true
                }
                Err(_) => false,
            };
            if finished {
                self.task = None;
            } else {
                warn!(execution_id = ?self.execution_id, ?grace, "execution overran its estimated duration");
            }
        }
        self.runner.cancel.cancel();
        self.wait().await;

        let tracked: Vec<TrackedSession> = std::mem::take(&mut *self.runner.sessions.lock().await);
        let active = self.runner.wait_for_sessions(&tracked, until).await;
        let report = self.runner.settle_sessions(tracked, active).await;

        if report.cancelled() + report.failed() > 0 {
            warn!(
                execution_id = ?self.execution_id,
                tracked = report.tracked,
                cancelled = report.cancelled(),
                failed = report.failed(),
                "sessions still running after the grace period were stopped"
            );
        }

        report
    }
}

impl Runner {
    fn network(&self) -> &str {
        &self.definition.network_name
    }

    async fn run(self, execution_id: i64, assets: Vec<Asset>) {
        *self.state.lock().await = ExecutionState::Running;
        info!(
            execution_id,
            network = %self.network(),
            test_type = %self.definition.test_type,
            assets = assets.len(),
            "starting test execution"
        );
        debug!(options = ?self.definition.options, allow_list = ?self.definition.allow_list, "test options");

        let outcome = match self.definition.test_type.strategy() {
            Strategy::Parallel => self.run_parallel(execution_id, &assets).await,
            Strategy::Sequential | Strategy::Multihop => {
                self.run_sequential(execution_id, &assets).await
            }
        };

        let state = match outcome {
            Ok(state) => state,
            Err(e) => {
                error!(execution_id, error = %e, "failed to record test results");
                ExecutionState::Completed
            }
        };
        *self.state.lock().await = state;
        debug!(execution_id, ?state, "execution task exited");
    }

    /// Launch every asset at once. Completion is driven by the scheduler's
    /// deadline, not by waiting here.
    async fn run_parallel(
        &self,
        execution_id: i64,
        assets: &[Asset],
    ) -> Result<ExecutionState, StorageError> {
        if self.cancel.is_cancelled() {
            self.abort_assets(execution_id, assets)?;
            return Ok(ExecutionState::Cancelled);
        }

        let launches = assets.iter().map(|asset| self.start_pair(asset));
        let started = join_all(launches).await;

        for (asset, outcomes) in assets.iter().zip(started) {
            self.record_pair(execution_id, asset, outcomes).await?;
        }

        Ok(ExecutionState::Completed)
    }

    /// Process one asset at a time, waiting out each session window.
    async fn run_sequential(
        &self,
        execution_id: i64,
        assets: &[Asset],
    ) -> Result<ExecutionState, StorageError> {
        let window = self.definition.session_duration();

        for (i, asset) in assets.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.abort_assets(execution_id, &assets[i..])?;
                return Ok(ExecutionState::Cancelled);
            }

            info!(execution_id, asset = %asset.name, "processing asset ({}/{})", i + 1, assets.len());
            self.sessions.lock().await.clear();

            let outcomes = self.start_pair(asset).await;
            let started = self.record_pair(execution_id, asset, outcomes).await?;

            // Skip the wait when neither direction started.
            if started == 0 {
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.abort_assets(execution_id, &assets[i + 1..])?;
                    return Ok(ExecutionState::Cancelled);
                }
                _ = tokio::time::sleep(window) => {}
            }

            let finished: Vec<TrackedSession> = std::mem::take(&mut *self.sessions.lock().await);
            for session in finished {
                let (metrics, output) = self.collect_metrics(&session.session_id).await;
                let conn = self.pool.get()?;
                records::finish_result(
                    &conn,
                    session.result_id,
                    TestStatus::Finished,
                    metrics.as_ref(),
                    output.as_deref(),
                )?;
            }
        }

        Ok(ExecutionState::Completed)
    }

    /// Start both directions of `asset` concurrently.
    async fn start_pair(&self, asset: &Asset) -> [(TrafficRequest, Option<String>); 2] {
        let forward = TrafficRequest {
            src_node_id: asset.src_node_mac.clone(),
            dst_node_id: asset.dst_node_mac.clone(),
            options: self.definition.options.clone(),
        };
        let reverse = TrafficRequest {
            src_node_id: asset.dst_node_mac.clone(),
            dst_node_id: asset.src_node_mac.clone(),
            options: self.definition.options.clone(),
        };

        let network = self.network();
        let (fwd, rev) = tokio::join!(
            self.control_plane.start_traffic(network, &forward),
            self.control_plane.start_traffic(network, &reverse)
        );

        let accept = |request: &TrafficRequest, outcome| match outcome {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    network = %network,
                    src = %request.src_node_id,
                    dst = %request.dst_node_id,
                    error = %e,
                    "failed to start traffic session"
                );
                None
            }
        };
        let fwd = accept(&forward, fwd);
        let rev = accept(&reverse, rev);

        [(forward, fwd), (reverse, rev)]
    }

    /// Persist one row per direction and track the sessions that started.
    /// Returns how many sessions started.
    async fn record_pair(
        &self,
        execution_id: i64,
        asset: &Asset,
        outcomes: [(TrafficRequest, Option<String>); 2],
    ) -> Result<usize, StorageError> {
        let mut started = 0;
        for (request, session_id) in outcomes {
            let status = if session_id.is_some() {
                TestStatus::Running
            } else {
                TestStatus::Failed
            };

            let result_id = {
                let conn = self.pool.get()?;
                records::insert_result(
                    &conn,
                    &NewResult {
                        execution_id,
                        asset_name: &asset.name,
                        src_node_mac: &request.src_node_id,
                        dst_node_mac: &request.dst_node_id,
                        link_name: asset.link_name.as_deref(),
                        session_id: session_id.as_deref(),
                        status,
                    },
                )?
            };

            if let Some(session_id) = session_id {
                self.sessions.lock().await.push(TrackedSession {
                    result_id,
                    session_id,
                });
                started += 1;
            }
        }
        Ok(started)
    }

    /// Record ABORTED rows for assets the execution never reached.
    fn abort_assets(&self, execution_id: i64, assets: &[Asset]) -> Result<(), StorageError> {
        if assets.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        for asset in assets {
            for (src, dst) in [
                (&asset.src_node_mac, &asset.dst_node_mac),
                (&asset.dst_node_mac, &asset.src_node_mac),
            ] {
                records::insert_result(
                    &tx,
                    &NewResult {
                        execution_id,
                        asset_name: &asset.name,
                        src_node_mac: src,
                        dst_node_mac: dst,
                        link_name: asset.link_name.as_deref(),
                        session_id: None,
                        status: TestStatus::Aborted,
                    },
                )?;
            }
        }
        tx.commit()?;

        info!(execution_id, skipped = assets.len(), "execution cancelled before all assets ran");
        Ok(())
    }

    async fn collect_metrics(&self, session_id: &str) -> (Option<SessionMetrics>, Option<String>) {
        match self.control_plane.traffic_output(self.network(), session_id).await {
            Ok(Some(output)) => match iperf::parse_output(&output) {
                Ok(parsed) => (Some(parsed.metrics()), Some(output)),
                Err(e) => {
                    debug!(session_id, error = %e, "unparseable traffic output");
                    (None, Some(output))
                }
            },
            Ok(None) => (None, None),
            Err(e) => {
                debug!(session_id, error = %e, "failed to fetch traffic output");
                (None, None)
            }
        }
    }

    /// Live session ids on the network, or None if they cannot be listed.
    async fn active_sessions(&self) -> Option<HashSet<String>> {
        match self.control_plane.list_active_sessions(self.network()).await {
            Ok(ids) => Some(ids.into_iter().collect()),
            Err(e) => {
                warn!(network = %self.network(), error = %e, "failed to list active sessions, stopping all tracked");
                None
            }
        }
    }

    /// Poll until none of `tracked` is live or `until` passes.
    async fn wait_for_sessions(
        &self,
        tracked: &[TrackedSession],
        until: Instant,
    ) -> Option<HashSet<String>> {
        if tracked.is_empty() {
            return None;
        }

        loop {
            let active = self.active_sessions().await?;
            let live = tracked.iter().any(|s| active.contains(&s.session_id));
            let remaining = until.saturating_duration_since(Instant::now());
            if !live || remaining.is_zero() {
                return Some(active);
            }
            tokio::time::sleep(remaining.min(SESSION_POLL_INTERVAL)).await;
        }
    }

    async fn stop_sessions(&self, tracked: Vec<TrackedSession>) -> StopReport {
        let active = if tracked.is_empty() {
            None
        } else {
            self.active_sessions().await
        };
        self.settle_sessions(tracked, active).await
    }

    /// Sessions missing from `active` ended on their own and are FINISHED
    /// with metrics. The rest are stopped. A `None` set means every session
    /// is treated as live.
    async fn settle_sessions(
        &self,
        tracked: Vec<TrackedSession>,
        active: Option<HashSet<String>>,
    ) -> StopReport {
        let network = self.network();
        let stops = tracked.iter().map(|session| {
            let still_active = active
                .as_ref()
                .map_or(true, |ids| ids.contains(&session.session_id));
            async move {
                if !still_active {
                    let (metrics, output) = self.collect_metrics(&session.session_id).await;
                    return SessionOutcome {
                        result_id: session.result_id,
                        session_id: session.session_id.clone(),
                        status: TestStatus::Finished,
                        metrics,
                        output,
                    };
                }

                let status = match self
                    .control_plane
                    .stop_traffic(network, &session.session_id)
                    .await
                {
                    Ok(()) => TestStatus::Aborted,
                    Err(e) => {
                        warn!(session_id = %session.session_id, error = %e, "failed to stop traffic session");
                        TestStatus::Failed
                    }
                };
                SessionOutcome {
                    result_id: session.result_id,
                    session_id: session.session_id.clone(),
                    status,
                    metrics: None,
                    output: None,
                }
            }
        });

        let outcomes = join_all(stops).await;
        StopReport {
            tracked: tracked.len(),
            outcomes,
        }
    }
}
