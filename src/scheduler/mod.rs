//! Network test scheduler -- schedule registry, execution registry, and
//! crash recovery.
//!
//! The registries are an owned state object shared by cloning `Scheduler`.
//! The database is authoritative; the registries only hold what this process
//! is actively driving. At most one RUNNING execution per network is enforced
//! by a partial unique index, so a lost check-then-act race surfaces as
//! [`SchedulerError::NetworkBusy`] instead of a second RUNNING row.

pub mod cron;
pub mod schedule;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controlplane::ControlPlane;
use crate::network_test::{
    self, InvalidValue, PrepareError, PreparedTest, StopReport, TestDefinition, TestExecution,
    TestStatus, TestType,
};
use crate::storage::{
    records, ExecutionFilter, ExecutionRecord, Pool, ResultRecord, ScheduleRecord, StorageError,
};

pub use self::schedule::Schedule;

const MAX_PREVIEW_HOURS: u64 = 24 * 7;

/// How long a test past its estimated duration may keep running before its
/// remaining sessions are stopped.
pub const DEFAULT_COMPLETION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("schedule {0} not found")]
    ScheduleNotFound(i64),

    #[error("a test is already running on {0}")]
    NetworkBusy(String),

    #[error(transparent)]
    InvalidDefinition(#[from] InvalidValue),

    #[error(transparent)]
    Prepare(#[from] PrepareError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::Storage(e.into())
    }
}

impl From<r2d2::Error> for SchedulerError {
    fn from(e: r2d2::Error) -> Self {
        SchedulerError::Storage(e.into())
    }
}

/// Counters reported by [`Scheduler::restart`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestartSummary {
    pub sessions_stopped: usize,
    pub executions_aborted: usize,
    pub results_aborted: usize,
    pub schedules_started: usize,
}

/// One upcoming tick of an enabled schedule.
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingRun {
    pub at: DateTime<Utc>,
    pub schedule_id: i64,
    pub network_name: String,
    pub test_type: TestType,
}

/// Why an execution leaves RUNNING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    /// A user request or shutdown.
    Requested,
    /// The estimated duration elapsed.
    Deadline,
}

struct ActiveExecution {
    execution: TestExecution,
    deadline: CancellationToken,
    /// Outcome of a stop whose database write failed, kept for the retry.
    pending: Option<(TestStatus, StopReport)>,
}

struct Inner {
    pool: Pool,
    control_plane: Arc<dyn ControlPlane>,
    completion_grace: Duration,
    schedules: Mutex<HashMap<i64, Schedule>>,
    executions: Mutex<HashMap<i64, ActiveExecution>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(pool: Pool, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self::with_completion_grace(pool, control_plane, DEFAULT_COMPLETION_GRACE)
    }

    pub fn with_completion_grace(
        pool: Pool,
        control_plane: Arc<dyn ControlPlane>,
        completion_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                control_plane,
                completion_grace,
                schedules: Mutex::new(HashMap::new()),
                executions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    pub fn control_plane(&self) -> &dyn ControlPlane {
        self.inner.control_plane.as_ref()
    }

    pub async fn has_schedule(&self, schedule_id: i64) -> bool {
        self.inner.schedules.lock().await.contains_key(&schedule_id)
    }

    pub async fn has_execution(&self, execution_id: i64) -> bool {
        self.inner.executions.lock().await.contains_key(&execution_id)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Reconcile state left behind by a previous process and launch every
    /// stored schedule. Run once at startup.
    pub async fn restart(&self) -> Result<RestartSummary, SchedulerError> {
        let mut summary = RestartSummary::default();

        // Anything this process was still driving is superseded.
        self.stop_all_schedules().await;
        let stale: Vec<ActiveExecution> = self.inner.executions.lock().await.drain().map(|(_, e)| e).collect();
        for mut active in stale {
            active.deadline.cancel();
            active.execution.stop().await;
        }

        // 1. Stop live traffic sessions on every known network.
        let mut networks: BTreeSet<String> = self.inner.control_plane.networks().into_iter().collect();
        {
            let conn = self.inner.pool.get()?;
            networks.extend(records::network_names(&conn)?);
        }
        for network in &networks {
            summary.sessions_stopped += self.stop_stale_sessions(network).await;
        }

        // 2. Nothing RUNNING survives a restart.
        {
            let conn = self.inner.pool.get()?;
            let (executions, results) = records::abort_running(&conn)?;
            summary.executions_aborted = executions;
            summary.results_aborted = results;
        }

        // 3. Relaunch every stored schedule with its current parameters.
        let stored = {
            let conn = self.inner.pool.get()?;
            records::list_schedules(&conn)?
        };
        let mut schedules = self.inner.schedules.lock().await;
        for record in stored {
            let cron = match cron::parse(&record.cron_expr) {
                Ok(cron) => cron,
                Err(e) => {
                    error!(schedule_id = record.id, error = %e, "skipping stored schedule");
                    continue;
                }
            };
            let mut schedule = Schedule::new(record.id, record.enabled, cron, record.definition, record.params_id);
            schedule.start(self.clone());
            schedules.insert(record.id, schedule);
            summary.schedules_started += 1;
        }
        drop(schedules);

        info!(
            sessions_stopped = summary.sessions_stopped,
            executions_aborted = summary.executions_aborted,
            results_aborted = summary.results_aborted,
            schedules_started = summary.schedules_started,
            "scheduler restarted"
        );
        Ok(summary)
    }

    /// Best-effort: stop every live session on `network`. Failures are logged.
    async fn stop_stale_sessions(&self, network: &str) -> usize {
        let sessions = match self.inner.control_plane.list_active_sessions(network).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(network = %network, error = %e, "failed to list traffic sessions");
                return 0;
            }
        };

        let stops = sessions
            .iter()
            .map(|id| self.inner.control_plane.stop_traffic(network, id));
        let mut stopped = 0;
        for (id, outcome) in sessions.iter().zip(join_all(stops).await) {
            match outcome {
                Ok(()) => stopped += 1,
                Err(e) => {
                    error!(network = %network, session_id = %id, error = %e, "failed to stop stale session")
                }
            }
        }
        stopped
    }

    /// Stop every schedule task and every live execution.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.stop_all_schedules().await;

        let ids: Vec<i64> = self.inner.executions.lock().await.keys().copied().collect();
        for id in ids {
            self.stop_execution(id).await?;
        }
        info!("scheduler shut down");
        Ok(())
    }

    async fn stop_all_schedules(&self) {
        let drained: Vec<Schedule> = self.inner.schedules.lock().await.drain().map(|(_, s)| s).collect();
        for mut schedule in drained {
            schedule.stop().await;
        }
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    pub async fn add_schedule(
        &self,
        enabled: bool,
        cron_expr: &str,
        definition: TestDefinition,
    ) -> Result<i64, SchedulerError> {
        let cron = cron::parse(cron_expr)?;
        definition.validate()?;

        let (schedule_id, params_id) = {
            let mut conn = self.inner.pool.get()?;
            let tx = conn.transaction()?;
            let schedule_id = records::insert_schedule(&tx, enabled, cron_expr)?;
            let params_id = records::insert_params(&tx, Some(schedule_id), &definition)?;
            tx.commit()?;
            (schedule_id, params_id)
        };

        let mut schedule = Schedule::new(schedule_id, enabled, cron, definition, params_id);
        schedule.start(self.clone());
        self.inner.schedules.lock().await.insert(schedule_id, schedule);

        info!(schedule_id, params_id, cron = %cron_expr, "schedule added");
        Ok(schedule_id)
    }

    /// Replace a schedule's trigger and parameters. The old task is stopped
    /// and awaited before the new one is created.
    pub async fn modify_schedule(
        &self,
        schedule_id: i64,
        enabled: bool,
        cron_expr: &str,
        definition: TestDefinition,
    ) -> Result<(), SchedulerError> {
        let cron = cron::parse(cron_expr)?;
        definition.validate()?;

        let mut old = self
            .inner
            .schedules
            .lock()
            .await
            .remove(&schedule_id)
            .ok_or(SchedulerError::ScheduleNotFound(schedule_id))?;
        old.stop().await;

        let params_id = match self.persist_modification(schedule_id, enabled, cron_expr, &definition) {
            Ok(params_id) => params_id,
            Err(e) => {
                // Keep the registry in line with the unchanged database.
                old.start(self.clone());
                self.inner.schedules.lock().await.insert(schedule_id, old);
                return Err(e);
            }
        };

        let mut schedule = Schedule::new(schedule_id, enabled, cron, definition, params_id);
        schedule.start(self.clone());
        self.inner.schedules.lock().await.insert(schedule_id, schedule);

        info!(schedule_id, params_id, cron = %cron_expr, enabled, "schedule modified");
        Ok(())
    }

    /// Update the schedule row and reuse the latest params row unless the
    /// parameters changed. Returns the current params id.
    fn persist_modification(
        &self,
        schedule_id: i64,
        enabled: bool,
        cron_expr: &str,
        definition: &TestDefinition,
    ) -> Result<i64, SchedulerError> {
        let mut conn = self.inner.pool.get()?;
        let tx = conn.transaction()?;

        if records::update_schedule(&tx, schedule_id, enabled, cron_expr)? == 0 {
            return Err(SchedulerError::ScheduleNotFound(schedule_id));
        }

        let params_id = match records::latest_params(&tx, schedule_id)? {
            Some(current) if current.definition == *definition => current.id,
            _ => records::insert_params(&tx, Some(schedule_id), definition)?,
        };

        tx.commit()?;
        Ok(params_id)
    }

    /// Stop the schedule's task, if it has one, and delete its row. Rows
    /// skipped at restart have no task and are deleted from the database
    /// alone.
    pub async fn delete_schedule(&self, schedule_id: i64) -> Result<(), SchedulerError> {
        let mut registered = self.inner.schedules.lock().await.remove(&schedule_id);
        if let Some(schedule) = registered.as_mut() {
            schedule.stop().await;
        }

        let deleted = self
            .inner
            .pool
            .get()
            .map_err(SchedulerError::from)
            .and_then(|conn| Ok(records::delete_schedule(&conn, schedule_id)?));
        match deleted {
            Ok(0) => return Err(SchedulerError::ScheduleNotFound(schedule_id)),
            Ok(_) => {}
            Err(e) => {
                if let Some(mut schedule) = registered {
                    schedule.start(self.clone());
                    self.inner.schedules.lock().await.insert(schedule_id, schedule);
                }
                return Err(e);
            }
        }

        info!(schedule_id, "schedule deleted");
        Ok(())
    }

    /// One cron tick: skip if the network is busy or nothing can be
    /// prepared, otherwise start an execution. Never fails the caller.
    pub(crate) async fn run_tick(&self, schedule_id: i64, definition: &TestDefinition, params_id: i64) {
        let network = &definition.network_name;
        if let Err(e) = definition.validate() {
            warn!(schedule_id, network = %network, error = %e, "stored test parameters are invalid, skipping tick");
            return;
        }
        match self.is_network_busy(network).await {
            Ok(false) => {}
            Ok(true) => {
                warn!(schedule_id, network = %network, "a test is already running, skipping tick");
                return;
            }
            Err(e) => {
                error!(schedule_id, network = %network, error = %e, "busy check failed, skipping tick");
                return;
            }
        }

        let prepared = match network_test::prepare(self.control_plane(), definition).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(schedule_id, network = %network, error = %e, "failed to prepare test, skipping tick");
                return;
            }
        };

        match self.start_execution(definition.clone(), prepared, Some(params_id)).await {
            Ok(execution_id) => info!(schedule_id, execution_id, network = %network, "scheduled test started"),
            Err(SchedulerError::NetworkBusy(_)) => {
                warn!(schedule_id, network = %network, "network became busy, skipping tick")
            }
            Err(e) => error!(schedule_id, network = %network, error = %e, "failed to start scheduled test"),
        }
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Check, prepare, and start an unscheduled execution.
    pub async fn start_adhoc(&self, definition: TestDefinition) -> Result<i64, SchedulerError> {
        definition.validate()?;
        if self.is_network_busy(&definition.network_name).await? {
            return Err(SchedulerError::NetworkBusy(definition.network_name));
        }
        let prepared = network_test::prepare(self.control_plane(), &definition).await?;
        self.start_execution(definition, prepared, None).await
    }

    /// Persist a RUNNING execution, launch it, and arm its deadline.
    pub async fn start_execution(
        &self,
        definition: TestDefinition,
        prepared: PreparedTest,
        params_id: Option<i64>,
    ) -> Result<i64, SchedulerError> {
        let network = definition.network_name.clone();

        let execution_id = {
            let mut conn = self.inner.pool.get()?;
            let tx = conn.transaction()?;
            let params_id = match params_id {
                Some(id) => id,
                None => records::insert_params(&tx, None, &definition)?,
            };
            let execution_id = records::insert_execution(&tx, params_id, &network, Utc::now())
                .map_err(|e| {
                    if e.is_constraint_violation() {
                        SchedulerError::NetworkBusy(network.clone())
                    } else {
                        e.into()
                    }
                })?;
            tx.commit()?;
            execution_id
        };

        let mut execution = TestExecution::new(
            definition,
            Arc::clone(&self.inner.control_plane),
            self.inner.pool.clone(),
        );
        execution.start(execution_id, prepared.assets);

        let deadline = CancellationToken::new();
        self.inner.executions.lock().await.insert(
            execution_id,
            ActiveExecution {
                execution,
                deadline: deadline.clone(),
                pending: None,
            },
        );

        let scheduler = self.clone();
        let estimated = prepared.estimated_duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline.cancelled() => {}
                _ = tokio::time::sleep(estimated) => {
                    debug!(execution_id, "estimated duration elapsed");
                    if let Err(e) = scheduler.end_execution(execution_id, StopCause::Deadline).await {
                        error!(execution_id, error = %e, "failed to complete execution at deadline");
                    }
                }
            }
        });

        info!(execution_id, network = %network, ?estimated, "execution started");
        Ok(execution_id)
    }

    /// Stop an execution on request and record its terminal status.
    /// Returns false if the execution is not active in this process.
    pub async fn stop_execution(&self, execution_id: i64) -> Result<bool, SchedulerError> {
        self.end_execution(execution_id, StopCause::Requested).await
    }

    /// A requested stop is ABORTED when every tracked session had to be
    /// cancelled. A deadline stop is always FINISHED. The registry entry is
    /// only dropped once the outcome is committed.
    async fn end_execution(&self, execution_id: i64, cause: StopCause) -> Result<bool, SchedulerError> {
        let Some(mut active) = self.inner.executions.lock().await.remove(&execution_id) else {
            debug!(execution_id, "execution is not active");
            return Ok(false);
        };
        active.deadline.cancel();

        let (status, report) = match active.pending.take() {
            Some(pending) => pending,
            None => match cause {
                StopCause::Requested => {
                    let report = active.execution.stop().await;
                    let status = if report.all_cancelled() {
                        TestStatus::Aborted
                    } else {
                        TestStatus::Finished
                    };
                    (status, report)
                }
                StopCause::Deadline => {
                    let report = active.execution.complete(self.inner.completion_grace).await;
                    (TestStatus::Finished, report)
                }
            },
        };

        if let Err(e) = self.record_stop(execution_id, status, &report) {
            active.pending = Some((status, report));
            self.inner.executions.lock().await.insert(execution_id, active);
            return Err(e);
        }

        info!(
            execution_id,
            %status,
            ?cause,
            tracked = report.tracked,
            completed = report.completed(),
            cancelled = report.cancelled(),
            failed = report.failed(),
            "execution stopped"
        );
        Ok(true)
    }

    fn record_stop(
        &self,
        execution_id: i64,
        status: TestStatus,
        report: &StopReport,
    ) -> Result<(), SchedulerError> {
        let mut conn = self.inner.pool.get()?;
        let tx = conn.transaction()?;
        for outcome in &report.outcomes {
            records::finish_result(
                &tx,
                outcome.result_id,
                outcome.status,
                outcome.metrics.as_ref(),
                outcome.output.as_deref(),
            )?;
        }
        records::close_running_results(&tx, execution_id, TestStatus::Finished)?;
        records::finish_execution(&tx, execution_id, status, Utc::now())?;
        tx.commit()?;
        Ok(())
    }

    pub async fn is_network_busy(&self, network_name: &str) -> Result<bool, SchedulerError> {
        let conn = self.inner.pool.get()?;
        Ok(records::is_network_busy(&conn, network_name)?)
    }

    // -----------------------------------------------------------------------
    // Read-only projections
    // -----------------------------------------------------------------------

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, SchedulerError> {
        let conn = self.inner.pool.get()?;
        Ok(records::list_schedules(&conn)?)
    }

    pub async fn get_schedule(&self, schedule_id: i64) -> Result<Option<ScheduleRecord>, SchedulerError> {
        let conn = self.inner.pool.get()?;
        Ok(records::get_schedule(&conn, schedule_id)?)
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, SchedulerError> {
        let conn = self.inner.pool.get()?;
        Ok(records::list_executions(&conn, filter)?)
    }

    pub async fn get_execution(&self, execution_id: i64) -> Result<Option<ExecutionRecord>, SchedulerError> {
        let conn = self.inner.pool.get()?;
        Ok(records::get_execution(&conn, execution_id)?)
    }

    pub async fn list_results(&self, execution_id: i64) -> Result<Vec<ResultRecord>, SchedulerError> {
        let conn = self.inner.pool.get()?;
        Ok(records::list_results(&conn, execution_id)?)
    }

    /// Calculate upcoming runs of all enabled schedules within `hours`
    /// (at most one week). This is strictly a dry-run preview.
    pub async fn preview_next_runs(&self, hours: u64) -> Result<Vec<UpcomingRun>, SchedulerError> {
        let now = Utc::now();
        let end = now + chrono::Duration::hours(hours.min(MAX_PREVIEW_HOURS) as i64);
        let mut preview = Vec::new();

        for record in self.list_schedules().await? {
            if !record.enabled {
                continue;
            }
            let Ok(schedule) = cron::parse(&record.cron_expr) else {
                continue;
            };
            for at in cron::ticks_between(&schedule, now, end) {
                preview.push(UpcomingRun {
                    at,
                    schedule_id: record.id,
                    network_name: record.definition.network_name.clone(),
                    test_type: record.definition.test_type,
                });
            }
        }

        preview.sort_by_key(|run| run.at);
        Ok(preview)
    }
}
