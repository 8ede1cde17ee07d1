//! Recurring trigger for one scheduled test.

use std::time::Duration;

use chrono::Utc;
use ::cron::Schedule as CronSchedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{cron, Scheduler};
use crate::network_test::TestDefinition;

/// A schedule and its background tick task.
pub struct Schedule {
    id: i64,
    enabled: bool,
    params_id: i64,
    definition: TestDefinition,
    cron: CronSchedule,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Schedule {
    pub fn new(
        id: i64,
        enabled: bool,
        cron: CronSchedule,
        definition: TestDefinition,
        params_id: i64,
    ) -> Self {
        Self {
            id,
            enabled,
            params_id,
            definition,
            cron,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Spawn the tick loop. No-op if it is already running.
    pub fn start(&mut self, scheduler: Scheduler) {
        if self.is_running() {
            return;
        }

        self.cancel = CancellationToken::new();
        let ticker = Ticker {
            scheduler,
            schedule_id: self.id,
            enabled: self.enabled,
            cron: self.cron.clone(),
            definition: self.definition.clone(),
            params_id: self.params_id,
            cancel: self.cancel.clone(),
        };
        self.task = Some(tokio::spawn(ticker.run()));
    }

    /// Cancel the tick loop and wait until it has exited.
    /// Returns false if there was no task to stop.
    pub async fn stop(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };

        self.cancel.cancel();
        if let Err(e) = task.await {
            warn!(schedule_id = self.id, error = %e, "schedule task ended abnormally");
        }
        debug!(schedule_id = self.id, "schedule task stopped");
        true
    }
}

struct Ticker {
    scheduler: Scheduler,
    schedule_id: i64,
    enabled: bool,
    cron: CronSchedule,
    definition: TestDefinition,
    params_id: i64,
    cancel: CancellationToken,
}

impl Ticker {
    async fn run(self) {
        let mut last_tick = Utc::now();

        loop {
            let from = Utc::now().max(last_tick);
            let Some(next) = cron::next_tick(&self.cron, from) else {
                warn!(schedule_id = self.schedule_id, "cron expression has no upcoming ticks");
                self.cancel.cancelled().await;
                return;
            };

            info!(
                schedule_id = self.schedule_id,
                network = %self.definition.network_name,
                test_type = %self.definition.test_type,
                next = %next,
                "test scheduled"
            );

            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            last_tick = next;

            if !self.enabled {
                info!(schedule_id = self.schedule_id, "schedule is currently disabled, skipping");
                continue;
            }

            self.scheduler
                .run_tick(self.schedule_id, &self.definition, self.params_id)
                .await;
        }
    }
}
