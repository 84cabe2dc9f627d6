//! Unattended sync runs on per-bank timers.
//!
//! The scheduler never blocks on a bank: prerequisites are checked
//! before any browser is launched, a busy bank is skipped and recorded
//! as such, and every outcome lands in the schedule history.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::banks::Bank;
use crate::db::RunResult;
use crate::error::SyncError;
use crate::session::{DriverFactory, SessionControl};
use crate::sync::SyncOrchestrator;

const WATCH_POLL: Duration = Duration::from_secs(60);

pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    drivers: Arc<dyn DriverFactory>,
    on_control: Box<dyn Fn(SessionControl) + Send + Sync>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, drivers: Arc<dyn DriverFactory>) -> Self {
        Self {
            orchestrator,
            drivers,
            // By default nobody listens; a session that needs a second
            // factor will time out and record that.
            on_control: Box::new(drop),
        }
    }

    /// Install a handler that receives the control handle of every
    /// session started by this scheduler, e.g. to relay second-factor
    /// prompts to a terminal.
    pub fn with_control_handler(
        mut self,
        handler: impl Fn(SessionControl) + Send + Sync + 'static,
    ) -> Self {
        self.on_control = Box::new(handler);
        self
    }

    /// Run every schedule that is due at `now` and record the outcomes.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<(Bank, RunResult)> {
        let mut outcomes = Vec::new();
        for (bank, schedule) in self.orchestrator.store().schedules().await {
            if !schedule.is_due(now) {
                continue;
            }
            log::info!("{bank}: schedule is due, starting a pass");
            let result = self.execute(bank).await;
            self.record(bank, &result, now).await;
            outcomes.push((bank, result));
        }
        outcomes
    }

    /// Run one bank immediately, schedule or not. The busy gate still
    /// applies.
    pub async fn run_now(&self, bank: Bank, now: DateTime<Utc>) -> RunResult {
        let result = self.execute(bank).await;
        self.record(bank, &result, now).await;
        result
    }

    /// A failed history write must not stop unattended runs; the next
    /// tick retries against the same store.
    async fn record(&self, bank: Bank, result: &RunResult, now: DateTime<Utc>) {
        if let Err(err) = self
            .orchestrator
            .store()
            .record_run(bank, result.clone(), now)
            .await
        {
            log::warn!("{bank}: could not record run outcome: {err:#}");
        }
    }

    async fn execute(&self, bank: Bank) -> RunResult {
        // Cheap checks first so a missing mapping or credential never
        // launches a browser.
        if let Err(err) = self.orchestrator.prerequisites(bank).await {
            log::warn!("{bank}: skipping run: {err}");
            return match err {
                SyncError::MissingPrerequisites(_) => RunResult::MissingPrerequisites,
                other => RunResult::Error(other.to_string()),
            };
        }
        match self
            .orchestrator
            .run_pass(bank, self.drivers.as_ref(), |control| {
                (self.on_control)(control)
            })
            .await
        {
            Ok(summary) if summary.is_clean() => RunResult::Success,
            Ok(summary) => RunResult::PartialFailure(summary.failure_count()),
            Err(SyncError::Busy) => RunResult::Busy,
            Err(err) => RunResult::Error(err.to_string()),
        }
    }

    /// Foreground loop for the watch command: tick, sleep, repeat.
    pub async fn watch(&self) {
        log::info!("Watching schedules (poll every {}s)", WATCH_POLL.as_secs());
        loop {
            self.tick(Utc::now()).await;
            tokio::time::sleep(WATCH_POLL).await;
        }
    }
}
