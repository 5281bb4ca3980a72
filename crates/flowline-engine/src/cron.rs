use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowline_core::workflow::WorkflowStatus;

use crate::runtime::{trigger_of, Engine, SCHEDULE_TRIGGER};

/// How often the set of scheduled workflows is re-read from the registry.
const REFRESH: Duration = Duration::from_secs(60);

struct CronJob {
    workflow_id: String,
    schedule: Schedule,
}

/// Fires `schedule` runs for active workflows whose trigger carries a cron
/// expression.
///
/// Occurrences missed while the process was down are not replayed, and
/// several occurrences that fall due within one wake-up fire a single run.
pub struct CronTriggers {
    engine: Engine,
    cancel: CancellationToken,
}

impl CronTriggers {
    pub fn new(engine: Engine, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    /// Run the trigger loop. Blocks until cancelled.
    pub async fn run(self) {
        info!("Cron triggers started");
        let clock = self.engine.clock();
        let mut last = clock.now();

        loop {
            let jobs = self.jobs().await;
            let now = clock.now();

            for job in &jobs {
                if let Some(due) = next_due(&job.schedule, last).filter(|due| *due <= now) {
                    self.fire(job, due).await;
                }
            }
            last = now;

            let wake = jobs
                .iter()
                .filter_map(|job| next_due(&job.schedule, now))
                .min()
                .map_or(REFRESH, |at| clock.until(at).min(REFRESH));

            debug!(jobs = jobs.len(), wake_secs = wake.as_secs(), "Cron triggers sleeping");

            tokio::select! {
                _ = tokio::time::sleep(wake) => {}
                _ = self.cancel.cancelled() => {
                    info!("Cron triggers shutting down");
                    break;
                }
            }
        }
    }

    async fn fire(&self, job: &CronJob, due: DateTime<Utc>) {
        info!(workflow_id = %job.workflow_id, due = %due, "Firing scheduled workflow");
        let mut payload = Map::new();
        payload.insert("scheduled_at".into(), json!(due.to_rfc3339()));

        match self.engine.fire(&job.workflow_id, SCHEDULE_TRIGGER, payload).await {
            Ok(run_id) => debug!(workflow_id = %job.workflow_id, run_id = %run_id, "Scheduled run created"),
            Err(e) => error!(workflow_id = %job.workflow_id, error = %e, "Scheduled run failed to start"),
        }
    }

    async fn jobs(&self) -> Vec<CronJob> {
        let defs = match self.engine.registry().list(Some(WorkflowStatus::Active)).await {
            Ok(defs) => defs,
            Err(e) => {
                warn!(error = %e, "Cannot list active workflows");
                return vec![];
            }
        };

        let mut jobs = vec![];
        for def in defs {
            let Ok((_, trigger)) = trigger_of(&def) else {
                continue;
            };
            let Some(expr) = trigger.schedule.as_deref() else {
                continue;
            };
            match Schedule::from_str(expr) {
                Ok(schedule) => jobs.push(CronJob {
                    workflow_id: def.id.clone(),
                    schedule,
                }),
                Err(e) => warn!(
                    workflow_id = %def.id,
                    schedule = %expr,
                    error = %e,
                    "Invalid cron expression, skipping workflow"
                ),
            }
        }
        jobs
    }
}

/// The first occurrence of `schedule` strictly after `after`.
pub fn next_due(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}
