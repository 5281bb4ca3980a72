use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flowline_core::run::RunId;

use crate::clock::Clock;

/// Sending half of the delay scheduler.
#[derive(Clone)]
pub struct DelayHandle {
    tx: mpsc::UnboundedSender<(DateTime<Utc>, RunId)>,
}

impl DelayHandle {
    /// Ask for `run_id` to be handed back at or after `at`.
    pub fn schedule(&self, run_id: RunId, at: DateTime<Utc>) {
        // The receiver is gone only after shutdown
        let _ = self.tx.send((at, run_id));
    }
}

/// In-process timer service for suspended runs.
///
/// Timers live only in memory; after a restart they are rebuilt from the
/// `resume_at` recorded on each run's open delay step.
pub struct DelayScheduler {
    rx: mpsc::UnboundedReceiver<(DateTime<Utc>, RunId)>,
    timers: BTreeSet<(DateTime<Utc>, RunId)>,
    clock: Clock,
}

impl DelayScheduler {
    pub fn new(clock: Clock) -> (Self, DelayHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            rx,
            timers: BTreeSet::new(),
            clock,
        };
        (scheduler, DelayHandle { tx })
    }

    /// Run until cancelled, calling `on_due` for every timer that fires.
    pub async fn run<F>(mut self, cancel: CancellationToken, on_due: F)
    where
        F: Fn(RunId),
    {
        info!("Delay scheduler started");

        loop {
            while let Some(&(at, _)) = self.timers.first() {
                if at > self.clock.now() {
                    break;
                }
                if let Some((_, run_id)) = self.timers.pop_first() {
                    debug!(run_id = %run_id, "Delay due");
                    on_due(run_id);
                }
            }

            let next = self.timers.first().map(|(at, _)| self.clock.instant_at(*at));

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(pending = self.timers.len(), "Delay scheduler shutting down");
                    break;
                }
                received = self.rx.recv() => match received {
                    Some(timer) => {
                        self.timers.insert(timer);
                    }
                    None => break,
                },
                _ = sleep_until(next) => {}
            }
        }
    }
}

async fn sleep_until(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
