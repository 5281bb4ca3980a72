use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowline_actions::ActionDispatcher;
use flowline_core::config::EngineConfig;
use flowline_core::context::initial_context;
use flowline_core::error::{FlowError, Result};
use flowline_core::event::EventBus;
use flowline_core::run::{RunId, RunStatus, RunStep, WorkflowRun};
use flowline_core::traits::RunStore;
use flowline_core::types::EngineEvent;
use flowline_core::workflow::{NodeConfig, TriggerConfig, WorkflowDefinition, WorkflowStatus};

use crate::admission::Admission;
use crate::clock::Clock;
use crate::executor::{Advance, RunExecutor};
use crate::graph::WorkflowGraph;
use crate::registry::WorkflowRegistry;
use crate::scheduler::{DelayHandle, DelayScheduler};

/// Trigger type used for cron-fired runs.
pub const SCHEDULE_TRIGGER: &str = "schedule";

/// The workflow engine: admits triggered runs, drives them through the
/// executor, parks them on delays and recovers them after a restart.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<WorkflowRegistry>,
    runs: Arc<dyn RunStore>,
    executor: RunExecutor,
    event_bus: Arc<EventBus>,
    admission: Mutex<Admission>,
    delays: DelayHandle,
    scheduler: Mutex<Option<DelayScheduler>>,
    /// Runs currently being driven by a task.
    claims: Mutex<HashSet<RunId>>,
    tokens: Mutex<HashMap<RunId, CancellationToken>>,
    config: EngineConfig,
    clock: Clock,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<WorkflowRegistry>,
        dispatcher: Arc<ActionDispatcher>,
        runs: Arc<dyn RunStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let clock = Clock::new();
        let executor = RunExecutor::new(
            dispatcher,
            runs.clone(),
            event_bus.clone(),
            clock,
            Duration::from_secs(config.default_action_timeout_secs),
        );
        let (scheduler, delays) = DelayScheduler::new(clock);

        Self {
            inner: Arc::new(Inner {
                registry,
                runs,
                executor,
                event_bus,
                admission: Mutex::new(Admission::new()),
                delays,
                scheduler: Mutex::new(Some(scheduler)),
                claims: Mutex::new(HashSet::new()),
                tokens: Mutex::new(HashMap::new()),
                config,
                clock,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.inner.registry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.event_bus
    }

    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    /// Start the delay timer loop and pick up runs left unfinished by a
    /// previous process. Call once.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let scheduler = lock(&self.inner.scheduler)
            .take()
            .ok_or_else(|| FlowError::Config("engine already started".into()))?;

        let engine = self.clone();
        tokio::spawn(scheduler.run(shutdown, move |run_id| {
            tokio::spawn(engine.drive(run_id));
        }));

        self.recover().await
    }

    /// Create a run of an active workflow and admit or queue it.
    ///
    /// Returns as soon as the run is persisted; execution continues on a
    /// spawned task.
    pub async fn fire(
        &self,
        workflow_id: &str,
        trigger_type: &str,
        payload: Map<String, Value>,
    ) -> Result<RunId> {
        let def = self.inner.registry.get(workflow_id).await?;
        if def.status != WorkflowStatus::Active {
            return Err(FlowError::NotActive {
                id: def.id.clone(),
                status: def.status.to_string(),
            });
        }

        let (trigger_id, trigger) = trigger_of(&def)?;
        if !trigger_matches(trigger, trigger_type) {
            return Err(FlowError::TriggerMismatch {
                expected: trigger.event.clone(),
                got: trigger_type.to_string(),
            });
        }

        let context = initial_context(&def.variables, &payload);
        let run = WorkflowRun::new(&def.id, trigger_type, trigger_id, context, self.inner.clock.now());
        self.inner.runs.save_run(&run).await?;

        let admitted = lock(&self.inner.admission).offer(&def.id, run.id.clone(), self.cap(&def));
        info!(
            run_id = %run.id,
            workflow_id = %def.id,
            trigger_type = %trigger_type,
            admitted,
            "Run created"
        );

        if admitted {
            tokio::spawn(self.drive(run.id.clone()));
        } else {
            self.inner.event_bus.publish(EngineEvent::RunQueued {
                run_id: run.id.clone(),
                workflow_id: def.id.clone(),
            });
        }
        Ok(run.id)
    }

    /// Continue a suspended run. No-op for terminal runs and for runs that
    /// another task is already driving.
    pub async fn resume(&self, run_id: &RunId) -> Result<()> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            debug!(run_id = %run_id, status = %run.status, "Resume ignored for finished run");
            return Ok(());
        }
        tokio::spawn(self.drive(run_id.clone()));
        Ok(())
    }

    /// Cancel a run. Queued runs are cancelled on the spot; admitted runs
    /// stop before their next step. Finished runs are left untouched.
    pub async fn cancel(&self, run_id: &RunId) -> Result<()> {
        let mut run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        let withdrawn = run.status == RunStatus::Pending
            && lock(&self.inner.admission).withdraw(&run.workflow_id, run_id);
        if withdrawn {
            let now = self.inner.clock.now();
            if let Some(node_id) = run.cursor.first().cloned() {
                let mut step = RunStep::new(node_id);
                step.skip(now);
                run.push_step(step);
            }
            run.finish(RunStatus::Cancelled, None, now);
            self.inner.runs.save_run(&run).await?;
            info!(run_id = %run_id, workflow_id = %run.workflow_id, "Queued run cancelled");
            self.inner.event_bus.publish(EngineEvent::RunFinished {
                run_id: run.id.clone(),
                workflow_id: run.workflow_id.clone(),
                status: RunStatus::Cancelled,
                error: None,
            });
            return Ok(());
        }

        info!(run_id = %run_id, "Cancellation requested");
        self.token(run_id).cancel();
        tokio::spawn(self.drive(run_id.clone()));
        Ok(())
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<WorkflowRun> {
        self.inner
            .runs
            .load_run(run_id)
            .await?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))
    }

    pub async fn list_runs(
        &self,
        workflow_id: &str,
        status: Option<RunStatus>,
    ) -> Result<Vec<WorkflowRun>> {
        self.inner.runs.list_runs(workflow_id, status).await
    }

    /// Wait until a run reaches a terminal status, returning its final record.
    pub async fn wait_for_completion(&self, run_id: &RunId, timeout: Duration) -> Result<WorkflowRun> {
        // Subscribe before the first read so a finish in between is not missed
        let mut rx = self.inner.event_bus.subscribe();
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let finished = self.next_finish(&mut rx, run_id);
        match tokio::time::timeout(timeout, finished).await {
            Ok(result) => result?,
            Err(_) => return Err(FlowError::Timeout),
        }
        self.get_run(run_id).await
    }

    async fn next_finish(
        &self,
        rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
        run_id: &RunId,
    ) -> Result<()> {
        loop {
            match rx.recv().await {
                Ok(EngineEvent::RunFinished { run_id: id, .. }) if &id == run_id => return Ok(()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Completion waiter lagged, re-reading run");
                    if self.get_run(run_id).await?.status.is_terminal() {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => return Err(FlowError::Config("event bus closed".into())),
            }
        }
    }

    /// Number of running and queued runs of a workflow.
    pub fn occupancy(&self, workflow_id: &str) -> (usize, usize) {
        let admission = lock(&self.inner.admission);
        (admission.running(workflow_id), admission.queued(workflow_id))
    }

    /// Drive a run until it suspends or finishes.
    ///
    /// Returns a `'static` boxed future so it can be spawned from within
    /// itself when a finishing run frees a slot for queued ones.
    fn drive(&self, run_id: RunId) -> BoxFuture<'static, ()> {
        let engine = self.clone();
        Box::pin(async move {
            if !engine.claim(&run_id) {
                debug!(run_id = %run_id, "Run already being driven");
                return;
            }

            let result = engine.drive_claimed(&run_id).await;
            lock(&engine.inner.claims).remove(&run_id);

            match result {
                Ok(Some(Advance::Suspended(at))) => {
                    if engine.cancel_requested(&run_id) {
                        tokio::spawn(engine.drive(run_id));
                    } else {
                        engine.inner.delays.schedule(run_id, at);
                    }
                }
                Ok(_) => {}
                Err(e) => error!(run_id = %run_id, error = %e, "Failed to drive run"),
            }
        })
    }

    async fn drive_claimed(&self, run_id: &RunId) -> Result<Option<Advance>> {
        let Some(mut run) = self.inner.runs.load_run(run_id).await? else {
            warn!(run_id = %run_id, "Run vanished from the store");
            return Ok(None);
        };
        if run.status.is_terminal() {
            return Ok(None);
        }

        let def = match self.inner.registry.get(&run.workflow_id).await {
            Ok(def) => def,
            Err(e) => {
                let cap = self.inner.config.default_max_concurrent_runs;
                self.abort(&mut run, e.to_string(), cap).await?;
                return Ok(Some(Advance::Finished(RunStatus::Failed)));
            }
        };

        if run.status == RunStatus::Pending {
            let admitted = lock(&self.inner.admission).holds(&run.workflow_id, run_id);
            if !admitted {
                debug!(run_id = %run_id, "Run still queued");
                return Ok(None);
            }
            run.admit(self.inner.clock.now());
            self.inner.runs.save_run(&run).await?;
            info!(run_id = %run_id, workflow_id = %run.workflow_id, "Run started");
            self.inner.event_bus.publish(EngineEvent::RunStarted {
                run_id: run.id.clone(),
                workflow_id: run.workflow_id.clone(),
            });
        }

        let graph = match WorkflowGraph::build(def.clone()) {
            Ok(graph) => graph,
            Err(e) => {
                self.abort(&mut run, e.to_string(), self.cap(&def)).await?;
                return Ok(Some(Advance::Finished(RunStatus::Failed)));
            }
        };

        let token = self.token(run_id);
        let advance = self.inner.executor.advance(&graph, &mut run, &token).await?;
        if let Advance::Finished(status) = advance {
            debug!(run_id = %run_id, status = %status, "Run left the engine");
            self.release(&run, self.cap(&def));
        }
        Ok(Some(advance))
    }

    /// Fail a run that cannot be executed at all.
    async fn abort(&self, run: &mut WorkflowRun, message: String, cap: usize) -> Result<()> {
        warn!(run_id = %run.id, workflow_id = %run.workflow_id, error = %message, "Aborting run");
        run.finish(RunStatus::Failed, Some(message.clone()), self.inner.clock.now());
        self.inner.runs.save_run(run).await?;
        self.inner.event_bus.publish(EngineEvent::RunFinished {
            run_id: run.id.clone(),
            workflow_id: run.workflow_id.clone(),
            status: RunStatus::Failed,
            error: Some(message),
        });
        self.release(run, cap);
        Ok(())
    }

    /// Free a finished run's slot and start whatever it lets in.
    fn release(&self, run: &WorkflowRun, cap: usize) {
        lock(&self.inner.tokens).remove(&run.id);
        let admitted = lock(&self.inner.admission).release(&run.workflow_id, &run.id, cap);
        for next in admitted {
            debug!(run_id = %next, workflow_id = %run.workflow_id, "Admitting queued run");
            tokio::spawn(self.drive(next));
        }
    }

    async fn recover(&self) -> Result<()> {
        let unfinished = self.inner.runs.list_unfinished().await?;
        let (running, pending): (Vec<_>, Vec<_>) = unfinished
            .into_iter()
            .partition(|r| r.status == RunStatus::Running);

        {
            let mut admission = lock(&self.inner.admission);
            for run in &running {
                admission.restore(&run.workflow_id, run.id.clone());
            }
        }
        for run in &running {
            tokio::spawn(self.drive(run.id.clone()));
        }

        let mut requeued = 0;
        for run in &pending {
            let cap = match self.inner.registry.get(&run.workflow_id).await {
                Ok(def) => self.cap(&def),
                Err(_) => self.inner.config.default_max_concurrent_runs,
            };
            let admitted = lock(&self.inner.admission).offer(&run.workflow_id, run.id.clone(), cap);
            if admitted {
                tokio::spawn(self.drive(run.id.clone()));
            } else {
                requeued += 1;
                self.inner.event_bus.publish(EngineEvent::RunQueued {
                    run_id: run.id.clone(),
                    workflow_id: run.workflow_id.clone(),
                });
            }
        }

        info!(
            running = running.len(),
            pending = pending.len(),
            requeued,
            "Recovered unfinished runs"
        );
        Ok(())
    }

    fn claim(&self, run_id: &RunId) -> bool {
        lock(&self.inner.claims).insert(run_id.clone())
    }

    fn token(&self, run_id: &RunId) -> CancellationToken {
        lock(&self.inner.tokens)
            .entry(run_id.clone())
            .or_default()
            .clone()
    }

    fn cancel_requested(&self, run_id: &RunId) -> bool {
        lock(&self.inner.tokens)
            .get(run_id)
            .is_some_and(|t| t.is_cancelled())
    }

    fn cap(&self, def: &WorkflowDefinition) -> usize {
        def.settings
            .execution
            .max_concurrent_runs
            .unwrap_or(self.inner.config.default_max_concurrent_runs)
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn trigger_of(def: &WorkflowDefinition) -> Result<(&str, &TriggerConfig)> {
    let node = def
        .trigger()
        .ok_or_else(|| FlowError::Structure(format!("workflow '{}' has no trigger node", def.id)))?;
    match &node.config {
        NodeConfig::Trigger(trigger) => Ok((node.id.as_str(), trigger)),
        _ => Err(FlowError::Structure(format!(
            "node '{}' is not a trigger",
            node.id
        ))),
    }
}

/// Whether a trigger node accepts runs of `trigger_type`.
pub fn trigger_matches(trigger: &TriggerConfig, trigger_type: &str) -> bool {
    trigger.event == "*"
        || trigger.event == trigger_type
        || (trigger_type == SCHEDULE_TRIGGER && trigger.schedule.is_some())
}
