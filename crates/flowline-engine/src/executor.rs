use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowline_actions::ActionDispatcher;
use flowline_core::context::set_path;
use flowline_core::error::{FlowError, Result};
use flowline_core::event::EventBus;
use flowline_core::run::{RunStatus, RunStep, WorkflowRun};
use flowline_core::traits::RunStore;
use flowline_core::types::{ActionResult, EngineEvent, RunContext};
use flowline_core::workflow::{
    ConditionConfig, DelayConfig, ErrorHandling, Node, NodeConfig, WorkflowSettings,
};

use crate::clock::Clock;
use crate::condition;
use crate::graph::WorkflowGraph;
use crate::script::run_script;

/// Where a call to [`RunExecutor::advance`] left the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Parked on a delay. Call `advance` again at or after this time.
    Suspended(DateTime<Utc>),
    /// Reached a terminal status.
    Finished(RunStatus),
}

enum Outcome {
    Next(Vec<String>),
    Suspend(DateTime<Utc>),
    Fail(String),
    Cancelled,
}

enum Work {
    Action(ActionResult),
    Script { context: Map<String, Value>, summary: Value },
}

/// Walks a run through its workflow graph.
///
/// The executor is stateless between calls: everything needed to continue
/// lives on the `WorkflowRun` (cursor, open step, context), which is saved
/// after every step transition.
pub struct RunExecutor {
    dispatcher: Arc<ActionDispatcher>,
    store: Arc<dyn RunStore>,
    event_bus: Arc<EventBus>,
    clock: Clock,
    default_action_timeout: Duration,
}

impl RunExecutor {
    pub fn new(
        dispatcher: Arc<ActionDispatcher>,
        store: Arc<dyn RunStore>,
        event_bus: Arc<EventBus>,
        clock: Clock,
        default_action_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            store,
            event_bus,
            clock,
            default_action_timeout,
        }
    }

    /// Step a running run until it suspends or terminates.
    ///
    /// `cancel` is checked between steps and between retries; an in-flight
    /// dispatch is never interrupted.
    pub async fn advance(
        &self,
        graph: &WorkflowGraph,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<Advance> {
        let settings = &graph.definition().settings;
        let deadline = run_deadline(settings, run);

        loop {
            let Some(node_id) = run.cursor.first().cloned() else {
                return self.finish(graph, run, RunStatus::Completed, None).await;
            };
            let open = run
                .open_step()
                .filter(|&i| run.steps[i].node_id == node_id);

            if self.expired(deadline) {
                if let Some(idx) = open {
                    run.steps[idx].fail(FlowError::Timeout.to_string(), self.clock.now());
                    self.step_finished(settings, run, idx);
                }
                warn!(run_id = %run.id, node_id = %node_id, "Run exceeded its timeout");
                return self
                    .finish(graph, run, RunStatus::Failed, Some(FlowError::Timeout.to_string()))
                    .await;
            }

            if cancel.is_cancelled() {
                let idx = match open {
                    Some(idx) => idx,
                    None => run.push_step(RunStep::new(node_id.as_str())),
                };
                run.steps[idx].skip(self.clock.now());
                self.step_finished(settings, run, idx);
                return self.finish(graph, run, RunStatus::Cancelled, None).await;
            }

            let Some(node) = graph.node(&node_id) else {
                let msg = format!("run cursor points at unknown node '{}'", node_id);
                return self.finish(graph, run, RunStatus::Failed, Some(msg)).await;
            };

            let outcome = match &node.config {
                NodeConfig::Trigger(_) => self.run_trigger(graph, run, node),
                NodeConfig::Condition(cond) => self.run_condition(graph, run, node, cond),
                NodeConfig::Delay(delay) => self.run_delay(graph, run, node, delay, open, deadline),
                NodeConfig::Script(_)
                | NodeConfig::Action(_)
                | NodeConfig::Webhook(_)
                | NodeConfig::Escalation(_) => {
                    self.run_work(graph, run, node, open, deadline, cancel).await?
                }
            };

            match outcome {
                Outcome::Next(targets) => {
                    run.cursor.remove(0);
                    for target in targets {
                        let seen = run.cursor.contains(&target)
                            || run.steps_for(&target).next().is_some();
                        if !seen {
                            run.cursor.push(target);
                        }
                    }
                    self.store.save_run(run).await?;
                }
                Outcome::Suspend(at) => {
                    self.store.save_run(run).await?;
                    debug!(run_id = %run.id, node_id = %node_id, resume_at = %at, "Run suspended");
                    self.event_bus.publish(EngineEvent::RunSuspended {
                        run_id: run.id.clone(),
                        node_id,
                        resume_at: at,
                    });
                    return Ok(Advance::Suspended(at));
                }
                Outcome::Fail(msg) => {
                    return self.finish(graph, run, RunStatus::Failed, Some(msg)).await;
                }
                Outcome::Cancelled => {
                    return self.finish(graph, run, RunStatus::Cancelled, None).await;
                }
            }
        }
    }

    fn run_trigger(&self, graph: &WorkflowGraph, run: &mut WorkflowRun, node: &Node) -> Outcome {
        let settings = &graph.definition().settings;
        let idx = self.open_new_step(settings, run, &node.id);
        let output = json!({ "trigger_type": run.trigger_type });
        run.steps[idx].complete(Some(output), self.clock.now());
        self.step_finished(settings, run, idx);
        Outcome::Next(follow(graph, node))
    }

    fn run_condition(
        &self,
        graph: &WorkflowGraph,
        run: &mut WorkflowRun,
        node: &Node,
        cond: &ConditionConfig,
    ) -> Outcome {
        let settings = &graph.definition().settings;
        let idx = self.open_new_step(settings, run, &node.id);
        let edges = graph.outgoing_edges(&node.id);

        let selected = condition::evaluate(cond, &run.context).and_then(|result| {
            if edges.is_empty() {
                return Ok((result, None));
            }
            condition::select_branch(&node.id, &edges, result)
                .map(|edge| (result, Some(edge.target.clone())))
        });

        match selected {
            Ok((result, target)) => {
                debug!(run_id = %run.id, node_id = %node.id, branch = result, "Condition evaluated");
                let output = json!({
                    "branch": result.to_string(),
                    "target": target,
                });
                run.steps[idx].complete(Some(output), self.clock.now());
                self.step_finished(settings, run, idx);
                Outcome::Next(target.into_iter().collect())
            }
            Err(e) => {
                let msg = e.to_string();
                run.steps[idx].fail(msg.clone(), self.clock.now());
                self.step_finished(settings, run, idx);
                Outcome::Fail(msg)
            }
        }
    }

    fn run_delay(
        &self,
        graph: &WorkflowGraph,
        run: &mut WorkflowRun,
        node: &Node,
        delay: &DelayConfig,
        open: Option<usize>,
        deadline: Option<DateTime<Utc>>,
    ) -> Outcome {
        let settings = &graph.definition().settings;
        let now = self.clock.now();

        let idx = match open {
            Some(idx) => idx,
            None => {
                let idx = self.open_new_step(settings, run, &node.id);
                let wait = chrono::Duration::from_std(delay.duration())
                    .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
                run.steps[idx].resume_at =
                    Some(now.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC));
                idx
            }
        };

        let resume_at = run.steps[idx].resume_at.unwrap_or(now);
        if now >= resume_at {
            run.steps[idx].complete(Some(json!({ "resumed_at": now })), now);
            self.step_finished(settings, run, idx);
            return Outcome::Next(follow(graph, node));
        }

        // Wake at the deadline instead if it comes first; the timeout check
        // at the top of the loop then fails the run.
        Outcome::Suspend(deadline.map_or(resume_at, |d| d.min(resume_at)))
    }

    async fn run_work(
        &self,
        graph: &WorkflowGraph,
        run: &mut WorkflowRun,
        node: &Node,
        open: Option<usize>,
        deadline: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let settings = &graph.definition().settings;
        let idx = match open {
            // Interrupted by a restart mid-attempt: run the attempt again.
            Some(idx) => {
                self.step_started(settings, run, idx);
                idx
            }
            None => self.open_new_step(settings, run, &node.id),
        };
        self.store.save_run(run).await?;

        loop {
            let attempt = run.steps[idx].retry_count;
            let result = self.perform(graph, run, node, attempt, deadline).await;

            if self.expired(deadline) {
                run.steps[idx].fail(FlowError::Timeout.to_string(), self.clock.now());
                self.step_finished(settings, run, idx);
                return Ok(Outcome::Fail(FlowError::Timeout.to_string()));
            }

            let err = match result {
                Ok(work) => {
                    let output = match work {
                        Work::Action(result) => {
                            for (path, value) in result.context_updates {
                                set_path(&mut run.context, &path, value);
                            }
                            result.output
                        }
                        Work::Script { context, summary } => {
                            run.context = context;
                            Some(summary)
                        }
                    };
                    run.steps[idx].complete(output, self.clock.now());
                    self.step_finished(settings, run, idx);
                    return Ok(Outcome::Next(follow(graph, node)));
                }
                Err(e) => e,
            };

            let msg = err.to_string();
            warn!(
                run_id = %run.id,
                node_id = %node.id,
                attempt,
                error = %msg,
                "Step failed"
            );

            if !err.is_policy_governed() {
                run.steps[idx].fail(msg.clone(), self.clock.now());
                self.step_finished(settings, run, idx);
                return Ok(Outcome::Fail(msg));
            }

            match settings.error_handling {
                ErrorHandling::Stop => {
                    run.steps[idx].fail(msg.clone(), self.clock.now());
                    self.step_finished(settings, run, idx);
                    return Ok(Outcome::Fail(msg));
                }
                ErrorHandling::Continue => {
                    run.steps[idx].fail(msg, self.clock.now());
                    self.step_finished(settings, run, idx);
                    return Ok(Outcome::Next(follow(graph, node)));
                }
                ErrorHandling::Retry => {
                    if run.steps[idx].retry_count >= settings.retry_attempts {
                        run.steps[idx].fail(msg.clone(), self.clock.now());
                        self.step_finished(settings, run, idx);
                        return Ok(Outcome::Fail(msg));
                    }

                    let retry = run.steps[idx].retry_count + 1;
                    let backoff = settings.retry_backoff.delay(retry);
                    if let Some(d) = deadline {
                        if self.clock.until(d) <= backoff {
                            tokio::time::sleep_until(self.clock.instant_at(d)).await;
                            run.steps[idx].fail(FlowError::Timeout.to_string(), self.clock.now());
                            self.step_finished(settings, run, idx);
                            return Ok(Outcome::Fail(FlowError::Timeout.to_string()));
                        }
                    }

                    run.steps[idx].error_message = Some(msg.clone());
                    self.store.save_run(run).await?;
                    debug!(
                        run_id = %run.id,
                        node_id = %node.id,
                        retry,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying step"
                    );
                    tokio::time::sleep(backoff).await;

                    if cancel.is_cancelled() {
                        run.steps[idx].fail(msg, self.clock.now());
                        self.step_finished(settings, run, idx);
                        return Ok(Outcome::Cancelled);
                    }

                    run.steps[idx].retry_count = retry;
                    self.store.save_run(run).await?;
                    self.step_started(settings, run, idx);
                }
            }
        }
    }

    async fn perform(
        &self,
        graph: &WorkflowGraph,
        run: &WorkflowRun,
        node: &Node,
        attempt: u32,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Work> {
        if let NodeConfig::Script(script) = &node.config {
            let (context, summary) = run_script(script, &run.context)?;
            return Ok(Work::Script { context, summary });
        }

        let ctx = RunContext {
            run_id: run.id.clone(),
            workflow_id: run.workflow_id.clone(),
            node_id: node.id.clone(),
            attempt,
            context: run.context.clone(),
        };
        let per_call = match deadline {
            Some(d) => self.clock.until(d) / graph.remaining_from(&node.id).max(1) as u32,
            None => self.default_action_timeout,
        };
        self.dispatcher
            .dispatch(node, ctx, per_call)
            .await
            .map(Work::Action)
    }

    async fn finish(
        &self,
        graph: &WorkflowGraph,
        run: &mut WorkflowRun,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Advance> {
        let settings = &graph.definition().settings;
        run.finish(status, error.clone(), self.clock.now());
        self.store.save_run(run).await?;

        info!(
            run_id = %run.id,
            workflow_id = %run.workflow_id,
            status = %status,
            steps = run.steps.len(),
            "Run finished"
        );

        self.event_bus.publish(EngineEvent::RunFinished {
            run_id: run.id.clone(),
            workflow_id: run.workflow_id.clone(),
            status,
            error: error.clone(),
        });
        if status == RunStatus::Failed && settings.notify_on_failure {
            self.event_bus.publish(EngineEvent::FailureNotification {
                run_id: run.id.clone(),
                workflow_id: run.workflow_id.clone(),
                error: error.unwrap_or_default(),
            });
        }
        Ok(Advance::Finished(status))
    }

    fn expired(&self, deadline: Option<DateTime<Utc>>) -> bool {
        deadline.is_some_and(|d| self.clock.now() >= d)
    }

    fn open_new_step(&self, settings: &WorkflowSettings, run: &mut WorkflowRun, node_id: &str) -> usize {
        let mut step = RunStep::new(node_id);
        step.start(self.clock.now());
        let idx = run.push_step(step);
        self.step_started(settings, run, idx);
        idx
    }

    fn step_started(&self, settings: &WorkflowSettings, run: &WorkflowRun, idx: usize) {
        let step = &run.steps[idx];
        debug!(run_id = %run.id, node_id = %step.node_id, attempt = step.retry_count, "Step started");
        if settings.logging_enabled {
            self.event_bus.publish(EngineEvent::StepStarted {
                run_id: run.id.clone(),
                node_id: step.node_id.clone(),
                attempt: step.retry_count,
            });
        }
    }

    fn step_finished(&self, settings: &WorkflowSettings, run: &WorkflowRun, idx: usize) {
        let step = &run.steps[idx];
        debug!(run_id = %run.id, node_id = %step.node_id, status = ?step.status, "Step finished");
        if settings.logging_enabled {
            self.event_bus.publish(EngineEvent::StepFinished {
                run_id: run.id.clone(),
                node_id: step.node_id.clone(),
                status: step.status,
                error: step.error_message.clone(),
            });
        }
    }
}

/// Wall-clock deadline of a run, if its workflow sets a timeout.
///
/// A timeout too large to represent saturates to the end of time.
pub fn run_deadline(settings: &WorkflowSettings, run: &WorkflowRun) -> Option<DateTime<Utc>> {
    let secs = settings.timeout_seconds?;
    let started = run.started_at?;
    let deadline = i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|budget| started.checked_add_signed(budget));
    Some(deadline.unwrap_or(DateTime::<Utc>::MAX_UTC))
}

/// Targets to queue after `node` completes.
fn follow(graph: &WorkflowGraph, node: &Node) -> Vec<String> {
    let edges = graph.outgoing_edges(&node.id);
    if graph.definition().settings.execution.parallel_execution {
        edges.iter().map(|e| e.target.clone()).collect()
    } else {
        edges.first().map(|e| vec![e.target.clone()]).unwrap_or_default()
    }
}
