use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::run::{RunId, RunStatus, WorkflowRun};
use crate::types::{ActionResult, RunContext};
use crate::workflow::WorkflowDefinition;

/// Action handler — the side-effecting work behind action, webhook and
/// escalation nodes (send email, create task, call webhook...).
pub trait ActionHandler: Send + Sync + 'static {
    /// Execute with the node's resolved configuration.
    fn execute(
        &self,
        ctx: RunContext,
        config: Map<String, Value>,
    ) -> BoxFuture<'_, Result<ActionResult>>;
}

/// Run store — durable run records.
pub trait RunStore: Send + Sync + 'static {
    /// Insert or replace a run.
    fn save_run(&self, run: &WorkflowRun) -> BoxFuture<'_, Result<()>>;

    /// Load a run by id.
    fn load_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<WorkflowRun>>>;

    /// Runs of one workflow, oldest first, optionally filtered by status.
    fn list_runs(
        &self,
        workflow_id: &str,
        status: Option<RunStatus>,
    ) -> BoxFuture<'_, Result<Vec<WorkflowRun>>>;

    /// All pending or running runs, oldest first. Used for restart recovery.
    fn list_unfinished(&self) -> BoxFuture<'_, Result<Vec<WorkflowRun>>>;
}

/// Definition store — durable workflow definitions.
pub trait DefinitionStore: Send + Sync + 'static {
    /// Insert or replace a definition.
    fn save_definition(&self, def: &WorkflowDefinition) -> BoxFuture<'_, Result<()>>;

    /// Load a definition by id.
    fn load_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>>;

    /// All stored definitions.
    fn list_definitions(&self) -> BoxFuture<'_, Result<Vec<WorkflowDefinition>>>;
}
