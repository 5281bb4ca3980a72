use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use flowline_core::error::{FlowError, Result};
use flowline_core::run::{RunId, RunStatus, WorkflowRun};
use flowline_core::traits::{DefinitionStore, RunStore};
use flowline_core::workflow::WorkflowDefinition;

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<RunId, WorkflowRun>>,
    definitions: Mutex<HashMap<String, WorkflowDefinition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first(mut runs: Vec<WorkflowRun>) -> Vec<WorkflowRun> {
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    runs
}

fn poisoned<E: std::fmt::Display>(e: E) -> FlowError {
    FlowError::Database(e.to_string())
}

impl RunStore for MemoryStore {
    fn save_run(&self, run: &WorkflowRun) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            self.runs.lock().map_err(poisoned)?.insert(run.id.clone(), run);
            Ok(())
        })
    }

    fn load_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<WorkflowRun>>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.runs.lock().map_err(poisoned)?.get(&id).cloned()) })
    }

    fn list_runs(
        &self,
        workflow_id: &str,
        status: Option<RunStatus>,
    ) -> BoxFuture<'_, Result<Vec<WorkflowRun>>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            let runs = self
                .runs
                .lock()
                .map_err(poisoned)?
                .values()
                .filter(|r| r.workflow_id == workflow_id)
                .filter(|r| status.map_or(true, |s| r.status == s))
                .cloned()
                .collect();
            Ok(oldest_first(runs))
        })
    }

    fn list_unfinished(&self) -> BoxFuture<'_, Result<Vec<WorkflowRun>>> {
        Box::pin(async move {
            let runs = self
                .runs
                .lock()
                .map_err(poisoned)?
                .values()
                .filter(|r| !r.status.is_terminal())
                .cloned()
                .collect();
            Ok(oldest_first(runs))
        })
    }
}

impl DefinitionStore for MemoryStore {
    fn save_definition(&self, def: &WorkflowDefinition) -> BoxFuture<'_, Result<()>> {
        let def = def.clone();
        Box::pin(async move {
            self.definitions
                .lock()
                .map_err(poisoned)?
                .insert(def.id.clone(), def);
            Ok(())
        })
    }

    fn load_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.definitions.lock().map_err(poisoned)?.get(&id).cloned()) })
    }

    fn list_definitions(&self) -> BoxFuture<'_, Result<Vec<WorkflowDefinition>>> {
        Box::pin(async move {
            let mut defs: Vec<WorkflowDefinition> =
                self.definitions.lock().map_err(poisoned)?.values().cloned().collect();
            defs.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(defs)
        })
    }
}
