use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::run::{RunId, RunStatus, StepStatus};

/// Context passed to action handlers.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub workflow_id: String,
    pub node_id: String,
    /// 0 for the first attempt, incremented per retry.
    pub attempt: u32,
    /// Snapshot of the run context at dispatch time.
    pub context: Map<String, Value>,
}

/// Result of a successful action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionResult {
    /// Recorded on the step.
    #[serde(default)]
    pub output: Option<Value>,
    /// Written into the run context; dotted keys set nested paths.
    #[serde(default)]
    pub context_updates: Map<String, Value>,
}

impl ActionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            context_updates: Map::new(),
        }
    }

    pub fn update(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Run created but waiting for a concurrency slot.
    RunQueued { run_id: RunId, workflow_id: String },
    /// Run admitted and executing.
    RunStarted { run_id: RunId, workflow_id: String },
    /// A step began (or began another attempt).
    StepStarted {
        run_id: RunId,
        node_id: String,
        attempt: u32,
    },
    /// A step reached a terminal status.
    StepFinished {
        run_id: RunId,
        node_id: String,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Run parked on a delay node.
    RunSuspended {
        run_id: RunId,
        node_id: String,
        resume_at: DateTime<Utc>,
    },
    /// Run reached a terminal status.
    RunFinished {
        run_id: RunId,
        workflow_id: String,
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A run failed on a workflow with `notify_on_failure` set.
    FailureNotification {
        run_id: RunId,
        workflow_id: String,
        error: String,
    },
}

impl EngineEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunQueued { run_id, .. }
            | Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepFinished { run_id, .. }
            | Self::RunSuspended { run_id, .. }
            | Self::RunFinished { run_id, .. }
            | Self::FailureNotification { run_id, .. } => run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_result_builder() {
        let result = ActionResult::with_output(serde_json::json!({ "ok": true }))
            .update("manager.assigned", serde_json::json!("dana"));
        assert_eq!(result.output, Some(serde_json::json!({ "ok": true })));
        assert_eq!(result.context_updates.len(), 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = EngineEvent::RunFinished {
            run_id: RunId::from_string("r1"),
            workflow_id: "wf".into(),
            status: RunStatus::Failed,
            error: Some("timeout".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "run_finished");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["run_id"], "r1");
        assert_eq!(event.run_id().as_str(), "r1");
    }
}
