use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// The record of one node's execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: String,
    pub node_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Handler output, chosen branch, or script summary.
    #[serde(default)]
    pub output: Option<Value>,
    /// When a suspended delay step becomes due.
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
}

impl RunStep {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error_message: None,
            output: None,
            resume_at: None,
        }
    }

    /// Mark the step running. A retried step keeps its first start time.
    pub fn start(&mut self, at: DateTime<Utc>) {
        self.status = StepStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(at);
        }
    }

    pub fn complete(&mut self, output: Option<Value>, at: DateTime<Utc>) {
        self.status = StepStatus::Completed;
        self.output = output;
        self.error_message = None;
        self.completed_at = Some(at);
    }

    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = StepStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(at);
    }

    pub fn skip(&mut self, at: DateTime<Utc>) {
        self.status = StepStatus::Skipped;
        self.completed_at = Some(at);
    }

    /// The chosen branch of a completed condition step.
    pub fn branch(&self) -> Option<bool> {
        self.output.as_ref()?.get("branch")?.as_str()?.parse().ok()
    }
}

/// A single execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: String,
    pub trigger_type: String,
    pub status: RunStatus,
    /// Trigger payload merged over the workflow variables.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Node ids still to advance from, in order.
    #[serde(default)]
    pub cursor: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the run is admitted to `Running`.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub steps: Vec<RunStep>,
}

impl WorkflowRun {
    /// Create a pending run positioned at the trigger node.
    pub fn new(
        workflow_id: impl Into<String>,
        trigger_type: impl Into<String>,
        trigger_node: impl Into<String>,
        context: Map<String, Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::new(),
            workflow_id: workflow_id.into(),
            trigger_type: trigger_type.into(),
            status: RunStatus::Pending,
            context,
            cursor: vec![trigger_node.into()],
            created_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            steps: vec![],
        }
    }

    /// Move a pending run to running. `at` starts the timeout clock.
    pub fn admit(&mut self, at: DateTime<Utc>) {
        self.status = RunStatus::Running;
        self.started_at = Some(at);
    }

    /// Set a terminal status.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>, at: DateTime<Utc>) {
        self.status = status;
        self.error_message = error;
        self.completed_at = Some(at);
    }

    /// Append a step and return its index.
    pub fn push_step(&mut self, step: RunStep) -> usize {
        self.steps.push(step);
        self.steps.len() - 1
    }

    /// The most recent step, if it is still running.
    pub fn open_step(&self) -> Option<usize> {
        let idx = self.steps.len().checked_sub(1)?;
        (self.steps[idx].status == StepStatus::Running).then_some(idx)
    }

    /// Steps recorded for a node, in order.
    pub fn steps_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a RunStep> + 'a {
        self.steps.iter().filter(move |s| s.node_id == node_id)
    }

    /// A suspended delay step, if the run is parked on one.
    pub fn suspended_until(&self) -> Option<DateTime<Utc>> {
        let idx = self.open_step()?;
        self.steps[idx].resume_at
    }
}
