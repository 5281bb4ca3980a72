use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A workflow definition: a directed graph of typed nodes plus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Incremented on every accepted update.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Declaration order is significant for branch selection.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Defaults merged into every run's context.
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Create an empty draft definition.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            nodes: vec![],
            edges: vec![],
            variables: Map::new(),
            settings: WorkflowSettings::default(),
            status: WorkflowStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The first trigger node in declaration order.
    pub fn trigger(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.kind() == NodeKind::Trigger)
    }
}

/// Lifecycle status of a definition.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown workflow status '{}'", other)),
        }
    }
}

/// Per-workflow execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Wall-clock deadline measured from the run's start. `None` = unbounded.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    #[serde(default)]
    pub retry_backoff: Backoff,
    #[serde(default = "default_logging_enabled")]
    pub logging_enabled: bool,
    #[serde(default)]
    pub notify_on_failure: bool,
    #[serde(default)]
    pub execution: ExecutionSettings,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            retry_attempts: default_retry_attempts(),
            error_handling: ErrorHandling::default(),
            retry_backoff: Backoff::default(),
            logging_enabled: default_logging_enabled(),
            notify_on_failure: false,
            execution: ExecutionSettings::default(),
        }
    }
}

fn default_retry_attempts() -> u32 { 3 }
fn default_logging_enabled() -> bool { true }

/// What happens to a run when an action step fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHandling {
    #[default]
    Stop,
    Continue,
    Retry,
}

/// Delay between retries of a failing step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed { secs: u64 },
    /// `base_secs * 2^(n-1)` before retry `n`, capped at `max_secs`.
    Exponential {
        #[serde(default = "default_backoff_base")]
        base_secs: u64,
        #[serde(default = "default_backoff_max")]
        max_secs: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base_secs: default_backoff_base(),
            max_secs: default_backoff_max(),
        }
    }
}

fn default_backoff_base() -> u64 { 1 }
fn default_backoff_max() -> u64 { 60 }

impl Backoff {
    /// Delay before the given retry (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Self::Fixed { secs } => Duration::from_secs(*secs),
            Self::Exponential { base_secs, max_secs } => {
                let exp = retry.saturating_sub(1).min(32);
                let secs = base_secs.saturating_mul(2u64.saturating_pow(exp));
                Duration::from_secs(secs.min(*max_secs))
            }
        }
    }
}

/// Concurrency settings shared by all runs of one workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Follow every outgoing edge of a non-condition node instead of the first.
    #[serde(default)]
    pub parallel_execution: bool,
    /// Cap on simultaneously running runs. `None` uses the engine default.
    #[serde(default)]
    pub max_concurrent_runs: Option<usize>,
}

/// A vertex in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub config: NodeConfig,
}

impl Node {
    pub fn new(id: impl Into<String>, label: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            config,
        }
    }

    pub fn trigger(id: impl Into<String>, event: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(
            id.clone(),
            id,
            NodeConfig::Trigger(TriggerConfig {
                event: event.into(),
                schedule: None,
            }),
        )
    }

    pub fn action(id: impl Into<String>, action_type: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(
            id.clone(),
            id,
            NodeConfig::Action(ActionConfig {
                action_type: action_type.into(),
                params: Map::new(),
            }),
        )
    }

    pub fn condition(
        id: impl Into<String>,
        field: impl Into<String>,
        operator: Operator,
        value: Value,
    ) -> Self {
        let id = id.into();
        Self::new(
            id.clone(),
            id,
            NodeConfig::Condition(ConditionConfig {
                field: field.into(),
                operator,
                value,
            }),
        )
    }

    pub fn delay(id: impl Into<String>, amount: u64, unit: DelayUnit) -> Self {
        let id = id.into();
        Self::new(id.clone(), id, NodeConfig::Delay(DelayConfig { amount, unit }))
    }

    /// Add a parameter to an action node. No effect on other kinds.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        if let NodeConfig::Action(ref mut action) = self.config {
            action.params.insert(key.into(), value);
        }
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }
}

/// Node kinds, without their configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Action,
    Condition,
    Delay,
    Script,
    Webhook,
    Escalation,
}

impl NodeKind {
    /// Kinds whose work goes through the action dispatcher.
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Action | Self::Webhook | Self::Escalation)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Condition => "condition",
            Self::Delay => "delay",
            Self::Script => "script",
            Self::Webhook => "webhook",
            Self::Escalation => "escalation",
        };
        f.write_str(s)
    }
}

/// Kind-specific node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    Trigger(TriggerConfig),
    Action(ActionConfig),
    Condition(ConditionConfig),
    Delay(DelayConfig),
    Script(ScriptConfig),
    Webhook(WebhookConfig),
    Escalation(EscalationConfig),
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Trigger(_) => NodeKind::Trigger,
            Self::Action(_) => NodeKind::Action,
            Self::Condition(_) => NodeKind::Condition,
            Self::Delay(_) => NodeKind::Delay,
            Self::Script(_) => NodeKind::Script,
            Self::Webhook(_) => NodeKind::Webhook,
            Self::Escalation(_) => NodeKind::Escalation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Event name that admits runs (e.g. `client_signed_up`). `*` accepts any.
    pub event: String,
    /// Cron expression for time-based triggers.
    #[serde(default)]
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Handler key in the action dispatcher.
    pub action_type: String,
    /// Handler-specific parameters; strings may contain `{{path}}` placeholders.
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// Dotted path into the run context.
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

/// Comparison operators supported by condition nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    In,
    NotIn,
    Contains,
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Contains => "contains",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    pub amount: u64,
    #[serde(default)]
    pub unit: DelayUnit,
}

impl DelayConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.amount.saturating_mul(self.unit.seconds()))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    pub fn seconds(&self) -> u64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 3_600,
            Self::Days => 86_400,
        }
    }
}

/// A sandboxed, side-effect free transformation of the run context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub operations: Vec<ScriptOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    /// Write a value; string values may contain `{{path}}` placeholders.
    Set { path: String, value: Value },
    /// Copy the value at `from` to `to`. Missing sources copy `null`.
    Copy { from: String, to: String },
    /// Remove a path. Missing paths are ignored.
    Remove { path: String },
    /// Add `by` to a numeric value; missing paths start at zero.
    Increment {
        path: String,
        #[serde(default = "default_increment")]
        by: f64,
    },
    /// Push a value onto an array; missing paths start empty.
    Append { path: String, value: Value },
}

fn default_increment() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_webhook_method() -> String {
    "POST".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Who or what receives the escalation (user, team, queue).
    pub escalate_to: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Branch tag for condition nodes (`"true"` / `"false"`).
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl Edge {
    /// Create an untagged edge.
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
            label: None,
        }
    }

    /// Create an edge taken when a condition evaluates to `branch`.
    pub fn branch(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        branch: bool,
    ) -> Self {
        Self {
            condition: Some(branch.to_string()),
            ..Self::new(id, source, target)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
