use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use flowline_core::error::{FlowError, Result};
use flowline_core::traits::ActionHandler;
use flowline_core::types::{ActionResult, RunContext};
use flowline_core::workflow::{Node, NodeConfig};

use crate::template::render_map;

/// Handler key used for webhook nodes.
pub const WEBHOOK_KIND: &str = "webhook";
/// Handler key used for escalation nodes.
pub const ESCALATION_KIND: &str = "escalation";

/// Registry of action handlers, keyed by action type.
pub struct ActionDispatcher {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Replaces any handler already registered for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, handler: impl ActionHandler) {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    /// Register a shared handler.
    pub fn register_arc(&mut self, kind: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Unregister a handler by kind.
    pub fn unregister(&mut self, kind: &str) -> bool {
        self.handlers.remove(kind).is_some()
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// List all registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Invoke the handler for a dispatched node.
    ///
    /// Placeholders in the node configuration are resolved against
    /// `ctx.context` first. Every failure, including a missing handler and
    /// an expired `deadline`, comes back as [`FlowError::Action`].
    pub async fn dispatch(
        &self,
        node: &Node,
        ctx: RunContext,
        deadline: Duration,
    ) -> Result<ActionResult> {
        let (kind, raw) = handler_input(node)?;
        let config = render_map(&raw, &ctx.context);

        let handler = self
            .get(&kind)
            .ok_or_else(|| FlowError::action(&kind, "no handler registered"))?;

        debug!(
            node_id = %node.id,
            kind = %kind,
            deadline_ms = deadline.as_millis() as u64,
            "Dispatching action"
        );

        match tokio::time::timeout(deadline, handler.execute(ctx, config)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e @ FlowError::Action { .. })) => Err(e),
            Ok(Err(e)) => Err(FlowError::action(&kind, e)),
            Err(_) => Err(FlowError::action(
                &kind,
                format!("timed out after {}ms", deadline.as_millis()),
            )),
        }
    }
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler key and unresolved configuration map for a node.
fn handler_input(node: &Node) -> Result<(String, Map<String, Value>)> {
    match &node.config {
        NodeConfig::Action(action) => Ok((action.action_type.clone(), action.params.clone())),
        NodeConfig::Webhook(webhook) => Ok((WEBHOOK_KIND.to_string(), to_map(webhook)?)),
        NodeConfig::Escalation(escalation) => {
            Ok((ESCALATION_KIND.to_string(), to_map(escalation)?))
        }
        other => Err(FlowError::action(
            other.kind().to_string(),
            format!("node '{}' is not dispatchable", node.id),
        )),
    }
}

fn to_map<T: serde::Serialize>(config: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(config)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}
