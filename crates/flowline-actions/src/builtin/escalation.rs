use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use flowline_core::error::{FlowError, Result};
use flowline_core::traits::ActionHandler;
use flowline_core::types::{ActionResult, RunContext};
use flowline_core::workflow::Priority;

use crate::registry::ESCALATION_KIND;

/// Records an escalation on the run context under `escalation`.
///
/// Delivery to a human (ticket, page, email) belongs to whatever consumes
/// the run record; this handler only makes the escalation visible there.
pub struct EscalationHandler;

#[derive(Deserialize)]
struct EscalationInput {
    escalate_to: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    priority: Priority,
}

impl ActionHandler for EscalationHandler {
    fn execute(
        &self,
        ctx: RunContext,
        config: Map<String, Value>,
    ) -> BoxFuture<'_, Result<ActionResult>> {
        Box::pin(async move {
            let p: EscalationInput = serde_json::from_value(Value::Object(config))
                .map_err(|e| FlowError::action(ESCALATION_KIND, format!("invalid config: {}", e)))?;

            if p.escalate_to.trim().is_empty() || p.escalate_to.contains("{{") {
                return Err(FlowError::action(
                    ESCALATION_KIND,
                    format!("unresolved escalation target '{}'", p.escalate_to),
                ));
            }

            warn!(
                run_id = %ctx.run_id,
                workflow_id = %ctx.workflow_id,
                escalate_to = %p.escalate_to,
                priority = ?p.priority,
                "Run escalated"
            );

            let record = serde_json::json!({
                "escalate_to": p.escalate_to,
                "reason": p.reason,
                "priority": p.priority,
                "node_id": ctx.node_id,
                "at": chrono::Utc::now().to_rfc3339(),
            });
            Ok(ActionResult::with_output(record.clone()).update("escalation", record))
        })
    }
}
