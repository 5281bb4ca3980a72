use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{info, warn};

use flowline_core::context::display_value;
use flowline_core::error::Result;
use flowline_core::traits::ActionHandler;
use flowline_core::types::{ActionResult, RunContext};

/// Emits the resolved `message` param as a tracing event.
pub struct LogHandler;

impl ActionHandler for LogHandler {
    fn execute(
        &self,
        ctx: RunContext,
        config: Map<String, Value>,
    ) -> BoxFuture<'_, Result<ActionResult>> {
        Box::pin(async move {
            let message = config.get("message").map(display_value).unwrap_or_default();
            let level = config.get("level").and_then(|v| v.as_str()).unwrap_or("info");

            if level.eq_ignore_ascii_case("warn") {
                warn!(run_id = %ctx.run_id, node_id = %ctx.node_id, "{}", message);
            } else {
                info!(run_id = %ctx.run_id, node_id = %ctx.node_id, "{}", message);
            }

            Ok(ActionResult::with_output(serde_json::json!({ "message": message })))
        })
    }
}
