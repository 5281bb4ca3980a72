//! Script nodes: a fixed set of pure context operations.

use serde_json::{Map, Value};

use flowline_actions::render_value;
use flowline_core::context::{lookup, remove_path, set_path};
use flowline_core::error::{FlowError, Result};
use flowline_core::workflow::{ScriptConfig, ScriptOp};

/// Apply a script to a copy of `context`.
///
/// Operations run in order against the copy; the original is untouched if
/// any operation fails. Returns the new context and a step summary.
pub fn run_script(
    script: &ScriptConfig,
    context: &Map<String, Value>,
) -> Result<(Map<String, Value>, Value)> {
    let mut next = context.clone();
    let mut touched = Vec::with_capacity(script.operations.len());

    for (i, op) in script.operations.iter().enumerate() {
        apply(op, &mut next).map_err(|msg| FlowError::Script(format!("operation {}: {}", i + 1, msg)))?;
        touched.push(target(op).to_string());
    }

    let summary = serde_json::json!({ "operations": script.operations.len(), "paths": touched });
    Ok((next, summary))
}

fn target(op: &ScriptOp) -> &str {
    match op {
        ScriptOp::Set { path, .. }
        | ScriptOp::Remove { path }
        | ScriptOp::Increment { path, .. }
        | ScriptOp::Append { path, .. } => path,
        ScriptOp::Copy { to, .. } => to,
    }
}

fn apply(op: &ScriptOp, ctx: &mut Map<String, Value>) -> std::result::Result<(), String> {
    if target(op).is_empty() {
        return Err("empty path".into());
    }
    match op {
        ScriptOp::Set { path, value } => {
            let value = render_value(value, ctx);
            set_path(ctx, path, value);
        }
        ScriptOp::Copy { from, to } => {
            let value = lookup(ctx, from).cloned().unwrap_or(Value::Null);
            set_path(ctx, to, value);
        }
        ScriptOp::Remove { path } => {
            remove_path(ctx, path);
        }
        ScriptOp::Increment { path, by } => {
            let current = match lookup(ctx, path) {
                None | Some(Value::Null) => 0.0,
                Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                Some(other) => return Err(format!("'{}' is not numeric: {}", path, other)),
            };
            let sum = current + by;
            let value = if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
                Value::from(sum as i64)
            } else {
                serde_json::Number::from_f64(sum)
                    .map(Value::Number)
                    .ok_or_else(|| format!("'{}' overflowed", path))?
            };
            set_path(ctx, path, value);
        }
        ScriptOp::Append { path, value } => {
            let value = render_value(value, ctx);
            let mut items = match lookup(ctx, path) {
                None | Some(Value::Null) => vec![],
                Some(Value::Array(items)) => items.clone(),
                Some(other) => return Err(format!("'{}' is not an array: {}", path, other)),
            };
            items.push(value);
            set_path(ctx, path, Value::Array(items));
        }
    }
    Ok(())
}
