//! Mustache-style `{{path}}` substitution against a run context.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use flowline_core::context::{display_value, lookup};

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
            .expect("placeholder pattern is valid")
    })
}

/// Substitute placeholders inside a string. Unresolved placeholders are left verbatim.
pub fn render_str(template: &str, context: &Map<String, Value>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| match lookup(context, &caps[1]) {
            Some(value) => display_value(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Substitute placeholders in every string of a JSON value.
///
/// A string consisting of exactly one resolvable placeholder takes the
/// referenced value with its type (`"{{client.seats}}"` → `42`).
pub fn render_value(value: &Value, context: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = placeholder().captures(s) {
                if caps[0].len() == s.trim().len() {
                    if let Some(found) = lookup(context, &caps[1]) {
                        return found.clone();
                    }
                }
            }
            Value::String(render_str(s, context))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, context)).collect()),
        Value::Object(obj) => Value::Object(render_map(obj, context)),
        other => other.clone(),
    }
}

/// Substitute placeholders in every value of a map.
pub fn render_map(map: &Map<String, Value>, context: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), render_value(v, context)))
        .collect()
}
