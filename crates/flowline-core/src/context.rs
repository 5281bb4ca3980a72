//! Dotted-path access into a run context.
//!
//! A run context is a JSON object. Paths like `client.address.city` walk
//! nested objects; numeric segments index into arrays on lookup.

use serde_json::{Map, Value};

/// Look up a dotted path. Returns `None` if any segment is missing.
pub fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(arr) => arr.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
///
/// A non-object value standing in the way of the path is replaced.
pub fn set_path(context: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };

    let mut current = context;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(obj) => obj,
            _ => unreachable!("entry was just made an object"),
        };
    }
    current.insert(last.to_string(), value);
}

/// Remove a dotted path. Returns the removed value, if any.
pub fn remove_path(context: &mut Map<String, Value>, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => context.remove(path),
        Some((parent, last)) => {
            let mut current = context;
            for segment in parent.split('.') {
                current = current.get_mut(segment)?.as_object_mut()?;
            }
            current.remove(last)
        }
    }
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; anything
/// else in `overlay` replaces the value in `base`.
pub fn merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge(existing, incoming),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Build the initial context of a run: workflow variables overlaid with the trigger payload.
pub fn initial_context(variables: &Map<String, Value>, payload: &Map<String, Value>) -> Map<String, Value> {
    let mut context = variables.clone();
    merge(&mut context, payload);
    context
}

/// Render a value as plain text (strings unquoted, `null` empty).
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
