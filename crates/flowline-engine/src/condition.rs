//! Condition evaluation and branch selection.
//!
//! Fields are looked up by dotted path. A missing field is `null`, which
//! compares as `0` against numbers and `""` against strings. Equality is
//! loose: `"42" == 42` and `"true" == true`.

use serde_json::{Map, Value};

use flowline_core::context::{display_value, lookup};
use flowline_core::error::{FlowError, Result};
use flowline_core::workflow::{ConditionConfig, Edge, Operator};

/// Evaluate a condition against a run context.
pub fn evaluate(cond: &ConditionConfig, context: &Map<String, Value>) -> Result<bool> {
    let actual = lookup(context, &cond.field).unwrap_or(&Value::Null);
    let expected = &cond.value;

    match cond.operator {
        Operator::Equals => Ok(loose_eq(actual, expected)),
        Operator::NotEquals => Ok(!loose_eq(actual, expected)),
        Operator::GreaterThan => compare(cond, actual, expected, |a, b| a > b),
        Operator::LessThan => compare(cond, actual, expected, |a, b| a < b),
        Operator::In => Ok(literal_list(expected).iter().any(|item| loose_eq(actual, item))),
        Operator::NotIn => Ok(!literal_list(expected).iter().any(|item| loose_eq(actual, item))),
        Operator::Contains => Ok(contains(actual, expected)),
    }
}

/// Pick the edge to follow out of a condition node.
///
/// The first edge in declaration order whose tag equals `result` wins.
/// Untagged edges match either result.
pub fn select_branch<'a>(node_id: &str, edges: &[&'a Edge], result: bool) -> Result<&'a Edge> {
    let tag = if result { "true" } else { "false" };
    edges
        .iter()
        .find(|e| e.condition.as_deref().map_or(true, |t| t == tag))
        .copied()
        .ok_or_else(|| FlowError::NoMatchingBranch {
            node: node_id.to_string(),
            result,
        })
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        _ => None,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (to_f64(a), to_f64(b)) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => false,
        },
        (Value::Bool(x), Value::String(s)) | (Value::String(s), Value::Bool(x)) => {
            parse_bool(s) == Some(*x)
        }
        (Value::Null, Value::String(s)) | (Value::String(s), Value::Null) => s.is_empty(),
        (Value::Null, Value::Bool(x)) | (Value::Bool(x), Value::Null) => !*x,
        _ => a == b,
    }
}

fn compare(
    cond: &ConditionConfig,
    actual: &Value,
    expected: &Value,
    op: impl Fn(f64, f64) -> bool,
) -> Result<bool> {
    let numeric = |v: &Value| {
        to_f64(v).ok_or_else(|| FlowError::TypeMismatch {
            field: cond.field.clone(),
            operator: cond.operator.to_string(),
            message: format!("'{}' is not numeric", display_value(v)),
        })
    };
    Ok(op(numeric(actual)?, numeric(expected)?))
}

/// `"a, b ,c"` → `["a", "b", "c"]`. Arrays are taken as-is.
fn literal_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::String(s) => s
            .split(',')
            .map(|item| Value::String(item.trim().to_string()))
            .collect(),
        other => vec![other.clone()],
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&display_value(needle)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(obj) => obj.contains_key(&display_value(needle)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Map<String, Value> {
        json!({
            "client": {
                "type": "enterprise",
                "seats": 120,
                "seats_text": "120",
                "verified": true,
                "tags": ["priority", "emea"],
                "plan": { "tier": "gold" }
            }
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn cond(field: &str, operator: Operator, value: Value) -> ConditionConfig {
        ConditionConfig {
            field: field.into(),
            operator,
            value,
        }
    }

    fn eval(field: &str, operator: Operator, value: Value) -> bool {
        evaluate(&cond(field, operator, value), &ctx()).unwrap()
    }

    #[test]
    fn test_equality_is_loose() {
        assert!(eval("client.type", Operator::Equals, json!("enterprise")));
        assert!(eval("client.seats", Operator::Equals, json!("120")));
        assert!(eval("client.seats_text", Operator::Equals, json!(120)));
        assert!(eval("client.verified", Operator::Equals, json!("true")));
        assert!(eval("client.type", Operator::NotEquals, json!("individual")));
    }

    #[test]
    fn test_missing_field_is_typed_zero() {
        assert!(eval("client.region", Operator::Equals, json!("")));
        assert!(eval("client.region", Operator::Equals, json!(0)));
        assert!(eval("client.region", Operator::LessThan, json!(1)));
        assert!(!eval("client.region", Operator::GreaterThan, json!(0)));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval("client.seats", Operator::GreaterThan, json!(100)));
        assert!(eval("client.seats_text", Operator::GreaterThan, json!("99.5")));
        assert!(eval("client.seats", Operator::LessThan, json!(500)));
    }

    #[test]
    fn test_non_numeric_comparison_is_type_mismatch() {
        let err = evaluate(&cond("client.type", Operator::GreaterThan, json!(3)), &ctx()).unwrap_err();
        match err {
            FlowError::TypeMismatch { field, operator, .. } => {
                assert_eq!(field, "client.type");
                assert_eq!(operator, "greater_than");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(evaluate(&cond("client.tags", Operator::LessThan, json!(3)), &ctx()).is_err());
    }

    #[test]
    fn test_in_uses_comma_list() {
        assert!(eval("client.type", Operator::In, json!("startup, enterprise ,smb")));
        assert!(!eval("client.type", Operator::In, json!("startup,smb")));
        assert!(eval("client.type", Operator::NotIn, json!("startup,smb")));
        assert!(eval("client.seats", Operator::In, json!("10,120")));
        assert!(eval("client.type", Operator::In, json!(["enterprise"])));
    }

    #[test]
    fn test_contains() {
        assert!(eval("client.type", Operator::Contains, json!("prise")));
        assert!(eval("client.tags", Operator::Contains, json!("emea")));
        assert!(eval("client.plan", Operator::Contains, json!("tier")));
        assert!(!eval("client.seats", Operator::Contains, json!("1")));
    }

    #[test]
    fn test_select_branch() {
        let t = Edge::branch("t", "check", "a", true);
        let f = Edge::branch("f", "check", "b", false);
        let edges = vec![&t, &f];
        assert_eq!(select_branch("check", &edges, true).unwrap().id, "t");
        assert_eq!(select_branch("check", &edges, false).unwrap().id, "f");
    }

    #[test]
    fn test_untagged_fallback_and_no_match() {
        let t = Edge::branch("t", "check", "a", true);
        let fallback = Edge::new("any", "check", "c");
        assert_eq!(select_branch("check", &[&t, &fallback], false).unwrap().id, "any");
        assert_eq!(select_branch("check", &[&t, &fallback], true).unwrap().id, "t");

        let err = select_branch("check", &[&t], false).unwrap_err();
        assert!(matches!(err, FlowError::NoMatchingBranch { result: false, .. }));
    }
}
