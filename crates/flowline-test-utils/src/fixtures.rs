//! Fixture workflows and payloads.

use serde_json::{json, Map, Value};

use flowline_core::workflow::{
    DelayUnit, Edge, ErrorHandling, Node, Operator, WorkflowDefinition, WorkflowSettings,
};

pub const SIGNUP_EVENT: &str = "client_signed_up";

/// Trigger → `client.type == "enterprise"` → assign manager / standard welcome.
pub fn enterprise_onboarding() -> WorkflowDefinition {
    WorkflowDefinition::new("enterprise-onboarding", "Enterprise onboarding")
        .with_description("Route new clients by account type")
        .with_node(Node::trigger("signup", SIGNUP_EVENT))
        .with_node(Node::condition(
            "is_enterprise",
            "client.type",
            Operator::Equals,
            json!("enterprise"),
        ))
        .with_node(
            Node::action("assign_manager", "assign_enterprise_manager")
                .with_param("client", json!("{{client.name}}")),
        )
        .with_node(
            Node::action("standard_welcome", "send_standard_welcome")
                .with_param("to", json!("{{client.email}}")),
        )
        .with_edge(Edge::new("e1", "signup", "is_enterprise"))
        .with_edge(Edge::branch("e2", "is_enterprise", "assign_manager", true))
        .with_edge(Edge::branch("e3", "is_enterprise", "standard_welcome", false))
}

/// Trigger followed by a chain of action nodes, one per action type.
pub fn linear(id: &str, action_types: &[&str], settings: WorkflowSettings) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(id, id)
        .with_settings(settings)
        .with_node(Node::trigger("start", SIGNUP_EVENT));
    let mut prev = "start".to_string();
    for (i, kind) in action_types.iter().enumerate() {
        let node_id = format!("step{}", i + 1);
        def = def
            .with_node(Node::action(node_id.clone(), *kind))
            .with_edge(Edge::new(format!("e{}", i + 1), prev, node_id.clone()));
        prev = node_id;
    }
    def
}

/// Trigger → delay → `follow_up` action.
pub fn delayed_follow_up(id: &str, delay_secs: u64, settings: WorkflowSettings) -> WorkflowDefinition {
    WorkflowDefinition::new(id, id)
        .with_settings(settings)
        .with_node(Node::trigger("start", SIGNUP_EVENT))
        .with_node(Node::delay("wait", delay_secs, DelayUnit::Seconds))
        .with_node(Node::action("follow_up", "follow_up"))
        .with_edge(Edge::new("e1", "start", "wait"))
        .with_edge(Edge::new("e2", "wait", "follow_up"))
}

pub fn settings(error_handling: ErrorHandling, retry_attempts: u32) -> WorkflowSettings {
    WorkflowSettings {
        error_handling,
        retry_attempts,
        ..WorkflowSettings::default()
    }
}

pub fn client_payload(kind: &str) -> Map<String, Value> {
    let payload = json!({
        "client": {
            "type": kind,
            "name": "Acme Corp",
            "email": "ops@acme.test",
            "seats": 120
        }
    });
    match payload {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
