use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use flowline_actions::ActionDispatcher;
use flowline_core::config::{EngineConfig, HandlersConfig};
use flowline_core::event::EventBus;
use flowline_core::run::RunStatus;
use flowline_core::workflow::WorkflowStatus;
use flowline_engine::{read_definition, validate, Engine, WorkflowRegistry};
use flowline_store::MemoryStore;

fn workflows_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("workflows")
}

#[test]
fn test_sample_workflows_are_valid() {
    let mut checked = 0;
    for entry in std::fs::read_dir(workflows_dir()).expect("workflows dir") {
        let path = entry.expect("dir entry").path();
        let def = read_definition(&path).expect("parse definition");
        validate(&def).unwrap_or_else(|e| panic!("{}: {}", path.display(), e));
        checked += 1;
    }
    assert!(checked > 0);
}

async fn engine() -> Engine {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(WorkflowRegistry::new(store.clone()));
    registry.load().await.unwrap();
    let imported = registry.import_dir(&workflows_dir(), true).await.unwrap();
    assert!(imported.contains(&"enterprise-onboarding".to_string()));
    assert_eq!(
        registry.get("enterprise-onboarding").await.unwrap().status,
        WorkflowStatus::Active
    );

    let engine = Engine::new(
        EngineConfig::default(),
        registry,
        Arc::new(ActionDispatcher::with_builtins(&HandlersConfig::default())),
        store,
        Arc::new(EventBus::default()),
    );
    engine.start(CancellationToken::new()).await.unwrap();
    engine
}

fn payload(kind: &str) -> serde_json::Map<String, serde_json::Value> {
    json!({ "client": { "type": kind, "name": "Globex", "email": "it@globex.test" } })
        .as_object()
        .cloned()
        .unwrap()
}

#[tokio::test]
async fn test_enterprise_path_escalates() {
    let engine = engine().await;
    let id = engine
        .fire("enterprise-onboarding", "client_signed_up", payload("enterprise"))
        .await
        .unwrap();
    let run = engine
        .wait_for_completion(&id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.context["escalation"]["escalate_to"], "onboarding");
    assert_eq!(run.context["escalation"]["priority"], "high");
    assert!(run.steps_for("standard_welcome").next().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_standard_path_checks_in_after_a_day() {
    let engine = engine().await;
    let id = engine
        .fire("enterprise-onboarding", "client_signed_up", payload("individual"))
        .await
        .unwrap();
    let run = engine
        .wait_for_completion(&id, Duration::from_secs(2 * 86_400))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let welcome = run.steps_for("standard_welcome").next().unwrap();
    assert_eq!(
        welcome.output.as_ref().unwrap()["message"],
        "Welcome Globex <it@globex.test>"
    );
    assert_eq!(run.context["onboarding"]["stage"], "checked_in");
    assert_eq!(run.context["onboarding"]["touches"], 1);
    assert!(run.completed_at.unwrap() - run.started_at.unwrap() >= chrono::Duration::days(1));
}
