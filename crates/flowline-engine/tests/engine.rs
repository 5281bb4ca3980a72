use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Map;
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;

use flowline_actions::ActionDispatcher;
use flowline_core::config::EngineConfig;
use flowline_core::event::EventBus;
use flowline_core::run::{RunStatus, RunStep, StepStatus, WorkflowRun};
use flowline_core::traits::{DefinitionStore, RunStore};
use flowline_core::types::EngineEvent;
use flowline_core::workflow::{ErrorHandling, WorkflowDefinition, WorkflowSettings, WorkflowStatus};
use flowline_core::FlowError;
use flowline_engine::{Engine, WorkflowRegistry};
use flowline_store::{MemoryStore, SqliteStore};
use flowline_test_utils::{
    client_payload, delayed_follow_up, enterprise_onboarding, linear, settings, AlwaysFailHandler,
    SlowHandler, SucceedHandler, SIGNUP_EVENT,
};

const WAIT: Duration = Duration::from_secs(3600);

struct Setup {
    engine: Engine,
    store: Arc<MemoryStore>,
    shutdown: CancellationToken,
}

async fn setup(defs: Vec<WorkflowDefinition>, dispatcher: ActionDispatcher) -> Setup {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(WorkflowRegistry::new(store.clone()));
    registry.load().await.unwrap();
    for def in defs {
        let id = def.id.clone();
        registry.create(def).await.unwrap();
        registry.activate(&id).await.unwrap();
    }

    let engine = Engine::new(
        EngineConfig::default(),
        registry,
        Arc::new(dispatcher),
        store.clone(),
        Arc::new(EventBus::new(1024)),
    );
    let shutdown = CancellationToken::new();
    engine.start(shutdown.clone()).await.unwrap();
    Setup {
        engine,
        store,
        shutdown,
    }
}

async fn wait_for(rx: &mut Receiver<EngineEvent>, pred: impl Fn(&EngineEvent) -> bool) -> EngineEvent {
    loop {
        let event = rx.recv().await.unwrap();
        if pred(&event) {
            return event;
        }
    }
}

fn capped(cap: usize) -> WorkflowSettings {
    let mut settings = WorkflowSettings::default();
    settings.execution.max_concurrent_runs = Some(cap);
    settings
}

#[tokio::test]
async fn test_enterprise_client_gets_a_manager() {
    let mut dispatcher = ActionDispatcher::new();
    let manager = SucceedHandler::new();
    let welcome = SucceedHandler::new();
    let (manager_calls, welcome_calls) = (manager.counter(), welcome.counter());
    dispatcher.register("assign_enterprise_manager", manager);
    dispatcher.register("send_standard_welcome", welcome);
    let s = setup(vec![enterprise_onboarding()], dispatcher).await;

    let enterprise = s
        .engine
        .fire("enterprise-onboarding", SIGNUP_EVENT, client_payload("enterprise"))
        .await
        .unwrap();
    let individual = s
        .engine
        .fire("enterprise-onboarding", SIGNUP_EVENT, client_payload("individual"))
        .await
        .unwrap();

    let run = s.engine.wait_for_completion(&enterprise, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let check = run.steps_for("is_enterprise").next().unwrap();
    assert_eq!(check.branch(), Some(true));
    let assign = run.steps_for("assign_manager").next().unwrap();
    assert_eq!(assign.output.as_ref().unwrap()["client"], "Acme Corp");
    assert!(run.steps_for("standard_welcome").next().is_none());

    let run = s.engine.wait_for_completion(&individual, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let welcome = run.steps_for("standard_welcome").next().unwrap();
    assert_eq!(welcome.output.as_ref().unwrap()["to"], "ops@acme.test");

    assert_eq!(manager_calls.get(), 1);
    assert_eq!(welcome_calls.get(), 1);
    s.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_admission_cap_queues_fifo() {
    let mut dispatcher = ActionDispatcher::new();
    dispatcher.register("slow", SlowHandler::new(Duration::from_secs(5)));
    let s = setup(vec![linear("capped", &["slow"], capped(1))], dispatcher).await;

    let mut ids = vec![];
    for _ in 0..3 {
        ids.push(s.engine.fire("capped", SIGNUP_EVENT, Map::new()).await.unwrap());
    }
    assert_eq!(s.engine.occupancy("capped"), (1, 2));
    assert_eq!(s.engine.get_run(&ids[2]).await.unwrap().status, RunStatus::Pending);

    s.engine.wait_for_completion(&ids[2], WAIT).await.unwrap();

    let mut runs = vec![];
    for id in &ids {
        runs.push(s.engine.get_run(id).await.unwrap());
    }
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
    for pair in runs.windows(2) {
        let (earlier, later) = (&pair[0], &pair[1]);
        assert!(later.started_at.unwrap() >= earlier.completed_at.unwrap());
    }
    assert_eq!(s.engine.occupancy("capped"), (0, 0));
    s.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_run() {
    let mut dispatcher = ActionDispatcher::new();
    dispatcher.register("slow", SlowHandler::new(Duration::from_secs(5)));
    let s = setup(vec![linear("capped", &["slow"], capped(1))], dispatcher).await;

    let first = s.engine.fire("capped", SIGNUP_EVENT, Map::new()).await.unwrap();
    let queued = s.engine.fire("capped", SIGNUP_EVENT, Map::new()).await.unwrap();

    s.engine.cancel(&queued).await.unwrap();
    let run = s.engine.get_run(&queued).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.started_at.is_none());
    assert_eq!(run.steps.len(), 1);
    assert_eq!(run.steps[0].status, StepStatus::Skipped);
    assert_eq!(s.engine.occupancy("capped"), (1, 0));

    let run = s.engine.wait_for_completion(&first, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    s.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_delay_resumes_through_scheduler() {
    let mut dispatcher = ActionDispatcher::new();
    let follow_up = SucceedHandler::new();
    let calls = follow_up.counter();
    dispatcher.register("follow_up", follow_up);
    let s = setup(
        vec![delayed_follow_up("nudge", 60, WorkflowSettings::default())],
        dispatcher,
    )
    .await;

    let started = s.engine.clock().now();
    let id = s.engine.fire("nudge", SIGNUP_EVENT, Map::new()).await.unwrap();
    let run = s.engine.wait_for_completion(&id, WAIT).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(calls.get(), 1);
    let wait = run.steps_for("wait").next().unwrap();
    assert_eq!(wait.status, StepStatus::Completed);
    assert!(run.completed_at.unwrap() - started >= chrono::Duration::seconds(60));
    s.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_suspended_run() {
    let mut dispatcher = ActionDispatcher::new();
    let follow_up = SucceedHandler::new();
    let calls = follow_up.counter();
    dispatcher.register("follow_up", follow_up);
    let s = setup(
        vec![delayed_follow_up("nudge", 86_400, WorkflowSettings::default())],
        dispatcher,
    )
    .await;

    let mut rx = s.engine.event_bus().subscribe();
    let id = s.engine.fire("nudge", SIGNUP_EVENT, Map::new()).await.unwrap();
    wait_for(&mut rx, |e| matches!(e, EngineEvent::RunSuspended { .. })).await;

    s.engine.cancel(&id).await.unwrap();
    let run = s.engine.wait_for_completion(&id, WAIT).await.unwrap();

    assert_eq!(run.status, RunStatus::Cancelled);
    let wait = run.steps_for("wait").next().unwrap();
    assert_eq!(wait.status, StepStatus::Skipped);
    assert!(run.steps_for("follow_up").next().is_none());
    assert_eq!(calls.get(), 0);
    assert_eq!(s.engine.occupancy("nudge"), (0, 0));

    // Cancelling again is a no-op
    s.engine.cancel(&id).await.unwrap();
    assert_eq!(s.engine.get_run(&id).await.unwrap().status, RunStatus::Cancelled);
    s.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_wakes_delay_at_deadline() {
    let mut dispatcher = ActionDispatcher::new();
    let follow_up = SucceedHandler::new();
    let calls = follow_up.counter();
    dispatcher.register("follow_up", follow_up);
    let settings = WorkflowSettings {
        timeout_seconds: Some(10),
        ..WorkflowSettings::default()
    };
    let s = setup(vec![delayed_follow_up("nudge", 3_600, settings)], dispatcher).await;

    let id = s.engine.fire("nudge", SIGNUP_EVENT, Map::new()).await.unwrap();
    let run = s.engine.wait_for_completion(&id, WAIT).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("timeout"));
    let elapsed = run.completed_at.unwrap() - run.started_at.unwrap();
    assert!(elapsed >= chrono::Duration::seconds(10));
    assert!(elapsed < chrono::Duration::seconds(3_600));
    assert_eq!(calls.get(), 0);
    s.shutdown.cancel();
}

#[tokio::test]
async fn test_failure_notification() {
    let mut dispatcher = ActionDispatcher::new();
    dispatcher.register("crm_sync", AlwaysFailHandler::new("crm unreachable"));
    let mut settings = settings(ErrorHandling::Stop, 0);
    settings.notify_on_failure = true;
    let s = setup(vec![linear("sync", &["crm_sync"], settings)], dispatcher).await;

    let mut rx = s.engine.event_bus().subscribe();
    let id = s.engine.fire("sync", SIGNUP_EVENT, Map::new()).await.unwrap();
    let event = wait_for(&mut rx, |e| matches!(e, EngineEvent::FailureNotification { .. })).await;

    match event {
        EngineEvent::FailureNotification { run_id, error, .. } => {
            assert_eq!(run_id, id);
            assert!(error.contains("crm unreachable"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    let run = s.engine.get_run(&id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    s.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_paused_workflow_finishes_in_flight_runs() {
    let mut dispatcher = ActionDispatcher::new();
    dispatcher.register("follow_up", SucceedHandler::new());
    let s = setup(
        vec![delayed_follow_up("nudge", 30, WorkflowSettings::default())],
        dispatcher,
    )
    .await;

    let mut rx = s.engine.event_bus().subscribe();
    let id = s.engine.fire("nudge", SIGNUP_EVENT, Map::new()).await.unwrap();
    wait_for(&mut rx, |e| matches!(e, EngineEvent::RunSuspended { .. })).await;

    s.engine.registry().pause("nudge").await.unwrap();
    let err = s.engine.fire("nudge", SIGNUP_EVENT, Map::new()).await.unwrap_err();
    assert!(matches!(err, FlowError::NotActive { .. }));

    let run = s.engine.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    s.shutdown.cancel();
}

#[tokio::test]
async fn test_wait_times_out() {
    let mut dispatcher = ActionDispatcher::new();
    dispatcher.register("follow_up", SucceedHandler::new());
    let s = setup(
        vec![delayed_follow_up("nudge", 3_600, WorkflowSettings::default())],
        dispatcher,
    )
    .await;

    let id = s.engine.fire("nudge", SIGNUP_EVENT, Map::new()).await.unwrap();
    let err = s
        .engine
        .wait_for_completion(&id, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Timeout));
    s.shutdown.cancel();
}

#[tokio::test]
async fn test_recovers_interrupted_and_pending_runs() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(WorkflowRegistry::new(store.clone()));
    registry.load().await.unwrap();
    registry
        .create(linear("recover", &["ok"], WorkflowSettings::default()))
        .await
        .unwrap();
    registry.activate("recover").await.unwrap();

    // A run that died while its action was in flight
    let now = Utc::now();
    let mut interrupted = WorkflowRun::new("recover", SIGNUP_EVENT, "start", Map::new(), now);
    interrupted.admit(now);
    let mut trigger = RunStep::new("start");
    trigger.start(now);
    trigger.complete(None, now);
    interrupted.push_step(trigger);
    interrupted.cursor = vec!["step1".into()];
    let mut in_flight = RunStep::new("step1");
    in_flight.start(now);
    interrupted.push_step(in_flight);
    store.save_run(&interrupted).await.unwrap();

    // A run that never got a slot
    let pending =
        WorkflowRun::new("recover", SIGNUP_EVENT, "start", Map::new(), now + chrono::Duration::seconds(1));
    store.save_run(&pending).await.unwrap();

    let mut dispatcher = ActionDispatcher::new();
    let handler = SucceedHandler::new();
    let calls = handler.counter();
    dispatcher.register("ok", handler);
    let engine = Engine::new(
        EngineConfig::default(),
        registry,
        Arc::new(dispatcher),
        store.clone(),
        Arc::new(EventBus::default()),
    );
    let shutdown = CancellationToken::new();
    engine.start(shutdown.clone()).await.unwrap();

    let run = engine.wait_for_completion(&interrupted.id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let step = run.steps_for("step1").next().unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.retry_count, 0);

    let run = engine.wait_for_completion(&pending.id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(calls.get(), 2);
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_restart_reschedules_delays_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("flowline.db");

    let run_id = {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let registry = Arc::new(WorkflowRegistry::new(store.clone()));
        registry.load().await.unwrap();
        registry
            .create(delayed_follow_up("nudge", 120, WorkflowSettings::default()))
            .await
            .unwrap();
        registry.activate("nudge").await.unwrap();

        let engine = Engine::new(
            EngineConfig::default(),
            registry,
            Arc::new(ActionDispatcher::new()),
            store,
            Arc::new(EventBus::default()),
        );
        let shutdown = CancellationToken::new();
        engine.start(shutdown.clone()).await.unwrap();

        let mut rx = engine.event_bus().subscribe();
        let id = engine.fire("nudge", SIGNUP_EVENT, Map::new()).await.unwrap();
        wait_for(&mut rx, |e| matches!(e, EngineEvent::RunSuspended { .. })).await;
        shutdown.cancel();
        id
    };

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    let parked = store.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(parked.status, RunStatus::Running);
    let resume_at = parked.suspended_until().unwrap();

    let registry = Arc::new(WorkflowRegistry::new(store.clone()));
    assert_eq!(registry.load().await.unwrap(), 1);
    let mut dispatcher = ActionDispatcher::new();
    let follow_up = SucceedHandler::new();
    let calls = follow_up.counter();
    dispatcher.register("follow_up", follow_up);

    let engine = Engine::new(
        EngineConfig::default(),
        registry,
        Arc::new(dispatcher),
        store,
        Arc::new(EventBus::default()),
    );
    let shutdown = CancellationToken::new();
    engine.start(shutdown.clone()).await.unwrap();

    let run = engine.wait_for_completion(&run_id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(calls.get(), 1);
    assert!(run.completed_at.unwrap() >= resume_at);
    // One delay step, resumed rather than restarted
    assert_eq!(run.steps_for("wait").count(), 1);
    shutdown.cancel();
}

#[tokio::test]
async fn test_unbuildable_stored_definition_fails_runs_one_at_a_time() {
    // Saved straight to the store, so it never went through activation checks
    let mut settings = capped(1);
    settings.timeout_seconds = Some(10_000_000_000_000_000);
    let mut def = linear("forever", &["send_email"], settings);
    def.status = WorkflowStatus::Active;
    let store = Arc::new(MemoryStore::new());
    store.save_definition(&def).await.unwrap();

    let registry = Arc::new(WorkflowRegistry::new(store.clone()));
    registry.load().await.unwrap();
    let mut dispatcher = ActionDispatcher::new();
    dispatcher.register("send_email", SucceedHandler::new());
    let engine = Engine::new(
        EngineConfig::default(),
        registry,
        Arc::new(dispatcher),
        store,
        Arc::new(EventBus::new(1024)),
    );
    let shutdown = CancellationToken::new();
    engine.start(shutdown.clone()).await.unwrap();

    let mut rx = engine.event_bus().subscribe();
    let mut ids = vec![];
    for _ in 0..3 {
        ids.push(engine.fire("forever", SIGNUP_EVENT, Map::new()).await.unwrap());
    }
    for id in &ids {
        let run = engine.wait_for_completion(id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("timeout_seconds"));
    }
    assert_eq!(engine.occupancy("forever"), (0, 0));

    let mut in_flight = 0usize;
    let mut started = vec![];
    while let Ok(event) = rx.try_recv() {
        match event {
            EngineEvent::RunStarted { run_id, .. } => {
                in_flight += 1;
                assert!(in_flight <= 1, "cap of 1 exceeded");
                started.push(run_id);
            }
            EngineEvent::RunFinished { .. } => in_flight = in_flight.saturating_sub(1),
            _ => {}
        }
    }
    assert_eq!(started, ids);
    shutdown.cancel();
}
