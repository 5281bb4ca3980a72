//! Deterministic and seeded-random action handlers for tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};

use flowline_core::error::{FlowError, Result};
use flowline_core::traits::ActionHandler;
use flowline_core::types::{ActionResult, RunContext};

/// Shared call counter handed out by the mock handlers.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicU32>);

impl CallCounter {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Succeeds, echoing its resolved config as output.
#[derive(Default)]
pub struct SucceedHandler {
    calls: CallCounter,
    updates: Map<String, Value>,
}

impl SucceedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` into the run context at `key` on every call.
    pub fn with_update(mut self, key: impl Into<String>, value: Value) -> Self {
        self.updates.insert(key.into(), value);
        self
    }

    pub fn counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl ActionHandler for SucceedHandler {
    fn execute(&self, _ctx: RunContext, config: Map<String, Value>) -> BoxFuture<'_, Result<ActionResult>> {
        Box::pin(async move {
            self.calls.bump();
            Ok(ActionResult {
                output: Some(Value::Object(config)),
                context_updates: self.updates.clone(),
            })
        })
    }
}

/// Fails every call with the same message.
pub struct AlwaysFailHandler {
    message: String,
    calls: CallCounter,
}

impl AlwaysFailHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: CallCounter::default(),
        }
    }

    pub fn counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl ActionHandler for AlwaysFailHandler {
    fn execute(&self, _ctx: RunContext, _config: Map<String, Value>) -> BoxFuture<'_, Result<ActionResult>> {
        Box::pin(async move {
            self.calls.bump();
            Err(FlowError::action("mock", &self.message))
        })
    }
}

/// Fails the first `failures` calls, then succeeds.
pub struct FlakyHandler {
    failures: u32,
    calls: CallCounter,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: CallCounter::default(),
        }
    }

    pub fn counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl ActionHandler for FlakyHandler {
    fn execute(&self, ctx: RunContext, _config: Map<String, Value>) -> BoxFuture<'_, Result<ActionResult>> {
        Box::pin(async move {
            let call = self.calls.bump();
            if call <= self.failures {
                Err(FlowError::action("mock", format!("transient failure {}", call)))
            } else {
                Ok(ActionResult::with_output(serde_json::json!({ "attempt": ctx.attempt })))
            }
        })
    }
}

/// Sleeps before succeeding. Pair with a paused tokio clock.
pub struct SlowHandler {
    delay: Duration,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ActionHandler for SlowHandler {
    fn execute(&self, _ctx: RunContext, _config: Map<String, Value>) -> BoxFuture<'_, Result<ActionResult>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(ActionResult::empty())
        })
    }
}

/// Fails with probability `failure_rate`, drawn from a seeded RNG so a
/// given seed always produces the same sequence of outcomes.
pub struct ChaosHandler {
    rng: Mutex<StdRng>,
    failure_rate: f64,
}

impl ChaosHandler {
    pub fn new(seed: u64, failure_rate: f64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

impl ActionHandler for ChaosHandler {
    fn execute(&self, _ctx: RunContext, _config: Map<String, Value>) -> BoxFuture<'_, Result<ActionResult>> {
        let fail = match self.rng.lock() {
            Ok(mut rng) => rng.gen_bool(self.failure_rate),
            Err(_) => true,
        };
        Box::pin(async move {
            if fail {
                Err(FlowError::action("chaos", "injected failure"))
            } else {
                Ok(ActionResult::empty())
            }
        })
    }
}
