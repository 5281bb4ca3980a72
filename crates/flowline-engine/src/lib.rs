pub mod admission;
pub mod clock;
pub mod condition;
pub mod cron;
pub mod executor;
pub mod graph;
pub mod registry;
pub mod run_log;
pub mod runtime;
pub mod scheduler;
pub mod script;

pub use admission::Admission;
pub use clock::Clock;
pub use cron::CronTriggers;
pub use executor::{Advance, RunExecutor};
pub use graph::{validate, WorkflowGraph};
pub use registry::{read_definition, WorkflowRegistry};
pub use run_log::RunLogger;
pub use runtime::{trigger_matches, Engine, SCHEDULE_TRIGGER};
pub use scheduler::{DelayHandle, DelayScheduler};
