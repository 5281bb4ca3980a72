pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod run;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{FlowError, Result};
pub use event::EventBus;
pub use run::*;
pub use types::*;
pub use workflow::*;
