pub mod escalation;
pub mod log;
pub mod webhook;

use flowline_core::config::HandlersConfig;

use crate::registry::{ActionDispatcher, ESCALATION_KIND, WEBHOOK_KIND};

pub use escalation::EscalationHandler;
pub use log::LogHandler;
pub use webhook::WebhookHandler;

impl ActionDispatcher {
    /// Create a dispatcher with the built-in handlers registered.
    pub fn with_builtins(config: &HandlersConfig) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(WEBHOOK_KIND, WebhookHandler::new(&config.webhook));
        dispatcher.register(ESCALATION_KIND, EscalationHandler);
        dispatcher.register("log", LogHandler);
        dispatcher
    }
}
