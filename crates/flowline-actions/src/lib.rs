pub mod builtin;
pub mod registry;
pub mod template;

pub use registry::{ActionDispatcher, ESCALATION_KIND, WEBHOOK_KIND};
pub use template::{render_map, render_str, render_value};
