pub mod fixtures;
pub mod handlers;

pub use fixtures::*;
pub use handlers::*;
