//! The agent binaries' shared code: built-in handlers and the wiring of a
//! scheduler from configuration.

pub mod handlers;
pub mod runtime;

pub use handlers::builtin_registry;
pub use runtime::{build_scheduler, executor_manager, load_config, load_desired_state, wait_idle};
