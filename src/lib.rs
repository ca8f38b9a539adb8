pub mod agents;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod log;
pub mod orchestration;
pub mod util;
pub mod workflow;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, OrchestratorHandle};
