//! Agent configuration and wiring.

mod agent;
mod config;
mod queue;

pub use agent::Agent;
pub use config::{AgentConfig, AgentMode};
pub use queue::RequestQueue;
