pub mod agent;
pub mod broadcast;
/// Per-agent plan/observe/move pipeline driven once per tick.
pub mod cognition;
pub mod config;
pub mod llm;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod templates;
pub mod world;
pub mod zones;
