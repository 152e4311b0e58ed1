pub mod client;
pub mod config;
/// Scoring, archetype assignment, comparisons and recommendations.
pub mod engine;
pub mod local_store;
pub mod models;
pub mod rate_limit;
/// WebSocket relay: typed messages, connection registry, session fan-out.
pub mod relay;
pub mod server;
pub mod shell;
/// Journaled session and event store.
pub mod store;
pub mod tracker;
