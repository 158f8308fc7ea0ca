//! Aira runs coding agents in sandboxed containers, one isolated git
//! working tree per session, and pauses them on human questions routed
//! through chat.

pub mod agent;
pub mod config;
pub mod decisions;
pub mod errors;
pub mod hitl;
pub mod logging;
pub mod messenger;
pub mod orchestrator;
pub mod pubsub;
pub mod ratelimit;
pub mod server;
pub mod store;
