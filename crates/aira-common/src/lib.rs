//! Shared domain types for the Aira orchestrator.
//!
//! Everything that crosses a subsystem boundary lives here: the entity
//! models, their lifecycle rules, and the store and publish contracts the
//! orchestrator is written against.

pub mod error;
pub mod models;
pub mod store;

pub use error::StoreError;
