//! Store implementations of the control-plane capabilities.
//!
//! `MemoryStore` backs tests and ephemeral runs; `SqliteStore` persists to
//! a local database file.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use aira_common::store::{AdrStore, ProjectStore, QuestionStore, SessionStore, TaskStore};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One handle per capability, usually all pointing at the same store.
#[derive(Clone)]
pub struct Stores {
    pub projects: Arc<dyn ProjectStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub adrs: Arc<dyn AdrStore>,
    pub questions: Arc<dyn QuestionStore>,
}

impl Stores {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ProjectStore + TaskStore + SessionStore + AdrStore + QuestionStore + 'static,
    {
        Self {
            projects: store.clone(),
            tasks: store.clone(),
            sessions: store.clone(),
            adrs: store.clone(),
            questions: store,
        }
    }
}
