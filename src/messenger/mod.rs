//! Chat platform adapters used to put HITL questions in front of a human.

pub mod slack;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::errors::MessengerError;

pub use slack::SlackMessenger;

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Platform key stored on questions, e.g. `slack`.
    fn platform(&self) -> &str;

    /// Post a top-level message; returns its platform id.
    async fn post_message(&self, channel: &str, text: &str) -> Result<String, MessengerError>;

    /// Open a thread under `parent_id` with a first reply; returns the
    /// thread id replies will be correlated by.
    async fn create_thread(
        &self,
        channel: &str,
        parent_id: &str,
        title: &str,
    ) -> Result<String, MessengerError>;

    async fn post_in_thread(&self, thread_id: &str, text: &str) -> Result<(), MessengerError>;
}

/// Thread ids are `<channel>:<parent id>`.
pub fn thread_id(channel: &str, parent_id: &str) -> String {
    format!("{channel}:{parent_id}")
}

pub fn split_thread_id(thread_id: &str) -> Result<(&str, &str), MessengerError> {
    match thread_id.split_once(':') {
        Some((channel, parent)) if !channel.is_empty() && !parent.is_empty() => {
            Ok((channel, parent))
        }
        _ => Err(MessengerError::InvalidThread(thread_id.to_string())),
    }
}

/// Writes every message to the log. Used when no chat platform is set up;
/// answers then arrive through the HTTP surface.
#[derive(Debug, Default, Clone)]
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    fn platform(&self) -> &str {
        "log"
    }

    async fn post_message(&self, channel: &str, text: &str) -> Result<String, MessengerError> {
        let id = Uuid::new_v4().to_string();
        info!(channel, message_id = %id, "{}", text);
        Ok(id)
    }

    async fn create_thread(
        &self,
        channel: &str,
        parent_id: &str,
        title: &str,
    ) -> Result<String, MessengerError> {
        let thread = thread_id(channel, parent_id);
        info!(thread_id = %thread, "{}", title);
        Ok(thread)
    }

    async fn post_in_thread(&self, thread_id: &str, text: &str) -> Result<(), MessengerError> {
        split_thread_id(thread_id)?;
        info!(thread_id, "{}", text);
        Ok(())
    }
}
