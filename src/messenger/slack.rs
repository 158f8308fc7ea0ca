//! Slack Web API adapter.
//!
//! Every message goes through `chat.postMessage`. A thread is the parent
//! message's `ts`; replies set `thread_ts`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{Messenger, split_thread_id, thread_id};
use crate::errors::MessengerError;

pub const DEFAULT_API_BASE: &str = "https://slack.com/api";

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct SlackMessenger {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

impl SlackMessenger {
    pub fn new(token: &str, api_base: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.to_string(),
            api_base: api_base
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    async fn post(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<String, MessengerError> {
        let mut payload = json!({ "channel": channel, "text": text });
        if let Some(ts) = thread_ts {
            payload["thread_ts"] = json!(ts);
        }

        let resp: PostMessageResponse = self
            .client
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !resp.ok {
            return Err(MessengerError::Api {
                method: "chat.postMessage",
                error: resp.error.unwrap_or_else(|| "unknown_error".to_string()),
            });
        }
        resp.ts.ok_or_else(|| MessengerError::Api {
            method: "chat.postMessage",
            error: "response carried no ts".to_string(),
        })
    }
}

#[async_trait]
impl Messenger for SlackMessenger {
    fn platform(&self) -> &str {
        "slack"
    }

    async fn post_message(&self, channel: &str, text: &str) -> Result<String, MessengerError> {
        self.post(channel, text, None).await
    }

    async fn create_thread(
        &self,
        channel: &str,
        parent_id: &str,
        title: &str,
    ) -> Result<String, MessengerError> {
        self.post(channel, title, Some(parent_id)).await?;
        Ok(thread_id(channel, parent_id))
    }

    async fn post_in_thread(&self, thread_id: &str, text: &str) -> Result<(), MessengerError> {
        let (channel, parent) = split_thread_id(thread_id)?;
        self.post(channel, text, Some(parent)).await?;
        Ok(())
    }
}
