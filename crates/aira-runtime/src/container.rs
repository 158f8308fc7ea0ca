//! The container runtime contract.
//!
//! Every call is a future; callers cancel an in-flight call by dropping it
//! (typically from a `tokio::select!` against a cancellation token).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Env key carrying the session id into every agent container.
pub const SESSION_ENV: &str = "AIRA_SESSION_ID";
/// Env key carrying the session's branch into every agent container.
pub const BRANCH_ENV: &str = "AIRA_BRANCH";

/// Lazily filled, finite stream of raw log chunks. Ends when the container
/// exits or the forwarding task fails; it cannot be restarted.
pub type LogStream = mpsc::Receiver<Vec<u8>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    pub session_id: String,
    pub image: String,
    pub volume_name: String,
    pub mount_path: String,
    pub work_dir: String,
    pub branch_name: String,
    pub env: HashMap<String, String>,
    pub cmd: Vec<String>,
    /// Replaces the image entrypoint when set.
    pub entrypoint: Option<Vec<String>>,
    /// Overrides the runtime's default network mode for this container.
    pub network_mode: Option<String>,
}

impl CreateOptions {
    /// Environment as sorted `KEY=VALUE` pairs. The session and branch keys
    /// are always present and win over caller-supplied values.
    pub fn env_pairs(&self) -> Vec<String> {
        let mut env: HashMap<&str, &str> = self
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        env.insert(SESSION_ENV, &self.session_id);
        env.insert(BRANCH_ENV, &self.branch_name);

        let mut pairs: Vec<String> = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs
    }

    /// Volume bind in `name:path` form.
    pub fn volume_bind(&self) -> String {
        format!("{}:{}", self.volume_name, self.mount_path)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a named volume. Creating one that exists is not an error.
    async fn create_volume(&self, name: &str) -> Result<()>;

    /// Create (but do not start) a container; returns its id.
    async fn create(&self, opts: &CreateOptions) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// SIGTERM, then SIGKILL once `grace` has elapsed.
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    /// Force-remove the container.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Follow stdout and stderr from the beginning.
    async fn stream_logs(&self, id: &str) -> Result<LogStream>;

    /// Block until the container exits and return its exit code.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Run `cmd` inside the container, write `stdin` to it, then close the
    /// write half and wait for the command to finish.
    async fn exec_stdin(&self, id: &str, cmd: &[String], stdin: &[u8]) -> Result<()>;
}

/// Drain a log stream into one lossily-decoded string.
pub async fn collect_logs(mut logs: LogStream) -> String {
    let mut bytes = Vec::new();
    while let Some(chunk) = logs.recv().await {
        bytes.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_pairs_always_carry_session_and_branch() {
        let opts = CreateOptions {
            session_id: "s-1".into(),
            branch_name: "aira/s-1".into(),
            env: HashMap::from([
                ("API_KEY".to_string(), "secret".to_string()),
                (SESSION_ENV.to_string(), "spoofed".to_string()),
            ]),
            ..CreateOptions::default()
        };
        assert_eq!(
            opts.env_pairs(),
            vec![
                "AIRA_BRANCH=aira/s-1".to_string(),
                "AIRA_SESSION_ID=s-1".to_string(),
                "API_KEY=secret".to_string(),
            ]
        );
    }

    #[test]
    fn test_volume_bind() {
        let opts = CreateOptions {
            volume_name: "aira-repo-p".into(),
            mount_path: "/workspace".into(),
            ..CreateOptions::default()
        };
        assert_eq!(opts.volume_bind(), "aira-repo-p:/workspace");
    }

    #[tokio::test]
    async fn test_collect_logs_joins_chunks() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(b"hello ".to_vec()).await.unwrap();
        tx.send(b"world\n".to_vec()).await.unwrap();
        drop(tx);
        assert_eq!(collect_logs(rx).await, "hello world\n");
    }
}
