//! Configuration for the `aira` binary, read from `aira.toml`.
//!
//! Layered: file → environment → CLI flags. Every field has a default, so
//! a partial file (or none at all) is valid.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! db_path = "aira.db"
//!
//! [runtime]
//! cpu_limit = "1.5"
//! memory_limit = "2g"
//!
//! [agents.claude]
//! image = "ghcr.io/acme/claude-agent:1.4"
//!
//! [hitl]
//! platform = "slack"
//! channel = "C024BE91L"
//!
//! [hitl.escalation]
//! platform = "slack"
//! channel_id = "C0ONCALL"
//! enabled = true
//!
//! [messengers.slack]
//! token = "xoxb-..."
//!
//! [rate_limit]
//! rate = 10.0
//! burst = 20
//!
//! [logging]
//! json = true
//! dir = "/var/log/aira"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aira_runtime::RuntimeConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "aira.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiraConfig {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    /// Per-agent overrides keyed by agent type.
    pub agents: BTreeMap<String, AgentConfig>,
    pub hitl: HitlConfig,
    pub messengers: MessengersConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// SQLite database file. `:memory:` keeps everything in process.
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: PathBuf::from("aira.db"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Image for this agent; falls back to `runtime.image_default`.
    pub image: Option<String>,
    /// Replaces the agent's executable and fixed arguments.
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HitlConfig {
    /// Messenger questions are posted to.
    pub platform: String,
    /// Channel used when neither the tool call nor the session names one.
    pub channel: String,
    pub poll_interval_secs: u64,
    pub max_expired_per_tick: usize,
    /// Applied when an `ask_human` call carries no `timeout_seconds`.
    pub default_timeout_secs: u64,
    pub escalation: EscalationConfig,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            platform: "log".to_string(),
            channel: "aira-hitl".to_string(),
            poll_interval_secs: 30,
            max_expired_per_tick: 100,
            default_timeout_secs: 15 * 60,
            escalation: EscalationConfig::default(),
        }
    }
}

impl HitlConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub platform: String,
    pub channel_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengersConfig {
    pub slack: Option<SlackConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub token: String,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens refilled per second, per tenant.
    pub rate: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    /// Directory for daily-rolling log files; stderr only when unset.
    pub dir: Option<PathBuf>,
}

impl AiraConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse aira.toml")
    }

    /// Load `path` if given (it must exist), otherwise `aira.toml` in the
    /// working directory when present, otherwise the defaults. Environment
    /// overrides are applied on top.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `AIRA_*` overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("AIRA_DOCKER_HOST").filter(|v| !v.is_empty()) {
            self.runtime.docker_host = Some(host);
        }
        if let Some(path) = lookup("AIRA_DB_PATH").filter(|v| !v.is_empty()) {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(port) = lookup("AIRA_PORT").filter(|v| !v.is_empty()) {
            self.server.port = port
                .parse()
                .with_context(|| format!("AIRA_PORT is not a port number: {}", port))?;
        }
        if let Some(token) = lookup("AIRA_SLACK_TOKEN").filter(|v| !v.is_empty()) {
            self.messengers.slack.get_or_insert_with(SlackConfig::default).token = token;
        }
        Ok(())
    }

    /// Image an agent type runs in: its own override, else the runtime
    /// default.
    pub fn agent_image(&self, agent_type: &str) -> String {
        self.agents
            .get(agent_type)
            .and_then(|a| a.image.clone())
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| self.runtime.image_default.clone())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = AiraConfig::parse("").unwrap();
        assert_eq!(config, AiraConfig::default());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.hitl.max_expired_per_tick, 100);
        assert_eq!(config.hitl.default_timeout(), Duration::from_secs(900));
        assert_eq!(config.runtime.network_mode, "none");
        assert!(config.messengers.slack.is_none());
    }

    #[test]
    fn test_sections_parse() {
        let config = AiraConfig::parse(
            r#"
            [server]
            port = 9000

            [runtime]
            memory_limit = "512m"

            [agents.codex]
            image = "codex:2"
            command = ["codex-nightly", "exec", "--json"]

            [hitl]
            platform = "slack"
            channel = "C1"

            [hitl.escalation]
            platform = "slack"
            channel_id = "C9"
            enabled = true

            [messengers.slack]
            token = "xoxb-1"

            [rate_limit]
            rate = 2.5
            burst = 5

            [logging]
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.runtime.memory_limit, "512m");
        let codex = &config.agents["codex"];
        assert_eq!(codex.image.as_deref(), Some("codex:2"));
        assert_eq!(codex.command.as_ref().map(Vec::len), Some(3));
        assert_eq!(config.agent_image("codex"), "codex:2");
        assert_eq!(config.agent_image("claude"), "ghcr.io/aira/agent:latest");
        assert!(config.hitl.escalation.enabled);
        assert_eq!(config.hitl.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.messengers.slack.unwrap().token, "xoxb-1");
        assert_eq!(config.rate_limit.burst, 5);
        assert!(config.logging.json);
    }

    #[test]
    fn test_wrong_value_type_is_rejected() {
        assert!(AiraConfig::parse("[server]\nport = \"eighty\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = AiraConfig::parse("[server]\nport = 9000").unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("AIRA_PORT", "9100"),
            ("AIRA_DB_PATH", "/data/aira.db"),
            ("AIRA_DOCKER_HOST", "tcp://docker:2375"),
            ("AIRA_SLACK_TOKEN", "xoxb-env"),
        ]);
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.db_path, PathBuf::from("/data/aira.db"));
        assert_eq!(config.runtime.docker_host.as_deref(), Some("tcp://docker:2375"));
        assert_eq!(config.messengers.slack.unwrap().token, "xoxb-env");
    }

    #[test]
    fn test_bad_env_port() {
        let mut config = AiraConfig::default();
        let err = config
            .apply_env(|k| (k == "AIRA_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("AIRA_PORT"));
    }

    #[test]
    fn test_load_from_file_and_print() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[hitl]\nchannel = \"ops\"").unwrap();
        let config = AiraConfig::load(file.path()).unwrap();
        assert_eq!(config.hitl.channel, "ops");

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("channel = \"ops\""));
        assert_eq!(AiraConfig::parse(&rendered).unwrap(), config);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let err = AiraConfig::load(Path::new("/nonexistent/aira.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
