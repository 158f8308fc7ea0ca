use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The `[runtime]` section of `aira.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Decimal number of cores, e.g. `"1.5"`. Empty means unlimited.
    pub cpu_limit: String,
    /// Integer bytes with optional `k`/`m`/`g` suffix. Empty means unlimited.
    pub memory_limit: String,
    /// Docker endpoint (`unix://` or `tcp://`); unset uses the local defaults.
    pub docker_host: Option<String>,
    /// Image for agents whose configuration names none.
    pub image_default: String,
    /// Network mode for agent containers; `none` keeps them offline.
    pub network_mode: String,
    /// Where the repository volume is mounted inside every container.
    pub mount_path: String,
    /// Image carrying `git`, used for workspace commands.
    pub helper_image: String,
    pub stop_grace_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cpu_limit: String::new(),
            memory_limit: String::new(),
            docker_host: None,
            image_default: "ghcr.io/aira/agent:latest".to_string(),
            network_mode: "none".to_string(),
            mount_path: "/workspace".to_string(),
            helper_image: "alpine/git:latest".to_string(),
            stop_grace_secs: 30,
        }
    }
}

impl RuntimeConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.cpu_limit.is_empty());
        assert_eq!(config.mount_path, "/workspace");
        assert_eq!(config.stop_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            memory_limit = "2g"
            docker_host = "unix:///var/run/docker.sock"
            "#,
        )
        .unwrap();
        assert_eq!(config.memory_limit, "2g");
        assert_eq!(
            config.docker_host.as_deref(),
            Some("unix:///var/run/docker.sock")
        );
        assert_eq!(config.helper_image, "alpine/git:latest");
    }
}
