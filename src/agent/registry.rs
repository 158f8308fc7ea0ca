use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use aira_runtime::ContainerRuntime;

use super::backend::ContainerBackend;
use super::transport::AgentKind;
use super::AgentBackend;
use crate::config::AgentConfig;
use crate::errors::AgentError;

/// Builds a backend bound to a runtime.
pub type BackendFactory =
    Arc<dyn Fn(Arc<dyn ContainerRuntime>) -> Arc<dyn AgentBackend> + Send + Sync>;

/// Agent-type name → backend factory.
#[derive(Default)]
pub struct Registry {
    factories: RwLock<HashMap<String, BackendFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the four built-in agents. Per-agent settings override the
    /// image and command; agents without an image use `image_default`.
    pub fn with_builtin(
        agents: &BTreeMap<String, AgentConfig>,
        image_default: &str,
        stop_grace: Duration,
    ) -> Self {
        let registry = Self::new();
        for kind in AgentKind::ALL {
            let settings = agents.get(kind.as_str()).cloned().unwrap_or_default();
            let image = settings
                .image
                .filter(|i| !i.is_empty())
                .unwrap_or_else(|| image_default.to_string());
            let command = settings.command.unwrap_or_default();

            registry.register(
                kind.as_str(),
                Arc::new(move |runtime: Arc<dyn ContainerRuntime>| {
                    Arc::new(
                        ContainerBackend::new(kind, runtime, &image)
                            .with_command(command.clone())
                            .with_stop_grace(stop_grace),
                    ) as Arc<dyn AgentBackend>
                }),
            );
        }
        registry
    }

    /// Add or replace a factory.
    pub fn register(&self, name: &str, factory: BackendFactory) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn create(
        &self,
        name: &str,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Arc<dyn AgentBackend>, AgentError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAgent(name.to_string()))?;
        Ok(factory(runtime))
    }

    /// Registered names in lexicographic order.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use aira_runtime::{CreateOptions, LogStream};
    use async_trait::async_trait;

    struct NullRuntime;

    #[async_trait]
    impl ContainerRuntime for NullRuntime {
        async fn create_volume(&self, _name: &str) -> aira_runtime::Result<()> {
            Ok(())
        }
        async fn create(&self, _opts: &CreateOptions) -> aira_runtime::Result<String> {
            Ok("c".into())
        }
        async fn start(&self, _id: &str) -> aira_runtime::Result<()> {
            Ok(())
        }
        async fn stop(&self, _id: &str, _grace: Duration) -> aira_runtime::Result<()> {
            Ok(())
        }
        async fn remove(&self, _id: &str) -> aira_runtime::Result<()> {
            Ok(())
        }
        async fn stream_logs(&self, _id: &str) -> aira_runtime::Result<LogStream> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }
        async fn wait(&self, _id: &str) -> aira_runtime::Result<i64> {
            Ok(0)
        }
        async fn exec_stdin(
            &self,
            _id: &str,
            _cmd: &[String],
            _stdin: &[u8],
        ) -> aira_runtime::Result<()> {
            Ok(())
        }
    }

    fn builtin() -> Registry {
        Registry::with_builtin(&BTreeMap::new(), "agent:latest", Duration::from_secs(30))
    }

    #[test]
    fn test_available_is_sorted() {
        assert_eq!(builtin().available(), vec!["acp", "claude", "codex", "opencode"]);
    }

    #[test]
    fn test_unknown_agent() {
        let err = builtin().create("gpt", Arc::new(NullRuntime)).err().unwrap();
        assert!(matches!(err, AgentError::UnknownAgent(ref n) if n == "gpt"));
    }

    #[test]
    fn test_create_builds_matching_backend() {
        let backend = builtin().create("codex", Arc::new(NullRuntime)).unwrap();
        assert_eq!(backend.agent_type(), "codex");
    }

    #[test]
    fn test_register_replaces_and_extends() {
        let registry = builtin();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register(
            "aider",
            Arc::new(move |runtime: Arc<dyn ContainerRuntime>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(ContainerBackend::new(AgentKind::Claude, runtime, "aider:latest"))
                    as Arc<dyn AgentBackend>
            }),
        );

        assert!(registry.contains("aider"));
        assert_eq!(registry.available().first().map(String::as_str), Some("acp"));
        assert_eq!(registry.available().len(), 5);
        registry.create("aider", Arc::new(NullRuntime)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_lookups() {
        let registry = Arc::new(builtin());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.create("claude", Arc::new(NullRuntime)).is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
