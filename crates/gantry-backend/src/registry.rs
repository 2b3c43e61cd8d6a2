//! Backend registration and selection.
//!
//! The registry holds an ordered list of candidate constructors. More
//! specialized backends precede more generic ones, so an agent inside a
//! cluster picks the orchestrator and a bare host falls through to the
//! shell. An explicit override skips probing entirely.

use gantry_core::{Backend, BackendConfig, Error, Result};
use tracing::debug;

/// A registered backend: a stable name and its constructor.
pub struct Entry {
    pub name: &'static str,
    pub constructor: fn() -> Box<dyn Backend>,
}

/// Ordered list of candidate backends, built in `main`.
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// The standard candidate order: kubernetes, docker, containerd, local.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("kubernetes", || {
            Box::new(crate::kubernetes::KubernetesBackend::new())
        });
        registry.register("docker", || Box::new(crate::docker::DockerBackend::new()));
        registry.register("containerd", || {
            Box::new(crate::containerd::ContainerdBackend::new())
        });
        registry.register("local", || Box::new(crate::local::LocalBackend::new()));
        registry
    }

    pub fn register(&mut self, name: &'static str, constructor: fn() -> Box<dyn Backend>) {
        self.entries.push(Entry { name, constructor });
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// Pick a backend: the override must match a registered name, otherwise
    /// the first candidate whose `is_available` answers true wins.
    pub async fn select(&self, config: &BackendConfig) -> Result<Box<dyn Backend>> {
        if let Some(wanted) = config.backend.as_deref() {
            let entry = self
                .entries
                .iter()
                .find(|e| e.name == wanted)
                .ok_or_else(|| Error::UnknownBackend(wanted.to_string()))?;
            return Ok((entry.constructor)());
        }

        for entry in &self.entries {
            let candidate = (entry.constructor)();
            if candidate.is_available(config).await {
                debug!(backend = entry.name, "backend available");
                return Ok(candidate);
            }
            debug!(backend = entry.name, "backend not available");
        }

        Err(Error::NoBackendAvailable)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gantry_core::{BackendInfo, Flag, LogStream, State, Step, WorkflowConfig};
    use tokio_util::sync::CancellationToken;

    struct FakeBackend {
        name: &'static str,
        available: bool,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn flags(&self) -> Vec<Flag> {
            vec![]
        }

        async fn is_available(&self, _config: &BackendConfig) -> bool {
            self.available
        }

        async fn load(&mut self, _config: &BackendConfig) -> Result<BackendInfo> {
            Ok(BackendInfo {
                platform: self.name.to_string(),
            })
        }

        async fn setup_workflow(
            &self,
            _config: &WorkflowConfig,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }

        async fn start_step(
            &self,
            _step: &Step,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }

        async fn wait_step(
            &self,
            _step: &Step,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<State> {
            Ok(State::exited(0))
        }

        async fn tail_step(
            &self,
            _step: &Step,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<LogStream> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn destroy_step(
            &self,
            _step: &Step,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }

        async fn destroy_workflow(
            &self,
            _config: &WorkflowConfig,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn three_candidates() -> Registry {
        let mut registry = Registry::new();
        registry.register("a", || {
            Box::new(FakeBackend {
                name: "a",
                available: false,
            })
        });
        registry.register("b", || {
            Box::new(FakeBackend {
                name: "b",
                available: true,
            })
        });
        registry.register("c", || {
            Box::new(FakeBackend {
                name: "c",
                available: true,
            })
        });
        registry
    }

    #[tokio::test]
    async fn first_available_wins() {
        let registry = three_candidates();
        let backend = registry.select(&BackendConfig::default()).await.unwrap();
        assert_eq!(backend.name(), "b");
    }

    #[tokio::test]
    async fn override_skips_probing() {
        let registry = three_candidates();
        let config = BackendConfig {
            backend: Some("c".into()),
            ..Default::default()
        };
        let backend = registry.select(&config).await.unwrap();
        assert_eq!(backend.name(), "c");
    }

    #[tokio::test]
    async fn override_may_pick_an_unavailable_backend() {
        // The override is explicit user intent; availability is not probed.
        let registry = three_candidates();
        let config = BackendConfig {
            backend: Some("a".into()),
            ..Default::default()
        };
        assert_eq!(registry.select(&config).await.unwrap().name(), "a");
    }

    #[tokio::test]
    async fn unknown_override_fails() {
        let registry = three_candidates();
        let config = BackendConfig {
            backend: Some("podman".into()),
            ..Default::default()
        };
        match registry.select(&config).await {
            Err(Error::UnknownBackend(name)) => assert_eq!(name, "podman"),
            other => panic!("expected UnknownBackend, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_candidate_available() {
        let mut registry = Registry::new();
        registry.register("a", || {
            Box::new(FakeBackend {
                name: "a",
                available: false,
            })
        });
        assert!(matches!(
            registry.select(&BackendConfig::default()).await,
            Err(Error::NoBackendAvailable)
        ));
    }

    #[test]
    fn default_order_is_most_specialized_first() {
        let registry = Registry::with_defaults();
        assert_eq!(
            registry.names(),
            vec!["kubernetes", "docker", "containerd", "local"]
        );
    }
}
