//! The backend contract.
//!
//! A backend implements identical lifecycle semantics (setup → start step →
//! wait → tail logs → destroy) against one runtime. The workflow driver only
//! ever talks to `dyn Backend`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::step::{State, Step, WorkflowConfig};

/// Merged stdout+stderr of a step, as produced. Line framing is the
/// caller's concern.
pub type LogStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Reported by `load`.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    /// Identifies the runtime and its OS/arch, e.g. `containerd/linux/amd64`.
    pub platform: String,
}

/// A configuration option a backend recognizes. Names are prefixed
/// `backend-<name>-*`; each is also readable from `env`.
#[derive(Debug, Clone)]
pub struct Flag {
    pub name: &'static str,
    /// Matching environment variable, when one exists.
    pub env: Option<&'static str>,
    pub usage: &'static str,
    pub default: Option<&'static str>,
}

/// Explicit configuration handed to `is_available` and `load`, assembled by
/// the binary from flags and environment.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// Explicit backend name override. `None` means auto-select.
    pub backend: Option<String>,
    pub containerd: ContainerdConfig,
    pub docker: DockerConfig,
    pub kubernetes: KubernetesConfig,
    pub local: LocalConfig,
}

#[derive(Debug, Clone)]
pub struct ContainerdConfig {
    /// Socket path. `None` means probe the standard locations.
    pub endpoint: Option<String>,
    pub namespace: String,
    pub snapshotter: String,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            namespace: "gantry".into(),
            snapshotter: "overlayfs".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub host: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: "unix:///var/run/docker.sock".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub namespace: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    /// Per-step workspace root. `None` means the OS temp dir.
    pub workspace: Option<PathBuf>,
}

/// The capability set every backend satisfies.
///
/// All operations observe the cancellation token and return promptly when it
/// fires, leaving resources in a state a later `destroy_*` can clean. For
/// every successful `start_step` there is exactly one matching
/// `destroy_step` attempt, regardless of whether `wait_step` succeeded.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identifier, also the value accepted by the backend override.
    fn name(&self) -> &'static str;

    /// Configuration options this backend recognizes.
    fn flags(&self) -> Vec<Flag>;

    /// Cheap, side-effect-free probe: open and close a connection at most.
    async fn is_available(&self, config: &BackendConfig) -> bool;

    /// Connect to the runtime. Called at most once per instance; backend
    /// state (client handle, namespace) is immutable afterwards.
    async fn load(&mut self, config: &BackendConfig) -> Result<BackendInfo>;

    /// Provision named shared resources (network, shared volume) for the
    /// workflow. Idempotent.
    async fn setup_workflow(
        &self,
        config: &WorkflowConfig,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Pull the step image under its pull policy, create the isolated
    /// workload and start it. On error, partial artifacts remain reachable
    /// by deterministic name so `destroy_step` cleans them.
    async fn start_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Block until the step terminates or the token cancels. Cancellation
    /// returns `Error::Cancelled` without consuming the exit.
    async fn wait_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<State>;

    /// Stream merged stdout+stderr as produced. The stream closes when the
    /// step exits or the token cancels.
    async fn tail_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<LogStream>;

    /// Best-effort teardown of everything `start_step` may have created.
    /// Tolerates "not found" at every sub-step, keeps going, and returns the
    /// first real error observed. Idempotent.
    async fn destroy_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Release workflow-level resources and backend handles. Safe to call
    /// when setup partially failed.
    async fn destroy_workflow(
        &self,
        config: &WorkflowConfig,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;
}
