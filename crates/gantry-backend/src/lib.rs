//! Step execution backends for the gantry agent.
//!
//! Provides backend implementations for running workflow steps:
//! - Kubernetes (cluster orchestrator)
//! - Docker (daemon-based container engine)
//! - containerd (low-level container runtime)
//! - Local (host shell)
//!
//! plus the [`Registry`] that picks one of them at agent start.

pub mod containerd;
pub mod docker;
pub mod kubernetes;
pub mod local;
pub mod registry;

pub use containerd::ContainerdBackend;
pub use docker::DockerBackend;
pub use gantry_core::{Backend, BackendConfig, BackendInfo, LogStream};
pub use kubernetes::KubernetesBackend;
pub use local::LocalBackend;
pub use registry::Registry;
