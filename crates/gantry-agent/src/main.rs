//! Gantry agent: executes a parsed workflow on the selected backend.

use clap::Parser;
use gantry_backend::Registry;
use gantry_core::backend::{ContainerdConfig, DockerConfig, KubernetesConfig, LocalConfig};
use gantry_core::{BackendConfig, Error, Workflow};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod runner;

use runner::WorkflowRunner;

const EXIT_LOAD_FAILURE: i32 = 1;
const EXIT_UNKNOWN_BACKEND: i32 = 2;

#[derive(Parser)]
#[command(name = "gantry-agent")]
#[command(about = "CI agent executing workflow steps on a container backend", long_about = None)]
struct Cli {
    /// Explicit backend override; auto-selects when omitted
    #[arg(long, env = "AGENT_BACKEND")]
    backend: Option<String>,

    /// containerd socket endpoint (probed when omitted)
    #[arg(long = "backend-containerd-endpoint", env = "CONTAINERD_ENDPOINT")]
    containerd_endpoint: Option<String>,

    /// containerd namespace to use
    #[arg(
        long = "backend-containerd-namespace",
        env = "CONTAINERD_NAMESPACE",
        default_value = "gantry"
    )]
    containerd_namespace: String,

    /// snapshotter driver for step containers
    #[arg(
        long = "backend-containerd-snapshotter",
        env = "CONTAINERD_SNAPSHOTTER",
        default_value = "overlayfs"
    )]
    containerd_snapshotter: String,

    /// docker engine endpoint
    #[arg(
        long = "backend-docker-host",
        env = "DOCKER_HOST",
        default_value = "unix:///var/run/docker.sock"
    )]
    docker_host: String,

    /// namespace step jobs run in
    #[arg(
        long = "backend-k8s-namespace",
        env = "KUBE_NAMESPACE",
        default_value = "default"
    )]
    k8s_namespace: String,

    /// per-step workspace root for the local backend
    #[arg(long = "backend-local-workspace")]
    local_workspace: Option<PathBuf>,

    /// Path to the workflow to execute (JSON value object)
    #[arg(long)]
    workflow: PathBuf,

    /// Task identifier prefixed to all resource names; generated when omitted
    #[arg(long)]
    task_uuid: Option<String>,
}

impl Cli {
    fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            backend: self.backend.clone(),
            containerd: ContainerdConfig {
                endpoint: self.containerd_endpoint.clone(),
                namespace: self.containerd_namespace.clone(),
                snapshotter: self.containerd_snapshotter.clone(),
            },
            docker: DockerConfig {
                host: self.docker_host.clone(),
            },
            kubernetes: KubernetesConfig {
                namespace: self.k8s_namespace.clone(),
            },
            local: LocalConfig {
                workspace: self.local_workspace.clone(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.backend_config();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let registry = Registry::with_defaults();
    let mut backend = match registry.select(&config).await {
        Ok(backend) => backend,
        Err(Error::UnknownBackend(name)) => {
            error!(backend = %name, registered = ?registry.names(), "unknown backend override");
            std::process::exit(EXIT_UNKNOWN_BACKEND);
        }
        Err(e) => {
            error!(error = %e, "backend selection failed");
            std::process::exit(EXIT_LOAD_FAILURE);
        }
    };

    let backend_info = match backend.load(&config).await {
        Ok(info) => info,
        Err(e) => {
            error!(backend = backend.name(), error = %e, "backend load failed");
            std::process::exit(EXIT_LOAD_FAILURE);
        }
    };
    info!(
        backend = backend.name(),
        platform = %backend_info.platform,
        "backend loaded"
    );

    let raw = tokio::fs::read(&cli.workflow).await?;
    let workflow: Workflow = serde_json::from_slice(&raw)?;
    let task_uuid = cli
        .task_uuid
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let backend: Arc<dyn gantry_core::Backend> = Arc::from(backend);
    let runner = WorkflowRunner::new(backend);
    let report = runner.run(&workflow, &task_uuid, &cancel).await?;

    for step in &report.steps {
        info!(
            step = %step.name,
            exited = step.state.exited,
            exit_code = step.state.exit_code,
            oom_killed = step.state.oom_killed,
            "step finished"
        );
    }
    if report.cancelled {
        info!(task = %task_uuid, "workflow cancelled");
    } else if report.success() {
        info!(task = %task_uuid, "workflow succeeded");
    } else {
        info!(task = %task_uuid, "workflow failed");
    }

    Ok(())
}

/// Cancel the root context on SIGTERM/SIGINT. Teardown paths run on their
/// own short-lived contexts afterwards.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("termination signal received, shutting down");
        cancel.cancel();
    });
}
