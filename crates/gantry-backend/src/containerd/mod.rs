//! Low-level runtime backend against containerd's gRPC API.
//!
//! Every call is scoped with the configured namespace. Containers, tasks
//! and snapshots are named from `(task_uuid, step_uuid)` so destroy can
//! find them without any bookkeeping.

mod image;
mod oci;

use async_trait::async_trait;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{PrepareSnapshotRequest, RemoveSnapshotRequest};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::version_client::VersionClient;
use containerd_client::services::v1::{
    container, Container, CreateContainerRequest, CreateTaskRequest, DeleteContainerRequest,
    DeleteTaskRequest, GetContainerRequest, GetRequest, KillRequest, StartRequest, WaitRequest,
};
use containerd_client::with_namespace;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};
use tracing::{debug, info, warn};

use gantry_core::name::{snapshot_name, step_ident};
use gantry_core::{
    Backend, BackendConfig, BackendInfo, Error, Flag, LogStream, Result, State, Step,
    WorkflowConfig,
};

pub use image::{chain_id, ImageService};

const RUNC_RUNTIME: &str = "io.containerd.runc.v2";
const SIGKILL: u32 = 9;
const SYSTEM_SOCKET: &str = "/run/containerd/containerd.sock";

struct Loaded {
    channel: Channel,
    namespace: String,
    snapshotter: String,
    log_dir: PathBuf,
}

/// Backend driving containerd directly.
pub struct ContainerdBackend {
    state: Option<Loaded>,
}

impl ContainerdBackend {
    pub fn new() -> Self {
        Self { state: None }
    }

    fn state(&self) -> Result<&Loaded> {
        self.state
            .as_ref()
            .ok_or_else(|| Error::ConfigMissing("containerd backend not loaded".into()))
    }

    fn log_path(&self, ident: &str) -> Result<PathBuf> {
        Ok(self.state()?.log_dir.join(format!("{ident}.log")))
    }

    fn images(&self) -> Result<ImageService> {
        let state = self.state()?;
        Ok(ImageService::new(
            state.channel.clone(),
            state.namespace.clone(),
        ))
    }

    async fn load_container(&self, id: &str) -> Result<Option<Container>> {
        let state = self.state()?;
        let mut containers = ContainersClient::new(state.channel.clone());
        let request = GetContainerRequest { id: id.to_string() };
        match containers.get(with_namespace!(request, state.namespace)).await {
            Ok(response) => Ok(response.into_inner().container),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(Error::Internal(status.to_string())),
        }
    }
}

impl Default for ContainerdBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(status: &Status) -> bool {
    status.code() == Code::NotFound
}

/// Socket resolution order: explicit flag, environment, user runtime dir,
/// per-user run dir when non-root, system default.
fn resolve_endpoint(explicit: Option<&str>) -> String {
    if let Some(endpoint) = explicit {
        return endpoint.to_string();
    }
    if let Ok(endpoint) = std::env::var("CONTAINERD_ENDPOINT") {
        if !endpoint.is_empty() {
            return endpoint;
        }
    }

    #[cfg(unix)]
    let euid = u32::from(nix::unistd::geteuid());
    #[cfg(not(unix))]
    let euid = 0;

    for candidate in candidate_sockets(std::env::var("XDG_RUNTIME_DIR").ok().as_deref(), euid) {
        if candidate.exists() {
            return candidate.to_string_lossy().into_owned();
        }
    }
    SYSTEM_SOCKET.to_string()
}

fn candidate_sockets(xdg_runtime_dir: Option<&str>, euid: u32) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = xdg_runtime_dir {
        candidates.push(Path::new(dir).join("containerd").join("containerd.sock"));
        candidates.push(Path::new(dir).join("containerd.sock"));
    }
    if euid != 0 {
        candidates.push(PathBuf::from(format!(
            "/run/user/{euid}/containerd/containerd.sock"
        )));
    }
    candidates
}

#[async_trait]
impl Backend for ContainerdBackend {
    fn name(&self) -> &'static str {
        "containerd"
    }

    fn flags(&self) -> Vec<Flag> {
        vec![
            Flag {
                name: "backend-containerd-endpoint",
                env: Some("CONTAINERD_ENDPOINT"),
                usage: "containerd socket endpoint",
                default: Some(SYSTEM_SOCKET),
            },
            Flag {
                name: "backend-containerd-namespace",
                env: Some("CONTAINERD_NAMESPACE"),
                usage: "containerd namespace to use",
                default: Some("gantry"),
            },
            Flag {
                name: "backend-containerd-snapshotter",
                env: Some("CONTAINERD_SNAPSHOTTER"),
                usage: "snapshotter driver for step containers",
                default: Some("overlayfs"),
            },
        ]
    }

    async fn is_available(&self, config: &BackendConfig) -> bool {
        let endpoint = resolve_endpoint(config.containerd.endpoint.as_deref());
        match containerd_client::connect(&endpoint).await {
            Ok(channel) => VersionClient::new(channel).version(()).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn load(&mut self, config: &BackendConfig) -> Result<BackendInfo> {
        let endpoint = resolve_endpoint(config.containerd.endpoint.as_deref());
        let channel = containerd_client::connect(&endpoint)
            .await
            .map_err(|e| Error::Unreachable(format!("containerd at {endpoint}: {e}")))?;

        let version = VersionClient::new(channel.clone())
            .version(())
            .await
            .map_err(|e| Error::Unreachable(format!("containerd at {endpoint}: {e}")))?
            .into_inner();

        let log_dir = std::env::temp_dir().join("gantry-task-logs");
        tokio::fs::create_dir_all(&log_dir).await?;

        info!(endpoint = %endpoint, version = %version.version, "connected to containerd");
        self.state = Some(Loaded {
            channel,
            namespace: config.containerd.namespace.clone(),
            snapshotter: config.containerd.snapshotter.clone(),
            log_dir,
        });
        Ok(BackendInfo {
            platform: format!(
                "containerd/{}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
        })
    }

    async fn setup_workflow(
        &self,
        _config: &WorkflowConfig,
        _task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        // Steps share nothing at the runtime level; the namespace set at
        // load is the only shared scope.
        self.state().map(|_| ())
    }

    async fn start_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let state = self.state()?;
        let id = step_ident(task_uuid, &step.uuid);
        let snapshot = snapshot_name(&id);

        let images = self.images()?;
        images
            .pull(&step.image, step.pull, &state.snapshotter, cancel)
            .await?;
        let meta = images.resolve(&step.image).await?;

        let parent = chain_id(&meta.diff_ids).ok_or_else(|| Error::ImagePull {
            image: step.image.clone(),
            reason: "image has no layers".into(),
        })?;

        let mut snapshots = SnapshotsClient::new(state.channel.clone());
        let request = PrepareSnapshotRequest {
            snapshotter: state.snapshotter.clone(),
            key: snapshot.clone(),
            parent,
            ..Default::default()
        };
        let mounts = snapshots
            .prepare(with_namespace!(request, state.namespace))
            .await
            .map_err(|status| Error::Create {
                resource: format!("snapshot {snapshot}"),
                reason: status.message().to_string(),
            })?
            .into_inner()
            .mounts;

        let spec = oci::build_spec(step, &meta.config, &id);
        let container = Container {
            id: id.clone(),
            image: step.image.clone(),
            runtime: Some(container::Runtime {
                name: RUNC_RUNTIME.to_string(),
                options: None,
            }),
            spec: Some(oci::spec_any(&spec)),
            snapshotter: state.snapshotter.clone(),
            snapshot_key: snapshot.clone(),
            ..Default::default()
        };

        let mut containers = ContainersClient::new(state.channel.clone());
        let request = CreateContainerRequest {
            container: Some(container),
        };
        containers
            .create(with_namespace!(request, state.namespace))
            .await
            .map_err(|status| Error::Create {
                resource: format!("container {id}"),
                reason: status.message().to_string(),
            })?;

        // Task stdio lands in a per-step file the tail follows.
        let log_path = self.log_path(&id)?;
        drop(tokio::fs::File::create(&log_path).await?);
        let stdio = log_path.to_string_lossy().into_owned();

        let mut tasks = TasksClient::new(state.channel.clone());
        let request = CreateTaskRequest {
            container_id: id.clone(),
            rootfs: mounts,
            stdout: stdio.clone(),
            stderr: stdio,
            terminal: false,
            ..Default::default()
        };
        tasks
            .create(with_namespace!(request, state.namespace))
            .await
            .map_err(|status| Error::Create {
                resource: format!("task {id}"),
                reason: status.message().to_string(),
            })?;

        let request = StartRequest {
            container_id: id.clone(),
            ..Default::default()
        };
        tasks
            .start(with_namespace!(request, state.namespace))
            .await
            .map_err(|status| Error::Start {
                resource: format!("task {id}"),
                reason: status.message().to_string(),
            })?;

        info!(task = %id, image = %step.image, "task started");
        Ok(())
    }

    async fn wait_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<State> {
        let state = self.state()?;
        let id = step_ident(task_uuid, &step.uuid);

        if self.load_container(&id).await?.is_none() {
            return Err(Error::NotFound(format!("container {id}")));
        }

        let mut tasks = TasksClient::new(state.channel.clone());
        let request = GetRequest {
            container_id: id.clone(),
            ..Default::default()
        };
        tasks
            .get(with_namespace!(request, state.namespace))
            .await
            .map_err(|_| Error::LoadTask(id.clone()))?;

        let request = WaitRequest {
            container_id: id.clone(),
            ..Default::default()
        };
        let exit = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = tasks.wait(with_namespace!(request, state.namespace)) => outcome
                .map_err(|status| Error::WaitFailed(status.message().to_string()))?
                .into_inner(),
        };

        debug!(task = %id, exit_status = exit.exit_status, "task exited");
        Ok(State::exited(exit.exit_status as i32))
    }

    async fn tail_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<LogStream> {
        let state = self.state()?;
        let id = step_ident(task_uuid, &step.uuid);
        let log_path = self.log_path(&id)?;

        let mut file = tokio::fs::File::open(&log_path)
            .await
            .map_err(|_| Error::NotFound(format!("task log {id}")))?;
        file.rewind().await?;

        let mut tasks = TasksClient::new(state.channel.clone());
        let namespace = state.namespace.clone();
        let cancel = cancel.clone();
        let (reader, mut writer) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let request = WaitRequest {
                container_id: id.clone(),
                ..Default::default()
            };
            let mut exited = Box::pin(tasks.wait(with_namespace!(request, namespace)));
            let mut done = false;
            let mut buf = vec![0u8; 8192];

            loop {
                match file.read(&mut buf).await {
                    Ok(0) => {
                        if done {
                            break;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            // Drain whatever the shim flushed after exit,
                            // then stop on the next EOF.
                            _ = &mut exited, if !done => done = true,
                            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
                        }
                    }
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(task = %id, error = %e, "log read failed");
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
        });

        Ok(Box::pin(ReaderStream::new(reader)))
    }

    async fn destroy_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let state = self.state()?;
        let id = step_ident(task_uuid, &step.uuid);
        let snapshot = snapshot_name(&id);
        let mut first_error: Option<Error> = None;

        let container = self.load_container(&id).await?;

        if container.is_some() {
            let mut tasks = TasksClient::new(state.channel.clone());

            let request = KillRequest {
                container_id: id.clone(),
                signal: SIGKILL,
                all: true,
                ..Default::default()
            };
            match tasks.kill(with_namespace!(request, state.namespace)).await {
                Ok(_) => {
                    let request = WaitRequest {
                        container_id: id.clone(),
                        ..Default::default()
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tasks.wait(with_namespace!(request, state.namespace)) => {}
                    }
                }
                Err(status) if not_found(&status) => {}
                Err(status) => {
                    first_error.get_or_insert(Error::DestroyPartial(format!(
                        "kill task {id}: {}",
                        status.message()
                    )));
                }
            }

            let request = DeleteTaskRequest {
                container_id: id.clone(),
            };
            match tasks.delete(with_namespace!(request, state.namespace)).await {
                Ok(_) => debug!(task = %id, "task deleted"),
                Err(status) if not_found(&status) => {}
                Err(status) => {
                    first_error.get_or_insert(Error::DestroyPartial(format!(
                        "delete task {id}: {}",
                        status.message()
                    )));
                }
            }

            let mut containers = ContainersClient::new(state.channel.clone());
            let request = DeleteContainerRequest { id: id.clone() };
            match containers
                .delete(with_namespace!(request, state.namespace))
                .await
            {
                Ok(_) => debug!(container = %id, "container deleted"),
                Err(status) if not_found(&status) => {}
                Err(status) => {
                    first_error.get_or_insert(Error::DestroyPartial(format!(
                        "delete container {id}: {}",
                        status.message()
                    )));
                }
            }
        }

        // The snapshot may exist even when container creation failed.
        let mut snapshots = SnapshotsClient::new(state.channel.clone());
        let request = RemoveSnapshotRequest {
            snapshotter: state.snapshotter.clone(),
            key: snapshot.clone(),
        };
        match snapshots
            .remove(with_namespace!(request, state.namespace))
            .await
        {
            Ok(_) => debug!(snapshot = %snapshot, "snapshot removed"),
            Err(status) if not_found(&status) => {}
            Err(status) => {
                first_error.get_or_insert(Error::DestroyPartial(format!(
                    "remove snapshot {snapshot}: {}",
                    status.message()
                )));
            }
        }

        if let Ok(log_path) = self.log_path(&id) {
            let _ = tokio::fs::remove_file(log_path).await;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn destroy_workflow(
        &self,
        _config: &WorkflowConfig,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        // Per-step resources are gone by now; the channel itself closes
        // when the backend is dropped.
        debug!(task = %task_uuid, "workflow teardown complete");
        Ok(())
    }
}
