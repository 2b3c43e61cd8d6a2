//! Container-engine backend against a Docker daemon.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::volume::CreateVolumeOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_core::name::{network_name, step_ident};
use gantry_core::{
    Backend, BackendConfig, BackendInfo, Error, Flag, LogStream, PullPolicy, Result, State, Step,
    WorkflowConfig,
};

const CONNECT_TIMEOUT_SECS: u64 = 120;
const STOP_GRACE_SECS: i64 = 10;

/// Backend driving a daemon-based container engine over its local socket.
pub struct DockerBackend {
    client: Option<Docker>,
}

impl DockerBackend {
    pub fn new() -> Self {
        Self { client: None }
    }

    fn client(&self) -> Result<&Docker> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::ConfigMissing("docker backend not loaded".into()))
    }

    fn connect(host: &str) -> Result<Docker> {
        let docker = if host.starts_with("unix://") {
            Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_local_defaults()
        };
        docker.map_err(|e| Error::Unreachable(format!("docker daemon at {host}: {e}")))
    }

    async fn pull_image(&self, step: &Step, cancel: &CancellationToken) -> Result<()> {
        let docker = self.client()?;

        let present = docker.inspect_image(&step.image).await.is_ok();
        match step.pull {
            PullPolicy::IfMissing if present => return Ok(()),
            PullPolicy::Never if !present => {
                return Err(Error::ImageMissing(step.image.clone()));
            }
            PullPolicy::Never => return Ok(()),
            _ => {}
        }

        info!(image = %step.image, "pulling image");
        let options = CreateImageOptions {
            from_image: step.image.clone(),
            ..Default::default()
        };
        let mut pull = docker.create_image(Some(options), None, None);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                progress = pull.next() => match progress {
                    Some(Ok(info)) => {
                        if let Some(status) = info.status {
                            debug!(image = %step.image, status = %status, "pull progress");
                        }
                    }
                    Some(Err(e)) => {
                        return Err(Error::ImagePull {
                            image: step.image.clone(),
                            reason: e.to_string(),
                        });
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn flags(&self) -> Vec<Flag> {
        vec![Flag {
            name: "backend-docker-host",
            env: Some("DOCKER_HOST"),
            usage: "docker engine endpoint",
            default: Some("unix:///var/run/docker.sock"),
        }]
    }

    async fn is_available(&self, config: &BackendConfig) -> bool {
        match Self::connect(&config.docker.host) {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn load(&mut self, config: &BackendConfig) -> Result<BackendInfo> {
        let docker = Self::connect(&config.docker.host)?;
        let version = docker
            .version()
            .await
            .map_err(|e| Error::Unreachable(format!("docker daemon: {e}")))?;
        let platform = format!(
            "docker/{}/{}",
            version.os.unwrap_or_else(|| "unknown".into()),
            version.arch.unwrap_or_else(|| "unknown".into()),
        );
        self.client = Some(docker);
        Ok(BackendInfo { platform })
    }

    async fn setup_workflow(
        &self,
        config: &WorkflowConfig,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let docker = self.client()?;

        let network = network_name(task_uuid);
        let options = CreateNetworkOptions {
            name: network.clone(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            ..Default::default()
        };
        match docker.create_network(options).await {
            Ok(_) => debug!(network = %network, "created workflow network"),
            // Conflict means a previous attempt already provisioned it.
            Err(e) if is_status(&e, 409) => {}
            Err(e) => return Err(Error::SetupFailed(format!("network {network}: {e}"))),
        }

        for volume in &config.volumes {
            let options = CreateVolumeOptions {
                name: volume.clone(),
                ..Default::default()
            };
            docker
                .create_volume(options)
                .await
                .map_err(|e| Error::SetupFailed(format!("volume {volume}: {e}")))?;
        }

        Ok(())
    }

    async fn start_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.pull_image(step, cancel).await?;

        let docker = self.client()?;
        let id = step_ident(task_uuid, &step.uuid);

        let env: Vec<String> = step
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let cmd = step
            .shell_line()
            .map(|line| vec!["/bin/sh".to_string(), "-c".to_string(), line]);

        let binds: Vec<String> = step
            .volumes
            .iter()
            .map(|v| {
                if v.read_only {
                    format!("{}:{}:ro", v.host_path, v.container_path)
                } else {
                    format!("{}:{}", v.host_path, v.container_path)
                }
            })
            .collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &step.ports {
            port_bindings.insert(
                format!("{}/tcp", port.container_port),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            privileged: Some(step.privileged),
            memory: step
                .resources
                .memory_limit
                .as_deref()
                .and_then(parse_memory),
            nano_cpus: step.resources.cpu_limit.as_deref().and_then(parse_cpu),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            network_mode: Some(network_name(task_uuid)),
            ..Default::default()
        };

        let config = Config {
            image: Some(step.image.clone()),
            cmd,
            env: Some(env),
            working_dir: step.working_directory.clone(),
            user: step.user.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: id.clone(),
            platform: None,
        };

        info!(container = %id, image = %step.image, "creating container");
        docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::Create {
                resource: format!("container {id}"),
                reason: e.to_string(),
            })?;

        // Extra step networks beyond the workflow network, aliased by step
        // name so siblings can address this container.
        for network in &step.networks {
            let options = ConnectNetworkOptions {
                container: id.clone(),
                endpoint_config: EndpointSettings {
                    aliases: Some(vec![step.name.clone()]),
                    ..Default::default()
                },
            };
            if let Err(e) = docker.connect_network(network, options).await {
                warn!(container = %id, network = %network, error = %e, "network attach failed");
            }
        }

        info!(container = %id, "starting container");
        docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Start {
                resource: format!("container {id}"),
                reason: e.to_string(),
            })
    }

    async fn wait_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<State> {
        let docker = self.client()?;
        let id = step_ident(task_uuid, &step.uuid);

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = docker.wait_container(&id, Some(options));

        let exit_code = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = wait.next() => match outcome {
                Some(Ok(response)) => response.status_code,
                // The engine reports non-zero exits through the error
                // payload of the wait body.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) if is_status(&e, 404) => {
                    return Err(Error::NotFound(format!("container {id}")));
                }
                Some(Err(e)) => return Err(Error::WaitFailed(e.to_string())),
                None => return Err(Error::WaitFailed(format!("wait channel closed for {id}"))),
            },
        };

        let mut state = State::exited(exit_code as i32);
        match docker
            .inspect_container(&id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                if let Some(container_state) = inspect.state {
                    state.oom_killed = container_state.oom_killed.unwrap_or(false);
                    state.error = container_state.error.filter(|e| !e.is_empty());
                }
            }
            Err(e) => warn!(container = %id, error = %e, "inspect after exit failed"),
        }
        Ok(state)
    }

    async fn tail_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<LogStream> {
        let docker = self.client()?;
        let id = step_ident(task_uuid, &step.uuid);

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let logs = docker
            .logs(&id, Some(options))
            .map(|chunk| match chunk {
                Ok(output) => Ok(output.into_bytes()),
                Err(e) => Err(std::io::Error::other(e)),
            })
            .take_until(cancel.clone().cancelled_owned());

        Ok(Box::pin(logs))
    }

    async fn destroy_step(
        &self,
        step: &Step,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let docker = self.client()?;
        let id = step_ident(task_uuid, &step.uuid);
        let mut first_error = None;

        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match docker.stop_container(&id, Some(options)).await {
            Ok(()) => {}
            // 304: already stopped.
            Err(e) if is_status(&e, 404) || is_status(&e, 304) => {}
            Err(e) => {
                warn!(container = %id, error = %e, "stop failed");
                first_error.get_or_insert(Error::DestroyPartial(format!("stop {id}: {e}")));
            }
        }

        let options = RemoveContainerOptions {
            v: true,
            force: true,
            ..Default::default()
        };
        match docker.remove_container(&id, Some(options)).await {
            Ok(()) => debug!(container = %id, "removed container"),
            Err(e) if is_status(&e, 404) => {}
            Err(e) => {
                warn!(container = %id, error = %e, "remove failed");
                first_error.get_or_insert(Error::DestroyPartial(format!("remove {id}: {e}")));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn destroy_workflow(
        &self,
        config: &WorkflowConfig,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let docker = self.client()?;

        let network = network_name(task_uuid);
        match docker.remove_network(&network).await {
            Ok(()) => debug!(network = %network, "removed workflow network"),
            Err(e) if is_status(&e, 404) => {}
            Err(e) => warn!(network = %network, error = %e, "network remove failed"),
        }

        for volume in &config.volumes {
            match docker.remove_volume(volume, None).await {
                Ok(()) => {}
                Err(e) if is_status(&e, 404) => {}
                Err(e) => warn!(volume = %volume, error = %e, "volume remove failed"),
            }
        }

        Ok(())
    }
}

fn is_status(err: &bollard::errors::Error, status: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if *status_code == status
    )
}

/// Parse an orchestrator-style memory quantity ("256Mi", "1G") into bytes.
fn parse_memory(quantity: &str) -> Option<i64> {
    let trimmed = quantity.trim();
    let split = trimmed.find(|c: char| !c.is_ascii_digit())?;
    let (digits, suffix) = if split == 0 {
        return None;
    } else {
        trimmed.split_at(split)
    };
    let base: i64 = digits.parse().ok()?;
    let multiplier: i64 = match suffix {
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "K" | "k" => 1_000,
        "M" | "m" => 1_000_000,
        "G" | "g" => 1_000_000_000,
        _ => return None,
    };
    Some(base * multiplier)
}

/// Parse an orchestrator-style CPU quantity ("500m", "2") into nano-CPUs.
fn parse_cpu(quantity: &str) -> Option<i64> {
    let trimmed = quantity.trim();
    if let Some(millis) = trimmed.strip_suffix('m') {
        let value: i64 = millis.parse().ok()?;
        Some(value * 1_000_000)
    } else {
        let value: f64 = trimmed.parse().ok()?;
        Some((value * 1_000_000_000.0) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory("256Mi"), Some(256 * 1024 * 1024));
        assert_eq!(parse_memory("1Gi"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory("512M"), Some(512_000_000));
        assert_eq!(parse_memory("bogus"), None);
        assert_eq!(parse_memory("Mi"), None);
    }

    #[test]
    fn cpu_quantities() {
        assert_eq!(parse_cpu("500m"), Some(500_000_000));
        assert_eq!(parse_cpu("2"), Some(2_000_000_000));
        assert_eq!(parse_cpu("1.5"), Some(1_500_000_000));
        assert_eq!(parse_cpu("lots"), None);
    }

    #[test]
    fn status_classification() {
        let not_found = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        assert!(is_status(&not_found, 404));
        assert!(!is_status(&not_found, 304));
    }

    #[test]
    fn flags_are_prefixed() {
        let backend = DockerBackend::new();
        for flag in backend.flags() {
            assert!(flag.name.starts_with("backend-docker-"));
        }
    }

    #[test]
    fn operations_require_load() {
        let backend = DockerBackend::new();
        assert!(matches!(backend.client(), Err(Error::ConfigMissing(_))));
    }
}
