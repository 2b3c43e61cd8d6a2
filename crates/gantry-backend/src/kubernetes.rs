//! Orchestrator backend: one short-lived, single-pod Job per step.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, EnvFromSource, EnvVar, HostPathVolumeSource, Pod,
    PodSpec, PodTemplateSpec, ResourceRequirements, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_core::name::{env_name, step_ident};
use gantry_core::{
    Backend, BackendConfig, BackendInfo, Error, Flag, LogStream, PullPolicy, Result, State, Step,
    WorkflowConfig,
};

const STEP_CONTAINER: &str = "step";

/// Backend mapping each step onto a cluster Job.
pub struct KubernetesBackend {
    client: Option<Client>,
    namespace: String,
}

impl KubernetesBackend {
    pub fn new() -> Self {
        Self {
            client: None,
            namespace: "default".into(),
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::ConfigMissing("kubernetes backend not loaded".into()))
    }

    fn jobs(&self) -> Result<Api<Job>> {
        Ok(Api::namespaced(self.client()?.clone(), &self.namespace))
    }

    fn pods(&self) -> Result<Api<Pod>> {
        Ok(Api::namespaced(self.client()?.clone(), &self.namespace))
    }

    async fn find_pod(&self, id: &str) -> Result<Option<Pod>> {
        let params = ListParams::default().labels(&format!("job-name={id}"));
        let pods = self.pods()?.list(&params).await.map_err(map_kube_err)?;
        Ok(pods.items.into_iter().next())
    }
}

impl Default for KubernetesBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn map_kube_err(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => {
            Error::NotFound(response.message.clone())
        }
        other => Error::Internal(other.to_string()),
    }
}

fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

fn pull_policy_name(policy: PullPolicy) -> &'static str {
    match policy {
        PullPolicy::Always => "Always",
        PullPolicy::IfMissing => "IfNotPresent",
        PullPolicy::Never => "Never",
    }
}

/// Build the Job manifest for a step. Pure; the shape is pinned by tests.
fn build_job(step: &Step, task_uuid: &str, env_from: &str) -> Job {
    let id = step_ident(task_uuid, &step.uuid);

    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/managed-by".to_string(), "gantry".to_string());
    labels.insert("gantry/task".to_string(), task_uuid.to_string());
    labels.insert("gantry/step".to_string(), step.uuid.clone());

    let env: Vec<EnvVar> = step
        .environment
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            value_from: None,
        })
        .collect();

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for (index, volume) in step.volumes.iter().enumerate() {
        let name = format!("vol-{index}");
        volumes.push(Volume {
            name: name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: volume.host_path.clone(),
                type_: None,
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name,
            mount_path: volume.container_path.clone(),
            read_only: Some(volume.read_only),
            ..Default::default()
        });
    }

    let mut limits = BTreeMap::new();
    let mut requests = BTreeMap::new();
    if let Some(cpu) = &step.resources.cpu_limit {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &step.resources.memory_limit {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(cpu) = &step.resources.cpu_request {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &step.resources.memory_request {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }

    let container = Container {
        name: STEP_CONTAINER.to_string(),
        image: Some(step.image.clone()),
        image_pull_policy: Some(pull_policy_name(step.pull).to_string()),
        command: step
            .shell_line()
            .map(|line| vec!["/bin/sh".to_string(), "-c".to_string(), line]),
        working_dir: step.working_directory.clone(),
        env: (!env.is_empty()).then_some(env),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: Some(env_from.to_string()),
                optional: Some(true),
            }),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            privileged: Some(step.privileged),
            run_as_user: step.user.as_deref().and_then(|u| u.parse().ok()),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            limits: (!limits.is_empty()).then_some(limits),
            requests: (!requests.is_empty()).then_some(requests),
            ..Default::default()
        }),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(id),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Terminal observation of a pod's step container, when it has one.
fn terminal_state(pod: &Pod) -> Option<State> {
    let status = pod.status.as_ref()?;
    let terminated = status
        .container_statuses
        .as_ref()?
        .iter()
        .find(|cs| cs.name == STEP_CONTAINER)?
        .state
        .as_ref()?
        .terminated
        .as_ref()?;

    Some(State {
        exited: true,
        exit_code: terminated.exit_code,
        oom_killed: terminated.reason.as_deref() == Some("OOMKilled"),
        error: terminated.message.clone(),
    })
}

fn pod_is_done(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

#[async_trait]
impl Backend for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn flags(&self) -> Vec<Flag> {
        vec![Flag {
            name: "backend-k8s-namespace",
            env: Some("KUBE_NAMESPACE"),
            usage: "namespace step jobs run in",
            default: Some("default"),
        }]
    }

    async fn is_available(&self, _config: &BackendConfig) -> bool {
        match Client::try_default().await {
            Ok(client) => client.apiserver_version().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn load(&mut self, config: &BackendConfig) -> Result<BackendInfo> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Unreachable(format!("cluster api: {e}")))?;
        let version = client
            .apiserver_version()
            .await
            .map_err(|e| Error::Unreachable(format!("cluster api: {e}")))?;
        self.namespace = config.kubernetes.namespace.clone();
        self.client = Some(client);
        Ok(BackendInfo {
            platform: format!("kubernetes/{}", version.git_version),
        })
    }

    async fn setup_workflow(
        &self,
        config: &WorkflowConfig,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let name = env_name(task_uuid);
        let data: BTreeMap<String, String> = config
            .secrets
            .iter()
            .map(|s| (s.name.clone(), s.value.clone()))
            .collect();

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        let api: Api<ConfigMap> = Api::namespaced(self.client()?.clone(), &self.namespace);
        match api.create(&PostParams::default(), &config_map).await {
            Ok(_) => debug!(config_map = %name, "created workflow config map"),
            // A previous attempt already provisioned it.
            Err(e) if is_conflict(&e) => {}
            Err(e) => return Err(Error::SetupFailed(format!("config map {name}: {e}"))),
        }
        Ok(())
    }

    async fn start_step(
        &self,
        step: &Step,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let id = step_ident(task_uuid, &step.uuid);
        let job = build_job(step, task_uuid, &env_name(task_uuid));

        info!(job = %id, image = %step.image, "submitting job");
        self.jobs()?
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| Error::Create {
                resource: format!("job {id}"),
                reason: e.to_string(),
            })?;
        // Returns once the API accepted the Job, not once it is scheduled.
        Ok(())
    }

    async fn wait_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<State> {
        let id = step_ident(task_uuid, &step.uuid);

        let config = watcher::Config::default().labels(&format!("job-name={id}"));
        let mut stream = watcher(self.pods()?, config)
            .default_backoff()
            .applied_objects()
            .boxed();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = stream.try_next() => match event {
                    Ok(Some(pod)) => {
                        if let Some(state) = terminal_state(&pod) {
                            return Ok(state);
                        }
                        if pod_is_done(&pod) {
                            // Terminal phase without container status: the
                            // pod failed before the step container ran.
                            let message = pod
                                .status
                                .as_ref()
                                .and_then(|s| s.message.clone());
                            return Ok(State {
                                exited: true,
                                exit_code: 1,
                                oom_killed: false,
                                error: message,
                            });
                        }
                    }
                    Ok(None) => return Err(Error::WaitFailed(format!("watch ended for {id}"))),
                    Err(e) => return Err(Error::WaitFailed(e.to_string())),
                },
            }
        }
    }

    async fn tail_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<LogStream> {
        let id = step_ident(task_uuid, &step.uuid);
        let pods = self.pods()?;
        let backend = KubernetesTail {
            pods,
            id: id.clone(),
        };

        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.follow(&mut writer, &cancel).await {
                warn!(job = %backend.id, error = %e, "log follow ended");
            }
            let _ = writer.shutdown().await;
        });

        Ok(Box::pin(ReaderStream::new(reader)))
    }

    async fn destroy_step(
        &self,
        step: &Step,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let id = step_ident(task_uuid, &step.uuid);
        match self.jobs()?.delete(&id, &DeleteParams::foreground()).await {
            Ok(_) => {
                debug!(job = %id, "deleted job");
                Ok(())
            }
            Err(e) if is_kube_not_found(&e) => Ok(()),
            Err(e) => Err(Error::DestroyPartial(format!("job {id}: {e}"))),
        }
    }

    async fn destroy_workflow(
        &self,
        _config: &WorkflowConfig,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let name = env_name(task_uuid);
        let api: Api<ConfigMap> = Api::namespaced(self.client()?.clone(), &self.namespace);
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_kube_not_found(&e) => Ok(()),
            Err(e) => Err(Error::DestroyPartial(format!("config map {name}: {e}"))),
        }
    }
}

/// Follows pod logs across rotations until the pod is terminal.
struct KubernetesTail {
    pods: Api<Pod>,
    id: String,
}

impl KubernetesTail {
    async fn pod_name(&self) -> Result<Option<String>> {
        let params = ListParams::default().labels(&format!("job-name={}", self.id));
        let pods = self.pods.list(&params).await.map_err(map_kube_err)?;
        Ok(pods.items.into_iter().next().and_then(|p| p.metadata.name))
    }

    async fn follow(
        &self,
        writer: &mut (impl tokio::io::AsyncWrite + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let params = LogParams {
            container: Some(STEP_CONTAINER.to_string()),
            follow: true,
            ..Default::default()
        };

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let Some(pod_name) = self.pod_name().await? else {
                // Pod not scheduled yet.
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };

            match self.pods.log_stream(&pod_name, &params).await {
                Ok(logs) => {
                    let mut reader = logs;
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        copied = tokio::io::copy(&mut reader, writer) => {
                            if let Err(e) = copied {
                                debug!(pod = %pod_name, error = %e, "log stream interrupted");
                            }
                        }
                    }
                }
                Err(e) => debug!(pod = %pod_name, error = %e, "log stream open failed"),
            }

            // The stream ends on rotation as well as on exit; only stop once
            // the pod is actually terminal.
            match self.pods.get(&pod_name).await {
                Ok(pod) if !pod_is_done(&pod) => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                _ => return Ok(()),
            }
        }
    }
}
