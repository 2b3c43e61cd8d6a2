//! Drives a backend through the workflow lifecycle.
//!
//! The ordering contract lives here: `start_step` → (`wait_step` ∥
//! `tail_step`) → `destroy_step` for every started step, then
//! `destroy_workflow`, no matter how the middle went. Teardown runs on a
//! fresh context bounded by a grace timer, so a cancelled workflow still
//! cleans up after itself.

use futures::StreamExt;
use gantry_core::{Backend, Error, Result, State, Step, Workflow};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DESTROY_GRACE: Duration = Duration::from_secs(30);

/// Outcome of one step.
#[derive(Debug)]
pub struct StepResult {
    pub uuid: String,
    pub name: String,
    pub state: State,
}

/// Outcome of a workflow run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub steps: Vec<StepResult>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn success(&self) -> bool {
        !self.cancelled && self.steps.iter().all(|s| s.state.success())
    }
}

pub struct WorkflowRunner {
    backend: Arc<dyn Backend>,
}

impl WorkflowRunner {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Execute the workflow's steps in order, stopping at the first failure
    /// or on cancellation. Every started step is destroyed; the workflow
    /// context is always destroyed.
    pub async fn run(
        &self,
        workflow: &Workflow,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let mut report = RunReport::default();

        if let Err(e) = self
            .backend
            .setup_workflow(&workflow.config, task_uuid, cancel)
            .await
        {
            self.destroy_workflow(workflow, task_uuid).await;
            return Err(e);
        }

        for step in &workflow.steps {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            info!(step = %step.name, uuid = %step.uuid, "running step");
            match self.run_step(step, task_uuid, cancel).await {
                Ok(state) => {
                    let keep_going = state.success();
                    report.steps.push(StepResult {
                        uuid: step.uuid.clone(),
                        name: step.name.clone(),
                        state,
                    });
                    if !keep_going {
                        warn!(step = %step.name, "step failed, aborting workflow");
                        break;
                    }
                }
                Err(e) if e.is_cancelled() => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    self.destroy_workflow(workflow, task_uuid).await;
                    return Err(e);
                }
            }
        }

        self.destroy_workflow(workflow, task_uuid).await;
        Ok(report)
    }

    /// One full step lifecycle. The step is destroyed on every path out of
    /// this function once `start_step` returned ok.
    async fn run_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<State> {
        if let Err(e) = self.backend.start_step(step, task_uuid, cancel).await {
            // A failed start can leave partial artifacts behind; they carry
            // deterministic names, so destroy finds them.
            self.destroy_step(step, task_uuid).await;
            return Err(e);
        }

        let tail = self.backend.tail_step(step, task_uuid, cancel).await;
        let forwarder = match tail {
            Ok(mut stream) => Some(tokio::spawn(async move {
                let mut sink = tokio::io::stdout();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            if sink.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "log stream error");
                            break;
                        }
                    }
                }
                let _ = sink.flush().await;
            })),
            Err(e) => {
                warn!(step = %step.uuid, error = %e, "log tail unavailable");
                None
            }
        };

        let waited = self.backend.wait_step(step, task_uuid, cancel).await;

        let state = match waited {
            Ok(state) => Ok(state),
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            // Wait failures surface as a state with the error attached so
            // the controller sees a terminal observation either way.
            Err(e) => Ok(State {
                exited: false,
                exit_code: 1,
                oom_killed: false,
                error: Some(e.to_string()),
            }),
        };

        self.destroy_step(step, task_uuid).await;

        if let Some(handle) = forwarder {
            let _ = handle.await;
        }

        state
    }

    /// Destroy with a fresh token and the grace bound: cancellation of the
    /// workflow must not leave a half-removed step behind.
    async fn destroy_step(&self, step: &Step, task_uuid: &str) {
        let grace = CancellationToken::new();
        match tokio::time::timeout(
            DESTROY_GRACE,
            self.backend.destroy_step(step, task_uuid, &grace),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(step = %step.uuid, error = %e, "step teardown incomplete"),
            Err(_) => error!(step = %step.uuid, "step teardown timed out"),
        }
    }

    async fn destroy_workflow(&self, workflow: &Workflow, task_uuid: &str) {
        let grace = CancellationToken::new();
        match tokio::time::timeout(
            DESTROY_GRACE,
            self.backend
                .destroy_workflow(&workflow.config, task_uuid, &grace),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "workflow teardown incomplete"),
            Err(_) => error!("workflow teardown timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gantry_core::{BackendConfig, BackendInfo, Flag, LogStream, WorkflowConfig};
    use std::sync::Mutex;

    /// Records every lifecycle call; scripted to fail or hang on demand.
    struct ScriptedBackend {
        calls: Mutex<Vec<String>>,
        fail_start: Option<String>,
        exit_codes: std::collections::HashMap<String, i32>,
        hang_wait: Option<String>,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_start: None,
                exit_codes: Default::default(),
                hang_wait: None,
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn flags(&self) -> Vec<Flag> {
            vec![]
        }

        async fn is_available(&self, _config: &BackendConfig) -> bool {
            true
        }

        async fn load(&mut self, _config: &BackendConfig) -> Result<BackendInfo> {
            Ok(BackendInfo {
                platform: "scripted".into(),
            })
        }

        async fn setup_workflow(
            &self,
            _config: &WorkflowConfig,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.record("setup");
            Ok(())
        }

        async fn start_step(
            &self,
            step: &Step,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.record(format!("start:{}", step.uuid));
            if self.fail_start.as_deref() == Some(step.uuid.as_str()) {
                return Err(Error::ImagePull {
                    image: step.image.clone(),
                    reason: "no such image".into(),
                });
            }
            Ok(())
        }

        async fn wait_step(
            &self,
            step: &Step,
            _task_uuid: &str,
            cancel: &CancellationToken,
        ) -> Result<State> {
            self.record(format!("wait:{}", step.uuid));
            if self.hang_wait.as_deref() == Some(step.uuid.as_str()) {
                cancel.cancelled().await;
                return Err(Error::Cancelled);
            }
            Ok(State::exited(
                self.exit_codes.get(&step.uuid).copied().unwrap_or(0),
            ))
        }

        async fn tail_step(
            &self,
            step: &Step,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<LogStream> {
            self.record(format!("tail:{}", step.uuid));
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn destroy_step(
            &self,
            step: &Step,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.record(format!("destroy:{}", step.uuid));
            Ok(())
        }

        async fn destroy_workflow(
            &self,
            _config: &WorkflowConfig,
            _task_uuid: &str,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.record("destroy_workflow");
            Ok(())
        }
    }

    fn workflow(uuids: &[&str]) -> Workflow {
        Workflow {
            config: WorkflowConfig::default(),
            steps: uuids
                .iter()
                .map(|u| Step::new(*u, *u, "busybox").with_commands(vec!["true".into()]))
                .collect(),
        }
    }

    #[tokio::test]
    async fn happy_path_runs_full_lifecycle_in_order() {
        let backend = Arc::new(ScriptedBackend::new());
        let runner = WorkflowRunner::new(backend.clone());
        let cancel = CancellationToken::new();

        let report = runner
            .run(&workflow(&["s1", "s2"]), "t1", &cancel)
            .await
            .unwrap();
        assert!(report.success());
        assert_eq!(
            backend.calls(),
            vec![
                "setup",
                "start:s1",
                "tail:s1",
                "wait:s1",
                "destroy:s1",
                "start:s2",
                "tail:s2",
                "wait:s2",
                "destroy:s2",
                "destroy_workflow",
            ]
        );
    }

    #[tokio::test]
    async fn start_failure_aborts_but_still_tears_down() {
        let mut backend = ScriptedBackend::new();
        backend.fail_start = Some("s1".into());
        let backend = Arc::new(backend);
        let runner = WorkflowRunner::new(backend.clone());

        let err = runner
            .run(&workflow(&["s1", "s2"]), "t1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImagePull { .. }));

        let calls = backend.calls();
        assert!(calls.contains(&"destroy:s1".to_string()));
        assert!(!calls.contains(&"start:s2".to_string()));
        assert_eq!(calls.last().unwrap(), "destroy_workflow");
    }

    #[tokio::test]
    async fn failing_step_halts_later_steps() {
        let mut backend = ScriptedBackend::new();
        backend.exit_codes.insert("s1".into(), 7);
        let backend = Arc::new(backend);
        let runner = WorkflowRunner::new(backend.clone());

        let report = runner
            .run(&workflow(&["s1", "s2"]), "t1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.success());
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].state.exit_code, 7);

        let calls = backend.calls();
        assert!(calls.contains(&"destroy:s1".to_string()));
        assert!(!calls.contains(&"start:s2".to_string()));
        assert_eq!(calls.last().unwrap(), "destroy_workflow");
    }

    #[tokio::test]
    async fn cancellation_mid_wait_still_destroys() {
        let mut backend = ScriptedBackend::new();
        backend.hang_wait = Some("s1".into());
        let backend = Arc::new(backend);
        let runner = WorkflowRunner::new(backend.clone());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = runner
            .run(&workflow(&["s1", "s2"]), "t1", &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);

        let calls = backend.calls();
        assert!(calls.contains(&"destroy:s1".to_string()));
        assert!(!calls.contains(&"start:s2".to_string()));
        assert_eq!(calls.last().unwrap(), "destroy_workflow");
    }
}
