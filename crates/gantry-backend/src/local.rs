//! Local backend: step commands run directly on the host.
//!
//! Each workflow gets a directory under the workspace root, each step a
//! subdirectory and a `/bin/sh -c` subprocess in its own process group so
//! teardown can signal the whole tree.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_core::name::step_ident;
use gantry_core::{
    Backend, BackendConfig, BackendInfo, Error, Flag, LogStream, Result, State, Step,
    WorkflowConfig,
};

const TERM_GRACE: Duration = Duration::from_secs(5);

struct StepProcess {
    pid: Option<i32>,
    child: Option<Child>,
    log_rx: Option<mpsc::Receiver<Bytes>>,
    exit: Option<i32>,
}

/// Backend executing steps as host subprocesses.
pub struct LocalBackend {
    workspace: Option<PathBuf>,
    procs: Mutex<HashMap<String, Arc<tokio::sync::Mutex<StepProcess>>>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            workspace: None,
            procs: Mutex::new(HashMap::new()),
        }
    }

    fn workspace(&self) -> Result<&PathBuf> {
        self.workspace
            .as_ref()
            .ok_or_else(|| Error::ConfigMissing("local backend not loaded".into()))
    }

    fn workflow_dir(&self, task_uuid: &str) -> Result<PathBuf> {
        Ok(self.workspace()?.join(task_uuid))
    }

    fn entry(&self, id: &str) -> Option<Arc<tokio::sync::Mutex<StepProcess>>> {
        self.procs.lock().expect("proc table poisoned").get(id).cloned()
    }

    /// Pump one child pipe into the shared log channel.
    fn pump(
        mut pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        tx: mpsc::Sender<Bytes>,
    ) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match pipe.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    #[cfg(unix)]
    fn signal_group(pid: i32, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;
        // ESRCH means the group is already gone.
        if let Err(e) = killpg(Pid::from_raw(pid), signal) {
            if e != nix::errno::Errno::ESRCH {
                warn!(pid, signal = %signal, error = %e, "signal delivery failed");
            }
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn flags(&self) -> Vec<Flag> {
        vec![Flag {
            name: "backend-local-workspace",
            env: None,
            usage: "per-step workspace root",
            default: None,
        }]
    }

    async fn is_available(&self, _config: &BackendConfig) -> bool {
        // The host shell is always there.
        true
    }

    async fn load(&mut self, config: &BackendConfig) -> Result<BackendInfo> {
        let root = config
            .local
            .workspace
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join("gantry");
        tokio::fs::create_dir_all(&root).await?;
        self.workspace = Some(root);
        Ok(BackendInfo {
            platform: format!(
                "local/{}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
        })
    }

    async fn setup_workflow(
        &self,
        _config: &WorkflowConfig,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let dir = self.workflow_dir(task_uuid)?;
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "created workflow workspace");
        Ok(())
    }

    async fn start_step(
        &self,
        step: &Step,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let id = step_ident(task_uuid, &step.uuid);
        let line = step.shell_line().ok_or_else(|| Error::Create {
            resource: format!("process {id}"),
            reason: "step has no commands to execute on the host".into(),
        })?;

        let step_dir = self.workflow_dir(task_uuid)?.join(&step.uuid);
        tokio::fs::create_dir_all(&step_dir).await?;

        let cwd = match &step.working_directory {
            Some(dir) if PathBuf::from(dir).is_absolute() => PathBuf::from(dir),
            _ => step_dir.clone(),
        };

        #[cfg(unix)]
        let mut command = Command::new("/bin/sh");
        #[cfg(unix)]
        command.arg("-c").arg(&line);
        #[cfg(windows)]
        let mut command = Command::new("cmd");
        #[cfg(windows)]
        command.arg("/C").arg(&line);

        command
            .current_dir(&cwd)
            .envs(&step.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        info!(step = %id, cwd = %cwd.display(), "spawning step process");
        let mut child = command.spawn().map_err(|e| Error::Start {
            resource: format!("process {id}"),
            reason: e.to_string(),
        })?;

        let (tx, rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            Self::pump(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::pump(stderr, tx);
        }

        let proc = StepProcess {
            pid: child.id().map(|pid| pid as i32),
            child: Some(child),
            log_rx: Some(rx),
            exit: None,
        };
        self.procs
            .lock()
            .expect("proc table poisoned")
            .insert(id, Arc::new(tokio::sync::Mutex::new(proc)));
        Ok(())
    }

    async fn wait_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<State> {
        let id = step_ident(task_uuid, &step.uuid);
        let entry = self.entry(&id).ok_or_else(|| Error::LoadTask(id.clone()))?;
        let mut proc = entry.lock().await;

        if let Some(code) = proc.exit {
            return Ok(State::exited(code));
        }

        let child = proc
            .child
            .as_mut()
            .ok_or_else(|| Error::LoadTask(id.clone()))?;

        // Child::wait is cancel safe: on cancellation the exit stays
        // unconsumed for destroy_step to reap.
        let status = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            status = child.wait() => status.map_err(|e| Error::WaitFailed(e.to_string()))?,
        };

        let code = exit_code(status);
        proc.exit = Some(code);
        proc.child = None;
        debug!(step = %id, exit_code = code, "step process exited");
        Ok(State::exited(code))
    }

    async fn tail_step(
        &self,
        step: &Step,
        task_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<LogStream> {
        let id = step_ident(task_uuid, &step.uuid);
        let entry = self.entry(&id).ok_or_else(|| Error::LoadTask(id.clone()))?;
        let rx = entry
            .lock()
            .await
            .log_rx
            .take()
            .ok_or_else(|| Error::Internal(format!("logs for {id} already consumed")))?;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        })
        .take_until(cancel.clone().cancelled_owned());
        Ok(Box::pin(stream))
    }

    async fn destroy_step(
        &self,
        step: &Step,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let id = step_ident(task_uuid, &step.uuid);
        let entry = self.procs.lock().expect("proc table poisoned").remove(&id);

        if let Some(entry) = entry {
            let mut proc = entry.lock().await;
            if let Some(mut child) = proc.child.take() {
                #[cfg(unix)]
                if let Some(pid) = proc.pid {
                    Self::signal_group(pid, nix::sys::signal::Signal::SIGTERM);
                }
                #[cfg(not(unix))]
                let _ = child.start_kill();

                let graceful = tokio::time::timeout(TERM_GRACE, child.wait()).await;
                if graceful.is_err() {
                    #[cfg(unix)]
                    if let Some(pid) = proc.pid {
                        Self::signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                    }
                    #[cfg(not(unix))]
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                debug!(step = %id, "step process terminated");
            }
        }

        let step_dir = self.workflow_dir(task_uuid)?.join(&step.uuid);
        match tokio::fs::remove_dir_all(&step_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::DestroyPartial(format!("workspace {id}: {e}"))),
        }
        Ok(())
    }

    async fn destroy_workflow(
        &self,
        _config: &WorkflowConfig,
        task_uuid: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        // Reap anything a caller failed to destroy individually.
        let leftovers: Vec<_> = {
            let mut procs = self.procs.lock().expect("proc table poisoned");
            let keys: Vec<_> = procs
                .keys()
                .filter(|k| k.starts_with(&format!("{task_uuid}-")))
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| procs.remove(&k)).collect()
        };
        for entry in leftovers {
            let mut proc = entry.lock().await;
            if let Some(mut child) = proc.child.take() {
                #[cfg(unix)]
                if let Some(pid) = proc.pid {
                    Self::signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                }
                #[cfg(not(unix))]
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        let dir = self.workflow_dir(task_uuid)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::DestroyPartial(format!("workspace {task_uuid}: {e}"))),
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn loaded_backend(root: &std::path::Path) -> LocalBackend {
        let mut backend = LocalBackend::new();
        let config = BackendConfig {
            local: gantry_core::backend::LocalConfig {
                workspace: Some(root.to_path_buf()),
            },
            ..Default::default()
        };
        backend.load(&config).await.unwrap();
        backend
    }

    fn sh_step(uuid: &str, commands: &[&str]) -> Step {
        Step::new(uuid, uuid, "busybox")
            .with_commands(commands.iter().map(|c| c.to_string()).collect())
    }

    #[tokio::test]
    async fn exit_codes_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = loaded_backend(dir.path()).await;
        let cancel = CancellationToken::new();

        backend
            .setup_workflow(&WorkflowConfig::default(), "t1", &cancel)
            .await
            .unwrap();

        let ok = sh_step("s0", &["exit 0"]);
        backend.start_step(&ok, "t1", &cancel).await.unwrap();
        let state = backend.wait_step(&ok, "t1", &cancel).await.unwrap();
        assert!(state.exited);
        assert_eq!(state.exit_code, 0);
        backend.destroy_step(&ok, "t1", &cancel).await.unwrap();

        let failing = sh_step("s7", &["exit 7"]);
        backend.start_step(&failing, "t1", &cancel).await.unwrap();
        let state = backend.wait_step(&failing, "t1", &cancel).await.unwrap();
        assert_eq!(state.exit_code, 7);
        backend.destroy_step(&failing, "t1", &cancel).await.unwrap();

        backend
            .destroy_workflow(&WorkflowConfig::default(), "t1", &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tail_captures_merged_output() {
        let dir = tempfile::tempdir().unwrap();
        let backend = loaded_backend(dir.path()).await;
        let cancel = CancellationToken::new();

        let step = sh_step("s1", &["echo hi", "echo oops 1>&2"]);
        backend
            .setup_workflow(&WorkflowConfig::default(), "t1", &cancel)
            .await
            .unwrap();
        backend.start_step(&step, "t1", &cancel).await.unwrap();

        let mut tail = backend.tail_step(&step, "t1", &cancel).await.unwrap();
        backend.wait_step(&step, "t1", &cancel).await.unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = tail.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("hi"));
        assert!(text.contains("oops"));

        backend.destroy_step(&step, "t1", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_leaves_destroy_able_process() {
        let dir = tempfile::tempdir().unwrap();
        let backend = loaded_backend(dir.path()).await;
        let cancel = CancellationToken::new();

        let step = sh_step("s1", &["sleep 60"]);
        backend
            .setup_workflow(&WorkflowConfig::default(), "t1", &cancel)
            .await
            .unwrap();
        backend.start_step(&step, "t1", &cancel).await.unwrap();

        let wait_cancel = cancel.child_token();
        let canceller = wait_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = backend
            .wait_step(&step, "t1", &wait_cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        backend.destroy_step(&step, "t1", &cancel).await.unwrap();
        assert!(backend.entry("t1-s1").is_none());
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = loaded_backend(dir.path()).await;
        let cancel = CancellationToken::new();

        let step = sh_step("s1", &["exit 0"]);
        backend
            .setup_workflow(&WorkflowConfig::default(), "t1", &cancel)
            .await
            .unwrap();
        backend.start_step(&step, "t1", &cancel).await.unwrap();
        backend.wait_step(&step, "t1", &cancel).await.unwrap();

        backend.destroy_step(&step, "t1", &cancel).await.unwrap();
        backend.destroy_step(&step, "t1", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn step_without_commands_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = loaded_backend(dir.path()).await;
        let cancel = CancellationToken::new();

        let step = Step::new("s1", "svc", "redis:7");
        let err = backend.start_step(&step, "t1", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Create { .. }));
    }

    #[tokio::test]
    async fn load_then_destroy_workflow_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let backend = loaded_backend(dir.path()).await;
        let cancel = CancellationToken::new();
        backend
            .destroy_workflow(&WorkflowConfig::default(), "t-empty", &cancel)
            .await
            .unwrap();
    }
}
