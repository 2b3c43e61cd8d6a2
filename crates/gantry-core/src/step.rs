//! Step, workflow and state value types.
//!
//! These are the wire objects the agent consumes from the controller. They
//! are plain values: backends never read configuration from disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Rule governing when an image is fetched before running a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Force a fresh pull.
    Always,
    /// Pull only when the local store lacks the image.
    #[default]
    IfMissing,
    /// Fail with `ImageMissing` if the image is absent.
    Never,
}

/// A bind mount from the host into the step container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// A published port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// CPU and memory limits/requests. Quantities use the orchestrator string
/// form ("500m", "256Mi"); engine backends parse what they can.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
}

/// An immutable unit of work: one command block executed as a single
/// container, task or process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the workflow. Resource names derive from it.
    pub uuid: String,
    pub name: String,
    /// OCI image reference.
    pub image: String,
    /// Ordered shell command strings. Empty means "use the image entrypoint".
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub pull: PullPolicy,
}

impl Step {
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            image: image.into(),
            commands: Vec::new(),
            environment: HashMap::new(),
            working_directory: None,
            user: None,
            privileged: false,
            volumes: Vec::new(),
            networks: Vec::new(),
            ports: Vec::new(),
            resources: Resources::default(),
            pull: PullPolicy::default(),
        }
    }

    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_pull(mut self, pull: PullPolicy) -> Self {
        self.pull = pull;
        self
    }

    /// The single shell line backends hand to `/bin/sh -c`. `None` when the
    /// step runs the image entrypoint.
    pub fn shell_line(&self) -> Option<String> {
        if self.commands.is_empty() {
            None
        } else {
            Some(self.commands.join(" && "))
        }
    }
}

/// A secret injected into step environments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub value: String,
}

/// The context enclosing a set of steps: shared resources provisioned once
/// by `setup_workflow` and torn down by `destroy_workflow`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

/// A parsed workflow as delivered by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub config: WorkflowConfig,
    pub steps: Vec<Step>,
}

/// The terminal observation of a step, produced exactly once per successful
/// `wait_step`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    pub exited: bool,
    /// Defined only when `exited` is true.
    pub exit_code: i32,
    pub oom_killed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl State {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exited: true,
            exit_code,
            oom_killed: false,
            error: None,
        }
    }

    pub fn success(&self) -> bool {
        self.exited && self.exit_code == 0
    }
}
