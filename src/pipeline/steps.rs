//! Step types for pipeline execution
//!
//! A step is one unit of work of a fixed kind. The set of kinds is closed:
//! script execution, container command, remote command and build-tool
//! invocation.

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Policy governing whether a step runs after an earlier failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Skipped once a prior normal step has failed
    #[default]
    Normal,
    /// Runs regardless of earlier failures or cancellation
    Always,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Always => write!(f, "always"),
        }
    }
}

/// Kinds of steps available in pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Shell script execution
    Script {
        /// Script body
        content: String,
    },

    /// Container CLI invocation (`build`, `push`, `login`, ...)
    ContainerCommand {
        /// Container CLI subcommand
        subcommand: String,
        /// Arguments, split with shell quoting rules
        #[serde(default)]
        args: String,
    },

    /// Commands executed in a remote session
    RemoteCommand {
        /// Command text sent to the remote shell
        commands: String,
    },

    /// Delegated build-tool invocation
    ToolInvocation {
        /// Tool name (`maven`, `gradle`, `ant`, or a program name)
        tool: String,
        /// Goals, tasks or targets
        #[serde(default)]
        targets: String,
        /// Extra runner arguments
        #[serde(default)]
        args: String,
        /// Directory holding a tool wrapper script
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wrapper_path: Option<String>,
    },
}

impl StepKind {
    /// Creates a script step kind
    pub fn script(content: impl Into<String>) -> Self {
        Self::Script {
            content: content.into(),
        }
    }

    /// Creates a container command step kind
    pub fn container_command(subcommand: impl Into<String>, args: impl Into<String>) -> Self {
        Self::ContainerCommand {
            subcommand: subcommand.into(),
            args: args.into(),
        }
    }

    /// Creates a remote command step kind
    pub fn remote_command(commands: impl Into<String>) -> Self {
        Self::RemoteCommand {
            commands: commands.into(),
        }
    }

    /// Creates a tool invocation step kind
    pub fn tool(tool: impl Into<String>, targets: impl Into<String>) -> Self {
        Self::ToolInvocation {
            tool: tool.into(),
            targets: targets.into(),
            args: String::new(),
            wrapper_path: None,
        }
    }

    /// Short name of the kind
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Script { .. } => "script",
            Self::ContainerCommand { .. } => "container_command",
            Self::RemoteCommand { .. } => "remote_command",
            Self::ToolInvocation { .. } => "tool_invocation",
        }
    }

    /// Rewrites every string of the payload through `f`
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map_strings<E>(
        &self,
        mut f: impl FnMut(&str) -> Result<String, E>,
    ) -> Result<Self, E> {
        Ok(match self {
            Self::Script { content } => Self::Script {
                content: f(content)?,
            },
            Self::ContainerCommand { subcommand, args } => Self::ContainerCommand {
                subcommand: f(subcommand)?,
                args: f(args)?,
            },
            Self::RemoteCommand { commands } => Self::RemoteCommand {
                commands: f(commands)?,
            },
            Self::ToolInvocation {
                tool,
                targets,
                args,
                wrapper_path,
            } => Self::ToolInvocation {
                tool: f(tool)?,
                targets: f(targets)?,
                args: f(args)?,
                wrapper_path: wrapper_path.as_deref().map(&mut f).transpose()?,
            },
        })
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Script { content } => {
                write!(f, "script({} lines)", content.lines().count())
            }
            Self::ContainerCommand { subcommand, .. } => write!(f, "container({subcommand})"),
            Self::RemoteCommand { .. } => write!(f, "remote"),
            Self::ToolInvocation { tool, targets, .. } => write!(f, "{tool}({targets})"),
        }
    }
}

/// Container in which a step payload runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSettings {
    /// Image reference
    pub image: String,

    /// Pull the image before running
    #[serde(default)]
    pub pull: bool,

    /// Image platform (`linux`, `windows`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    /// Extra `run` parameters (volumes, working directory, flags)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_parameters: String,
}

impl ContainerSettings {
    /// Creates container settings for an image
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            pull: false,
            platform: None,
            run_parameters: String::new(),
        }
    }

    /// Requests an image pull before running
    pub fn with_pull(mut self, pull: bool) -> Self {
        self.pull = pull;
        self
    }

    /// Sets extra run parameters
    pub fn with_run_parameters(mut self, params: impl Into<String>) -> Self {
        self.run_parameters = params.into();
        self
    }
}

/// Remote host a step connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    /// Host (optionally `host:port`)
    pub host: String,

    /// Login user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Reference to a credential (key name or path), never the secret itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Side-effect descriptors handed to the runtime integration.
///
/// The core resolves their parameters but does not interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SideEffects {
    /// Container to run in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSettings>,

    /// Remote session target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteTarget>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Working directory relative to the run workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl SideEffects {
    /// Rewrites every string of the descriptors through `f`
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map_strings<E>(
        &self,
        mut f: impl FnMut(&str) -> Result<String, E>,
    ) -> Result<Self, E> {
        let container = match &self.container {
            Some(c) => Some(ContainerSettings {
                image: f(&c.image)?,
                pull: c.pull,
                platform: c.platform.as_deref().map(&mut f).transpose()?,
                run_parameters: f(&c.run_parameters)?,
            }),
            None => None,
        };
        let remote = match &self.remote {
            Some(r) => Some(RemoteTarget {
                host: f(&r.host)?,
                username: r.username.as_deref().map(&mut f).transpose()?,
                credential: r.credential.as_deref().map(&mut f).transpose()?,
            }),
            None => None,
        };
        let mut env = BTreeMap::new();
        for (key, value) in &self.env {
            env.insert(key.clone(), f(value)?);
        }
        Ok(Self {
            container,
            remote,
            env,
            working_dir: self.working_dir.as_deref().map(&mut f).transpose()?,
        })
    }
}

/// A single step in a pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Optional id, unique within a definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Kind of step and its payload
    #[serde(flatten)]
    pub kind: StepKind,

    /// Execution mode
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Optional timeout override for this step, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Side-effect descriptors
    #[serde(flatten)]
    pub side_effects: SideEffects,
}

impl Step {
    /// Creates a new step
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: None,
            name: None,
            kind,
            mode: ExecutionMode::Normal,
            timeout_secs: None,
            side_effects: SideEffects::default(),
        }
    }

    /// Creates a script step
    pub fn script(content: impl Into<String>) -> Self {
        Self::new(StepKind::script(content))
    }

    /// Creates a container command step
    pub fn container_command(subcommand: impl Into<String>, args: impl Into<String>) -> Self {
        Self::new(StepKind::container_command(subcommand, args))
    }

    /// Creates a remote command step against `host`
    pub fn remote_command(host: impl Into<String>, commands: impl Into<String>) -> Self {
        let mut step = Self::new(StepKind::remote_command(commands));
        step.side_effects.remote = Some(RemoteTarget {
            host: host.into(),
            username: None,
            credential: None,
        });
        step
    }

    /// Creates a tool invocation step
    pub fn tool(tool: impl Into<String>, targets: impl Into<String>) -> Self {
        Self::new(StepKind::tool(tool, targets))
    }

    /// Sets the id of the step
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the name of the step
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Marks the step as always-run
    pub fn always(mut self) -> Self {
        self.mode = ExecutionMode::Always;
        self
    }

    /// Sets the timeout for the step
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout_secs = Some(duration.as_secs());
        self
    }

    /// Runs the step inside a container
    pub fn in_container(mut self, container: ContainerSettings) -> Self {
        self.side_effects.container = Some(container);
        self
    }

    /// Adds an environment variable for the step
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.side_effects.env.insert(key.into(), value.into());
        self
    }

    /// Returns the declared timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Best human-readable label: name, then id, then kind
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or_else(|| self.kind.kind_name())
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "Step({}): {} [{}]", name, self.kind, self.mode),
            None => write!(f, "Step: {} [{}]", self.kind, self.mode),
        }
    }
}

/// Reference to a step by position within its definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    /// Zero-based position
    pub ordinal: usize,
    /// Declared id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human-readable label
    pub label: String,
}

impl StepRef {
    /// Builds a reference to `step` at `ordinal`
    pub fn new(ordinal: usize, step: &Step) -> Self {
        Self {
            ordinal,
            id: step.id.clone(),
            label: step.label().to_string(),
        }
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.ordinal, self.label)
    }
}
