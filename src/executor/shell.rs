//! Local process runtime
//!
//! Runs scripts through a shell, programs directly, and container CLI
//! subcommands through the configured CLI (`docker` or `podman`). When a
//! step declares a container, the invocation is wrapped in
//! `<cli> run --rm --name buildline-<run>-<ordinal>` with the run workspace
//! mounted at the same path. A timed out step's container is removed by name.

use super::traits::{
    Invocation, ProcessOutput, ProcessRequest, ProcessRuntime, RunContext, RuntimeError,
};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Shell execution configuration
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Shell used for scripts (default: sh)
    pub shell: String,

    /// Container CLI (default: docker)
    pub container_cli: String,

    /// Echo captured output to the terminal
    pub echo_output: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            container_cli: "docker".to_string(),
            echo_output: false,
        }
    }
}

/// Runs commands on the host
#[derive(Debug, Clone, Default)]
pub struct LocalRuntime {
    config: ShellConfig,
}

impl LocalRuntime {
    /// Creates a runtime with the given configuration
    #[must_use]
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration
    #[must_use]
    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Name given to the container wrapping `request`
    #[must_use]
    pub fn container_name(request: &ProcessRequest, ctx: &RunContext) -> String {
        format!("buildline-{}-{}", ctx.run_id.simple(), request.ordinal)
    }

    /// Builds the argument vector for `request`: program first
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidInvocation`] if container run
    /// parameters cannot be split.
    pub fn command_line(
        &self,
        request: &ProcessRequest,
        ctx: &RunContext,
    ) -> Result<Vec<String>, RuntimeError> {
        let inner: Vec<String> = match &request.invocation {
            Invocation::Script { content } => {
                vec![self.config.shell.clone(), "-c".to_string(), content.clone()]
            }
            Invocation::Program { program, args } => {
                std::iter::once(program.clone()).chain(args.iter().cloned()).collect()
            }
            Invocation::ContainerCli { args } => {
                return Ok(std::iter::once(self.config.container_cli.clone())
                    .chain(args.iter().cloned())
                    .collect());
            }
        };

        let Some(container) = &request.container else {
            return Ok(inner);
        };

        let workspace = ctx.workspace.to_string_lossy().into_owned();
        let mut argv = vec![
            self.config.container_cli.clone(),
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            Self::container_name(request, ctx),
        ];
        if container.pull {
            argv.push("--pull=always".to_string());
        }
        if let Some(platform) = &container.platform {
            argv.push(format!("--platform={platform}"));
        }
        argv.push("-v".to_string());
        argv.push(format!("{workspace}:{workspace}"));
        argv.push("-w".to_string());
        argv.push(request.cwd.to_string_lossy().into_owned());
        for (key, value) in &request.env {
            argv.push("-e".to_string());
            argv.push(format!("{key}={value}"));
        }
        let extra = shell_words::split(&container.run_parameters).map_err(|e| {
            RuntimeError::InvalidInvocation(format!("container run parameters: {e}"))
        })?;
        argv.extend(extra);
        argv.push(container.image.clone());
        argv.extend(inner);
        Ok(argv)
    }
}

#[async_trait]
impl ProcessRuntime for LocalRuntime {
    async fn run(
        &self,
        request: &ProcessRequest,
        ctx: &RunContext,
    ) -> Result<ProcessOutput, RuntimeError> {
        let argv = self.command_line(request, ctx)?;
        let Some((program, args)) = argv.split_first() else {
            return Err(RuntimeError::InvalidInvocation("empty command".to_string()));
        };

        tracing::debug!(
            run = %ctx.run_id,
            program = %program,
            args = args.len(),
            cwd = %request.cwd.display(),
            "Spawning process"
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.cwd)
            .envs(&request.env)
            .env("BUILDLINE_RUN_NUMBER", ctx.number.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| RuntimeError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if self.config.echo_output {
            if !stdout.is_empty() {
                print!("{stdout}");
            }
            if !stderr.is_empty() {
                eprint!("{stderr}");
            }
        }

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn abandon(&self, request: &ProcessRequest, ctx: &RunContext) {
        if request.container.is_none()
            || matches!(request.invocation, Invocation::ContainerCli { .. })
        {
            return;
        }
        let name = Self::container_name(request, ctx);
        tracing::warn!(
            run = %ctx.run_id,
            container = %name,
            "Removing container of timed out step"
        );
        let removed = Command::new(&self.config.container_cli)
            .args(["rm", "-f", name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        match removed {
            Ok(out) if out.status.success() => {}
            Ok(out) => tracing::warn!(
                container = %name,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "Container removal failed"
            ),
            Err(e) => tracing::warn!(container = %name, error = %e, "Container removal failed"),
        }
    }
}
