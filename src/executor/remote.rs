//! Remote session runtime over the `ssh` client

use super::traits::{ProcessOutput, RemoteRequest, RemoteRuntime, RunContext, RuntimeError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use url::Url;

/// Configuration for [`SshRuntime`]
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// ssh client binary
    pub program: String,
    /// Directory in which named credentials (key files) are looked up
    pub key_dir: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            key_dir: None,
        }
    }
}

/// Host, port and user extracted from a target string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshDestination {
    /// Login user
    pub user: Option<String>,
    /// Host name or address
    pub host: String,
    /// Port, when not the default
    pub port: Option<u16>,
}

impl SshDestination {
    /// Parses `host`, `host:port`, `user@host` or `ssh://user@host:port`
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidInvocation`] for empty hosts, bad ports
    /// or unparsable URLs.
    pub fn parse(target: &str) -> Result<Self, RuntimeError> {
        let invalid = |reason: &str| RuntimeError::InvalidInvocation(format!("ssh target '{target}': {reason}"));
        let target = target.trim();

        if target.contains("://") {
            let url = Url::parse(target).map_err(|e| invalid(&e.to_string()))?;
            let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
            return Ok(Self {
                user: Some(url.username().to_string()).filter(|u| !u.is_empty()),
                host: host.to_string(),
                port: url.port(),
            });
        }

        let (user, rest) = match target.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, target),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

/// Runs remote commands through the `ssh` client
#[derive(Debug, Clone, Default)]
pub struct SshRuntime {
    config: SshConfig,
}

impl SshRuntime {
    /// Creates a runtime with the given configuration
    #[must_use]
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn key_path(&self, credential: &str) -> PathBuf {
        let path = PathBuf::from(credential);
        match &self.config.key_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    }

    /// Builds the argument vector for `request`: program first
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidInvocation`] if the target cannot be
    /// parsed.
    pub fn command_line(&self, request: &RemoteRequest) -> Result<Vec<String>, RuntimeError> {
        let dest = SshDestination::parse(&request.target.host)?;
        let user = request.target.username.clone().or(dest.user);

        let mut argv = vec![
            self.config.program.clone(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(credential) = &request.target.credential {
            argv.push("-i".to_string());
            argv.push(self.key_path(credential).to_string_lossy().into_owned());
        }
        if let Some(port) = dest.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        argv.push(match user {
            Some(user) => format!("{user}@{}", dest.host),
            None => dest.host,
        });

        let mut script = String::new();
        for (key, value) in &request.env {
            script.push_str(&format!("export {key}={}\n", shell_words::quote(value)));
        }
        script.push_str(&request.commands);
        argv.push(script);
        Ok(argv)
    }
}

#[async_trait]
impl RemoteRuntime for SshRuntime {
    async fn run(
        &self,
        request: &RemoteRequest,
        ctx: &RunContext,
    ) -> Result<ProcessOutput, RuntimeError> {
        let argv = self.command_line(request)?;
        let Some((program, args)) = argv.split_first() else {
            return Err(RuntimeError::InvalidInvocation("empty command".to_string()));
        };

        tracing::debug!(
            run = %ctx.run_id,
            host = %request.target.host,
            "Opening remote session"
        );

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Spawn {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
