//! Command line front end
//!
//! - `run`: execute a definition once
//! - `validate`: check definition files
//! - `resolve`: show steps with parameters resolved
//! - `completions`: generate shell completions

pub mod completions;
pub mod resolve;
pub mod run;
pub mod validate;

use anyhow::{Context, Result};
use buildline::artifacts::{FsArtifactStore, HttpArtifactStore};
use buildline::executor::{Executor, LocalRuntime, SshRuntime};
use buildline::infrastructure::{Config, init_logging};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// CLI arguments for buildline
#[derive(Parser, Debug)]
#[command(name = "buildline")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a pipeline definition once
    Run {
        /// Definition file (.yaml, .yml or .json)
        file: PathBuf,
        /// Workspace directory (defaults to the current directory)
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// Parameter override, repeatable
        #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        /// Revision being built
        #[arg(short, long)]
        revision: Option<String>,
        /// Print the finished run as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate definition files
    Validate {
        /// Definition files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show a definition with every parameter resolved
    Resolve {
        /// Definition file
        file: PathBuf,
        /// Parameter override, repeatable
        #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        /// Revision to resolve against
        #[arg(short, long)]
        revision: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: ShellArg,
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ShellArg {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

/// Parses `KEY=VALUE`
pub(crate) fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty parameter name in '{s}'"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };
    Ok(config.with_env_overrides())
}

/// Builds an executor from configuration
pub(crate) fn build_executor(config: &Config) -> Result<Executor> {
    let executor = Executor::new(
        Arc::new(LocalRuntime::new(config.shell_config())),
        Arc::new(SshRuntime::new(config.ssh_config())),
    )
    .with_config(config.executor_config());

    Ok(match &config.artifact_endpoint {
        Some(endpoint) => {
            let url = Url::parse(endpoint)
                .with_context(|| format!("Invalid artifact endpoint: {endpoint}"))?;
            executor.with_store(Arc::new(HttpArtifactStore::new(url)))
        }
        None => executor.with_store(Arc::new(FsArtifactStore::new(&config.artifact_dir))),
    })
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to determine current directory")
}

/// Parse and execute CLI arguments
///
/// Returns `Ok(false)` when the command ran but did not succeed.
pub fn run() -> Result<bool> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    init_logging(&config.log_level);

    match args.command {
        Command::Run {
            file,
            workspace,
            params,
            revision,
            json,
        } => {
            let workspace = match workspace {
                Some(dir) => dir,
                None => current_dir()?,
            };
            let executor = build_executor(&config)?;
            let options = run::RunOptions {
                overrides: params.into_iter().collect(),
                revision,
                json,
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(run::run_pipeline(&executor, &file, &workspace, options))
        }
        Command::Validate { files } => validate::validate_files(&files),
        Command::Resolve {
            file,
            params,
            revision,
        } => {
            let executor = build_executor(&config)?;
            let overrides: BTreeMap<String, String> = params.into_iter().collect();
            resolve::resolve_pipeline(&executor, &file, &current_dir()?, &overrides, revision)?;
            Ok(true)
        }
        Command::Completions { shell, output } => {
            use clap_complete::Shell;

            let shell_enum = match shell {
                ShellArg::Bash => Shell::Bash,
                ShellArg::Zsh => Shell::Zsh,
                ShellArg::Fish => Shell::Fish,
                ShellArg::PowerShell => Shell::PowerShell,
            };

            let completions = completions::generate_completions(shell_enum)?;

            if let Some(output_path) = output {
                completions::save_completions(&completions, &output_path)?;
            } else {
                println!("{completions}");
            }
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("DOCKER_TAG=1.2=3").unwrap(),
            ("DOCKER_TAG".to_string(), "1.2=3".to_string())
        );
        assert_eq!(
            parse_key_val("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_args_parse_run() {
        let args = Args::try_parse_from([
            "buildline",
            "run",
            "pipeline.yaml",
            "--param",
            "A=1",
            "-p",
            "B=2",
            "--revision",
            "abc",
            "--json",
        ])
        .unwrap();
        let Command::Run {
            params,
            revision,
            json,
            ..
        } = args.command
        else {
            panic!("expected run");
        };
        assert_eq!(params.len(), 2);
        assert_eq!(revision.as_deref(), Some("abc"));
        assert!(json);
    }

    #[test]
    fn test_validate_requires_files() {
        assert!(Args::try_parse_from(["buildline", "validate"]).is_err());
    }

    #[test]
    fn test_build_executor_rejects_bad_endpoint() {
        let config = Config {
            artifact_endpoint: Some("not a url".to_string()),
            ..Config::default()
        };
        assert!(build_executor(&config).is_err());
    }
}
