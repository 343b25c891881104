//! buildline - run declarative CI/CD pipeline definitions
//!
//! ## Commands
//!
//! - `buildline run` - Execute a definition once
//! - `buildline validate` - Check definition files
//! - `buildline resolve` - Show steps with parameters resolved
//! - `buildline completions` - Generate shell completions
//!
//! ## Quick Start
//!
//! ```bash
//! # Check a definition
//! buildline validate trivy.yaml
//!
//! # See what a run would execute
//! buildline resolve trivy.yaml --param DOCKER_TAG=1.0
//!
//! # Run it in the current directory
//! buildline run trivy.yaml --revision "$(git rev-parse HEAD)"
//!
//! # Generate shell completions
//! buildline completions bash > /etc/bash_completion.d/buildline
//! ```

use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    match cli::run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if std::env::var("BUILDLINE_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
