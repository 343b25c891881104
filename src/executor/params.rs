//! Parameter resolution
//!
//! Command text refers to parameters as `%name%`; `%%` is a literal `%`.
//! Names are looked up in three layers with precedence
//! computed > build > environment. Environment variables are addressed as
//! `%env.NAME%`.
//!
//! ```rust
//! use buildline::executor::{ParameterScope, ResolveError};
//!
//! let scope = ParameterScope::new().with_build("build.number", "42");
//! assert_eq!(scope.resolve("img:%build.number%").unwrap(), "img:42");
//! assert!(matches!(
//!     scope.resolve("img:%missing%"),
//!     Err(ResolveError::UnresolvedParameter { .. })
//! ));
//! ```

use ahash::AHashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Maximum nesting of parameter references within one resolution chain
pub const MAX_RESOLUTION_DEPTH: usize = 32;

/// Prefix addressing the process environment layer
pub const ENV_PREFIX: &str = "env.";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%%|%([A-Za-z0-9_][A-Za-z0-9_.\-]*)%").unwrap());

/// Parameter resolution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Name absent from every layer
    #[error("Unresolved parameter '%{name}%'")]
    UnresolvedParameter {
        /// Missing parameter name
        name: String,
    },

    /// Reference chain loops or exceeds the depth bound
    #[error("Cyclic parameter reference: {}", .chain.join(" -> "))]
    CyclicParameter {
        /// Names visited, ending with the repeated one
        chain: Vec<String>,
    },
}

/// Layer a parameter value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterSource {
    /// Values computed for the run (build number, revision, ...)
    Computed,
    /// Declared by the definition or overridden on invocation
    Build,
    /// Process environment
    Environment,
}

impl fmt::Display for ParameterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Computed => write!(f, "computed"),
            Self::Build => write!(f, "build"),
            Self::Environment => write!(f, "environment"),
        }
    }
}

/// Layered, read-only snapshot of parameters for one run
#[derive(Debug, Clone, Default)]
pub struct ParameterScope {
    computed: AHashMap<String, String>,
    build: AHashMap<String, String>,
    environment: AHashMap<String, String>,
}

impl ParameterScope {
    /// Creates an empty scope
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scope whose environment layer is the current process environment
    #[must_use]
    pub fn from_process_env() -> Self {
        Self {
            environment: std::env::vars().collect(),
            ..Self::default()
        }
    }

    /// Adds a computed value
    #[must_use]
    pub fn with_computed(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.computed.insert(name.into(), value.into());
        self
    }

    /// Adds a build parameter
    #[must_use]
    pub fn with_build(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.build.insert(name.into(), value.into());
        self
    }

    /// Adds an environment variable (addressed as `env.NAME`)
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    /// Sets a value in the given layer
    pub fn set(&mut self, source: ParameterSource, name: impl Into<String>, value: impl Into<String>) {
        let layer = match source {
            ParameterSource::Computed => &mut self.computed,
            ParameterSource::Build => &mut self.build,
            ParameterSource::Environment => &mut self.environment,
        };
        layer.insert(name.into(), value.into());
    }

    /// Adds every pair to the build layer
    pub fn extend_build<I, K, V>(&mut self, params: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.build
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
    }

    /// Looks a raw (unresolved) value up by precedence
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<(&str, ParameterSource)> {
        if let Some(value) = self.computed.get(name) {
            return Some((value, ParameterSource::Computed));
        }
        if let Some(value) = self.build.get(name) {
            return Some((value, ParameterSource::Build));
        }
        name.strip_prefix(ENV_PREFIX)
            .and_then(|var| self.environment.get(var))
            .map(|value| (value.as_str(), ParameterSource::Environment))
    }

    /// Resolves every placeholder in `text`
    ///
    /// Pure over the scope snapshot; text without placeholders is returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnresolvedParameter`] for unknown names and
    /// [`ResolveError::CyclicParameter`] when references loop or nest deeper
    /// than [`MAX_RESOLUTION_DEPTH`].
    pub fn resolve(&self, text: &str) -> Result<String, ResolveError> {
        let mut chain = Vec::new();
        self.expand(text, &mut chain)
    }

    /// Resolves every build parameter, sorted by name
    ///
    /// # Errors
    ///
    /// Returns the first resolution error.
    pub fn resolved_build_parameters(&self) -> Result<BTreeMap<String, String>, ResolveError> {
        self.build
            .keys()
            .map(|name| {
                let mut chain = vec![name.clone()];
                let (raw, _) = self
                    .lookup(name)
                    .ok_or_else(|| ResolveError::UnresolvedParameter { name: name.clone() })?;
                Ok((name.clone(), self.expand(raw, &mut chain)?))
            })
            .collect()
    }

    fn expand(&self, text: &str, chain: &mut Vec<String>) -> Result<String, ResolveError> {
        if chain.len() > MAX_RESOLUTION_DEPTH {
            return Err(ResolveError::CyclicParameter {
                chain: chain.clone(),
            });
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            out.push_str(&text[last..whole.start()]);
            last = whole.end();

            let Some(name) = caps.get(1).map(|m| m.as_str()) else {
                out.push('%');
                continue;
            };

            if chain.iter().any(|visited| visited == name) {
                let mut cycle = chain.clone();
                cycle.push(name.to_string());
                return Err(ResolveError::CyclicParameter { chain: cycle });
            }

            let (raw, _) = self
                .lookup(name)
                .ok_or_else(|| ResolveError::UnresolvedParameter {
                    name: name.to_string(),
                })?;

            chain.push(name.to_string());
            let value = self.expand(raw, chain)?;
            chain.pop();
            out.push_str(&value);
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}
