//! Unified error types for Portolan

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Portolan operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Settings errors
    #[error("Failed to read settings file '{path}': {source}")]
    SettingsRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse settings: {0}")]
    SettingsParse(#[from] toml::de::Error),

    #[error("Settings validation failed: {0}")]
    SettingsValidation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Network configuration errors
    #[error("Cyclic dependency detected involving interface '{0}'")]
    CyclicDependency(String),

    #[error("Interface '{interface}' hit a fatal configuration defect: {message}")]
    Fatal { interface: String, message: String },

    #[error("Interface '{interface}' skipped: dependency '{dependency}' failed")]
    DependencyFailed {
        interface: String,
        dependency: String,
    },

    // Environment errors
    #[error("Environment not usable for {kind} interfaces: {message}")]
    Environment { kind: String, message: String },

    // Kernel/command errors
    #[error("Failed to spawn '{command}': {source}")]
    CommandSpawn { command: String, source: io::Error },

    #[error("Kernel operation '{command}' failed (exit code {exit_code}): {output}")]
    KernelOperation {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Interface '{interface}' step timed out after {secs} seconds")]
    StepTimeout { interface: String, secs: u64 },

    // Pipeline errors
    #[error("Another configuration apply is already in progress")]
    ApplyInProgress,

    #[error("Apply pipeline in invalid state: {0}")]
    Pipeline(String),
}

impl Error {
    /// Creates an environment error for an interface kind.
    pub fn environment(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Environment {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Interface this error is attributed to, if any
    pub fn interface(&self) -> Option<&str> {
        match self {
            Error::Fatal { interface, .. }
            | Error::DependencyFailed { interface, .. }
            | Error::StepTimeout { interface, .. } => Some(interface),
            Error::CyclicDependency(name) => Some(name),
            _ => None,
        }
    }
}

/// Result type alias for Portolan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of an operation whose failure must not fail the caller
///
/// Route and firewall mutations return this instead of `Result` so the
/// failure is visible and loggable but cannot be propagated with `?`.
#[derive(Debug)]
#[must_use = "best-effort outcomes should be logged or explicitly dropped"]
pub enum BestEffort {
    Done,
    Ignored(Error),
}

impl BestEffort {
    pub fn is_done(&self) -> bool {
        matches!(self, BestEffort::Done)
    }

    /// Log an ignored failure at warn level and discard it
    pub fn log(self, what: &str) {
        if let BestEffort::Ignored(e) = self {
            tracing::warn!(operation = what, error = %e, "Ignoring best-effort failure");
        }
    }
}

impl From<Result<()>> for BestEffort {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => BestEffort::Done,
            Err(e) => BestEffort::Ignored(e),
        }
    }
}

/// Serializable error entry returned to API callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Interface the error refers to (absent for pipeline-wide errors)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Offending field, when validation can name one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(interface: &str, field: Option<String>, message: impl Into<String>) -> Self {
        Self {
            interface: Some(interface.to_string()),
            field,
            message: message.into(),
        }
    }
}

impl From<&Error> for ErrorDescriptor {
    fn from(err: &Error) -> Self {
        Self {
            interface: err.interface().map(str::to_string),
            field: None,
            message: err.to_string(),
        }
    }
}

impl From<Error> for ErrorDescriptor {
    fn from(err: Error) -> Self {
        ErrorDescriptor::from(&err)
    }
}
