//! Error types for the sopflow core.
//!
//! Uses `thiserror` for public API error types. Expected runtime conditions
//! (wrong status, rejected output, unresolved transitions) are not errors:
//! the executor reports them as failed `OpResult`s. Only compile failures,
//! configuration problems and storage faults surface through these enums.

use std::path::PathBuf;

use crate::workflow::validator::Diagnostic;

/// Errors from compiling, loading and persisting workflows.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Flow failed validation with {} error(s): {}", .errors.len(), summarize(.errors))]
    Validation { errors: Vec<Diagnostic> },

    #[error("Capability hook already registered: {name}")]
    HookAlreadyRegistered { name: String },

    #[error("No flow loaded for workflow '{flow_name}'")]
    FlowNotLoaded { flow_name: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the SQLite-backed state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt stored value in column '{column}': {message}")]
    Corrupt { column: String, message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

fn summarize(errors: &[Diagnostic]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A type alias for results using `WorkflowError`.
pub type Result<T> = std::result::Result<T, WorkflowError>;
