use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session id collision for prefix '{prefix}' after {attempts} attempts")]
    IdCollision { prefix: String, attempts: u32 },

    #[error("Workspace creation failed: {0}")]
    WorkspaceCreateFailed(String),

    #[error("Runtime creation failed: {0}")]
    RuntimeCreateFailed(String),

    #[error("Issue unreachable: {0}")]
    IssueUnreachable(String),

    #[error("Plugin not registered: {slot}/{name}")]
    PluginUnavailable { slot: &'static str, name: String },

    #[error("Plugin probe failed: {0}")]
    PluginProbeFailed(String),

    #[error("Plugin action failed: {0}")]
    PluginActionFailed(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Plan validation failed: {0}")]
    PlanValidation(String),

    #[error("Data root {path} belongs to another configuration ({origin})")]
    OriginMismatch { path: PathBuf, origin: String },

    #[error("Invalid duration '{0}' (expected <n>s, <n>m or <n>h)")]
    InvalidDuration(String),

    #[error("Send to session {session_id} timed out after {timeout_secs}s")]
    SendTimeout {
        session_id: String,
        timeout_secs: u64,
    },

    #[error("Metadata parse error in {path}: {message}")]
    MetadataParse { path: PathBuf, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;

/// Wrap a plugin read-only probe failure. Probe failures never abort a poll
/// cycle; the caller preserves the last persisted status and retries next tick.
pub fn probe_err(context: &str, err: impl std::fmt::Display) -> FleetError {
    FleetError::PluginProbeFailed(format!("{}: {}", context, err))
}

/// Wrap a plugin mutating-action failure. The reaction attempt counter has
/// already been incremented when this surfaces, so retry budgets still apply.
pub fn action_err(context: &str, err: impl std::fmt::Display) -> FleetError {
    FleetError::PluginActionFailed(format!("{}: {}", context, err))
}
