use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("`{program} {}` failed (exit status {}): {}", .args.join(" "), .status.map_or_else(|| "unknown".to_string(), |s| s.to_string()), .output.trim())]
    CommandFailed {
        program: String,
        args: Vec<String>,
        status: Option<i32>,
        output: String,
    },

    #[error("failed to execute {program}: {source}")]
    CommandUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("expected exactly one match for '{pattern}', found {matches}")]
    Ambiguous { pattern: String, matches: usize },

    #[error("timed out after {attempts} attempts waiting for removal of {}", .devices.join(", "))]
    RemovalTimeout {
        devices: Vec<String>,
        attempts: u32,
    },

    #[error("invalid connection properties: {0}")]
    InvalidConfig(String),

    #[error("unsupported protocol '{0}': expected 'iscsi', 'rbd' or 'local'")]
    UnsupportedProtocol(String),

    #[error("sysfs entry '{}' does not exist", .0.display())]
    MissingSysfsEntry(PathBuf),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("ceph client error: {0}")]
    Ceph(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ConnectorError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConnectorError::Io {
            path: path.into(),
            source,
        }
    }

    /// Combined tool output for `CommandFailed`, if any.
    pub fn command_output(&self) -> Option<&str> {
        match self {
            ConnectorError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Short error code used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectorError::CommandFailed { .. }
            | ConnectorError::CommandUnavailable { .. }
            | ConnectorError::Task(_) => "tool_failure",
            ConnectorError::Parse { .. } | ConnectorError::Json(_) => "parse_failure",
            ConnectorError::Ambiguous { .. } => "resolution_ambiguous",
            ConnectorError::RemovalTimeout { .. } => "removal_timeout",
            ConnectorError::InvalidConfig(_)
            | ConnectorError::UnsupportedProtocol(_)
            | ConnectorError::Pattern(_) => "configuration_invalid",
            ConnectorError::MissingSysfsEntry(_) | ConnectorError::DeviceNotFound(_) => {
                "device_not_found"
            }
            ConnectorError::Io { .. } => "io_error",
            ConnectorError::Ceph(_) => "ceph_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
