//! Error types and reporting

use crate::interp::RuntimeError;
use crate::ir::OpIndex;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PassError>;

/// Pass error
///
/// The first group are internal invariant violations: they mean the input
/// graph is malformed or the pass has a bug, and they abort the compilation
/// unit. Program-level traps are never errors; they are compiled into the
/// output graph as trap operations.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("Operation {op} has no recorded input type (never visited by the analyzer)")]
    UnvisitedOperation { op: OpIndex },

    #[error("Operation {op} references undefined value {value}")]
    UndefinedValue { op: OpIndex, value: OpIndex },

    #[error("Malformed graph: {message}")]
    MalformedGraph { message: String },

    #[error("Invalid module: {message}")]
    InvalidModule { message: String },

    #[error("IO error: {message}")]
    Io { message: String },

    /// Compilation unit could not be decoded
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Config error: {message}")]
    Config { message: String },

    /// Interpreting a graph failed outright (not a trap)
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
}

impl PassError {
    pub fn unvisited(op: OpIndex) -> Self {
        Self::UnvisitedOperation { op }
    }

    pub fn undefined_value(op: OpIndex, value: OpIndex) -> Self {
        Self::UndefinedValue { op, value }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedGraph {
            message: message.into(),
        }
    }

    pub fn invalid_module(message: impl Into<String>) -> Self {
        Self::InvalidModule {
            message: message.into(),
        }
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for errors that indicate a malformed input or a bug in the pass,
    /// as opposed to problems reading inputs from disk.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::UnvisitedOperation { .. }
                | Self::UndefinedValue { .. }
                | Self::MalformedGraph { .. }
                | Self::InvalidModule { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnvisitedOperation { .. } => "Unvisited",
            Self::UndefinedValue { .. } => "Undefined",
            Self::MalformedGraph { .. } => "Graph",
            Self::InvalidModule { .. } => "Module",
            Self::Io { .. } => "IO",
            Self::Parse { .. } => "Parse",
            Self::Config { .. } => "Config",
            Self::Runtime(_) => "Runtime",
        }
    }
}

impl From<std::io::Error> for PassError {
    fn from(err: std::io::Error) -> Self {
        Self::io_error(err.to_string())
    }
}

impl From<serde_json::Error> for PassError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse_error(err.to_string())
    }
}

impl From<toml::de::Error> for PassError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_error(err.to_string())
    }
}
