use std::path::PathBuf;

use thiserror::Error;

/// Lifecycle failures for a single operator activation.
///
/// Every variant is recoverable at the request level: the operator is
/// destroyed and the caller receives an `error` response.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("failed to init tasker: {0}")]
    EngineInit(String),
    #[error("failed to load resource: {0}")]
    ResourceLoad(String),
    #[error("failed to init controller: {0}")]
    ControllerInit(String),
    #[error("failed to connect device: {0}")]
    Connect(String),
    #[error("operator {id} cannot {op} while {state}")]
    InvalidState {
        id: String,
        op: &'static str,
        state: crate::operator::OperatorState,
    },
    #[error("invalid param for task {entry}: {source}")]
    TaskParam {
        entry: String,
        #[source]
        source: serde_json::Error,
    },
}

impl OperatorError {
    /// Text sent back to clients when activation fails at this stage.
    pub fn client_message(&self) -> &'static str {
        match self {
            OperatorError::EngineInit(_) => "Failed to init tasker.",
            OperatorError::ResourceLoad(_) => "Failed to init resource.",
            OperatorError::ControllerInit(_) => "Failed to init controller.",
            OperatorError::Connect(_) => "Failed to connect device.",
            OperatorError::InvalidState { .. } => "Operator is in an invalid state.",
            OperatorError::TaskParam { .. } => "Invalid task param.",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    Validation(&'static str),
}

impl ProtocolError {
    pub fn client_message(&self) -> &'static str {
        match self {
            ProtocolError::Decode(_) => crate::controller::MSG_DECODE_FAILED,
            ProtocolError::Validation(reason) => *reason,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),
    #[error("tasker entry #{0} has an empty id")]
    EmptyId(usize),
    #[error("duplicate tasker id `{0}`")]
    DuplicateId(String),
    #[error("no tasker matches `{0}`")]
    UnknownTasker(String),
    #[error("no taskers configured")]
    NoTaskers,
    #[error("unable to locate executable directory: {0}")]
    ExecutableDir(#[source] std::io::Error),
}

/// Failures reported by an automation engine binding.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine refused to create {0}")]
    Refused(&'static str),
    #[error("window `{name}` ({class}) not found")]
    WindowNotFound { name: String, class: String },
    #[error("unknown {kind} method `{value}`")]
    UnknownMethod { kind: &'static str, value: String },
    #[error("engine io failure: {0}")]
    Io(#[from] std::io::Error),
}
