//! Error types for the OPC UA / AAS bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("mapping error: {0}")]
    Mapping(String),

    #[error("type conversion error: cannot convert {value} from {source_type} to {target_type}")]
    TypeConversion {
        source_type: String,
        target_type: String,
        value: String,
    },

    #[error("validation error: field {field} = {value} violates constraint {constraint}")]
    Validation {
        field: String,
        value: String,
        constraint: String,
    },

    #[error("security error: {0}")]
    Security(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("conflict on {element_id}: aas={aas_value} opcua={opcua_value}")]
    Conflict {
        element_id: String,
        aas_value: String,
        opcua_value: String,
    },

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Transient failures that a caller may retry (connection/network class).
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Connection(_) | BridgeError::Http(_))
    }

    /// Configuration/startup failures that should never be retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Security(_) | BridgeError::Config(_) | BridgeError::Configuration(_)
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::Connection(_) | BridgeError::Http(_) => ErrorCategory::Network,
            BridgeError::Mapping(_) => ErrorCategory::Mapping,
            BridgeError::TypeConversion { .. } => ErrorCategory::TypeConversion,
            BridgeError::Validation { .. } => ErrorCategory::Validation,
            BridgeError::Security(_) => ErrorCategory::Security,
            BridgeError::Sync(_) => ErrorCategory::Sync,
            BridgeError::Conflict { .. } => ErrorCategory::Conflict,
            BridgeError::Config(_) | BridgeError::Configuration(_) => ErrorCategory::Config,
            BridgeError::Io(_) => ErrorCategory::Io,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Mapping,
    TypeConversion,
    Validation,
    Security,
    Sync,
    Conflict,
    Config,
    Io,
}

pub type BridgeResult<T> = Result<T, BridgeError>;
