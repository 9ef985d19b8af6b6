use thiserror::Error;

/// Top-level error type for the atrium system.
///
/// Subsystem crates define their own error types for the failures callers
/// branch on (conflicts, backpressure, timeouts) and wrap `AtriumError` for
/// everything infrastructural, so the `?` operator works across crate
/// boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AtriumError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for AtriumError {
    fn from(err: toml::de::Error) -> Self {
        AtriumError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AtriumError {
    fn from(err: toml::ser::Error) -> Self {
        AtriumError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AtriumError {
    fn from(err: serde_json::Error) -> Self {
        AtriumError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for atrium operations.
pub type Result<T> = std::result::Result<T, AtriumError>;
