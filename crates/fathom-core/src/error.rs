use thiserror::Error;

/// Top-level error type for the Fathom system.
///
/// Subsystem crates define their own error types and implement
/// `From<FathomError>` so that the `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FathomError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid tuning for {field}: {reason}")]
    InvalidTuning { field: String, reason: String },
}

impl From<toml::de::Error> for FathomError {
    fn from(err: toml::de::Error) -> Self {
        FathomError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for FathomError {
    fn from(err: toml::ser::Error) -> Self {
        FathomError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for FathomError {
    fn from(err: serde_json::Error) -> Self {
        FathomError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Fathom operations.
pub type Result<T> = std::result::Result<T, FathomError>;
