//! Error types for nbeval

use thiserror::Error;

/// Main error type for nbeval
#[derive(Error, Debug)]
pub enum NbevalError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Runtime error (starting or polling a task process)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Inter-process lock error
    #[error("Lock error: {0}")]
    Lock(String),

    /// Resource exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for nbeval operations
pub type NbevalResult<T> = Result<T, NbevalError>;

impl From<serde_json::Error> for NbevalError {
    fn from(err: serde_json::Error) -> Self {
        NbevalError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for NbevalError {
    fn from(err: toml::de::Error) -> Self {
        NbevalError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NbevalError::Config("Need at least one CPU or GPU".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Need at least one CPU or GPU"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NbevalError = io_err.into();
        assert!(matches!(err, NbevalError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let err: NbevalError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, NbevalError::Serialization(_)));
    }

    #[test]
    fn test_error_from_toml() {
        let err: NbevalError = toml::from_str::<toml::Value>("a = ")
            .unwrap_err()
            .into();
        assert!(matches!(err, NbevalError::Config(_)));
    }
}
