//! Unified error handling for the runner.

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] ferry_engine::Error),
}

impl AppError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Engine(e) if e.is_schema_error() => 3,
            AppError::Engine(ferry_engine::Error::ConflictUnresolved { .. }) => 4,
            _ => 1,
        }
    }
}

/// Result type alias for the runner.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn exit_codes_by_kind() {
        assert_eq!(AppError::from(ConfigError::Missing("FERRY_SERVER_URL")).exit_code(), 2);
        assert_eq!(
            AppError::from(ferry_engine::Error::TableNotFound("Products".into())).exit_code(),
            3
        );
        assert_eq!(
            AppError::from(ferry_engine::Error::Storage("disk full".into())).exit_code(),
            1
        );
    }
}
