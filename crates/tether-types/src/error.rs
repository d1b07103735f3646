use thiserror::Error;

/// Errors from repository operations (used by trait definitions in tether-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("secret encryption error")]
    Encryption,
}

/// Errors raised when a loaded configuration is unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid public base url '{0}': must start with http:// or https://")]
    InvalidBaseUrl(String),

    #[error("invalid port: {0}")]
    InvalidPort(u16),

    #[error("provider '{0}' is configured more than once")]
    DuplicateProvider(String),

    #[error("http provider '{0}' needs an api_base")]
    MissingApiBase(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidBaseUrl("ftp://x".to_string());
        assert!(err.to_string().contains("ftp://x"));
    }
}
