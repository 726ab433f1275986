use thiserror::Error;

/// Common error types used across the dispatcher.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Id generator error: {0}")]
    IdGen(String),
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_category() {
        let err = AppError::Gateway("sms endpoint returned 502".to_string());
        assert_eq!(err.to_string(), "Gateway error: sms endpoint returned 502");
    }

    #[test]
    fn test_backend_errors_convert() {
        let err: AppError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, AppError::Database(_)));
        assert!(err.to_string().starts_with("Database error: "));
    }
}
