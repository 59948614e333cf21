use crate::SafeDisplay;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Internal repository error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        RepoError::Internal(error.to_string())
    }
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        // Raw DB errors can leak connection details, so they stay out of
        // user-facing output.
        match self {
            RepoError::Internal(_) => "Internal repository error".to_string(),
        }
    }
}
