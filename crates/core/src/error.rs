use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown failure policy: {0}")]
    UnknownFailurePolicy(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::UnknownFailurePolicy("loose".to_string());
        assert_eq!(error.to_string(), "Unknown failure policy: loose");

        let error = CoreError::Validation("each integration must have a name".to_string());
        assert!(error.to_string().starts_with("Validation error"));
    }
}
