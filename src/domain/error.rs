use thiserror::Error;

/// Domain-level errors raised while building records and keys
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid attribute value for {0}")]
    InvalidAttribute(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats_correctly() {
        assert_eq!(
            DomainError::MissingField("guid".to_string()).to_string(),
            "Missing required field: guid"
        );
        assert_eq!(
            DomainError::InvalidTimestamp("yesterday".to_string()).to_string(),
            "Invalid timestamp: yesterday"
        );
        assert_eq!(
            DomainError::InvalidAttribute("price".to_string()).to_string(),
            "Invalid attribute value for price"
        );
    }

    #[test]
    fn error_comparison_works() {
        assert_eq!(
            DomainError::MissingField("guid".to_string()),
            DomainError::MissingField("guid".to_string())
        );
        assert_ne!(
            DomainError::MissingField("guid".to_string()),
            DomainError::InvalidTimestamp("guid".to_string())
        );
    }
}
