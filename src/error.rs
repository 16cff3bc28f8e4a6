//! Error types for stack synthesis

use thiserror::Error;

/// Main error type for stack synthesis
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or missing input parameters, caught before construction
    #[error("validation error: {0}")]
    Validation(String),

    /// A cross-reference inside the built graph points at nothing
    #[error("reference error: {0}")]
    Reference(String),

    /// Template serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a reference error with the given message
    pub fn reference(msg: impl Into<String>) -> Self {
        Self::Reference(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_carry_their_message() {
        let err = Error::validation("domain must not be empty");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("domain must not be empty"));

        match Error::validation("any message") {
            Error::Validation(msg) => assert_eq!(msg, "any message"),
            _ => panic!("expected Validation variant"),
        }
    }

    #[test]
    fn reference_errors_name_the_dangling_target() {
        let err = Error::reference("Service refers to unknown logical id TaskDefinishion");
        assert!(err.to_string().contains("reference error"));
        assert!(err.to_string().contains("TaskDefinishion"));
    }

    #[test]
    fn constructors_accept_str_and_string() {
        let dynamic = format!("file system id {} is malformed", "xyz");
        assert!(Error::validation(dynamic).to_string().contains("xyz"));
        assert!(Error::serialization("static").to_string().contains("static"));
    }
}
