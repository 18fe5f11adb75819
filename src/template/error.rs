//! Template error types

use std::fmt;

use crate::config::NodeRole;

/// Errors that can occur while rendering a boot document
#[derive(Debug)]
pub enum TemplateError {
    /// A field the selected role needs was not configured
    MissingField {
        /// Role being rendered
        role: NodeRole,
        /// Missing configuration field
        field: &'static str,
    },
    /// Template rendering failed
    Render(minijinja::Error),
    /// Document section could not be serialized
    Serialization(String),
    /// Compressed document could not be encoded or decoded
    Compression(String),
}

impl TemplateError {
    /// Create a missing field error for a role
    pub fn missing_field(role: NodeRole, field: &'static str) -> Self {
        Self::MissingField { role, field }
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { role, field } => write!(
                f,
                "template error: {} boot document requires {} to be set",
                role, field
            ),
            Self::Render(e) => write!(f, "template render error: {}", e),
            Self::Serialization(msg) => write!(f, "template serialization error: {}", msg),
            Self::Compression(msg) => write!(f, "compression error: {}", msg),
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Render(e) => Some(e),
            _ => None,
        }
    }
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        Self::Render(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_display() {
        let err = TemplateError::missing_field(NodeRole::Edge, "dns_api_key");
        assert_eq!(
            err.to_string(),
            "template error: edge boot document requires dns_api_key to be set"
        );
    }

    #[test]
    fn test_serialization_error_display() {
        let err = TemplateError::Serialization("bad key".to_string());
        assert!(err.to_string().contains("serialization error"));
    }
}
