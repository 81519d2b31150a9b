//! Error Handling Module
//!
//! Defines the error type shared by the dataset, model, training and inference
//! layers. Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for corn leaf diagnosis operations
#[derive(Error, Debug)]
pub enum DiagnosisError {
    /// Empty or malformed request, rejected before the model is touched
    #[error("Validation error: {0}")]
    Validation(String),

    /// A submitted file declared a content type that is not an image
    #[error("File '{identifier}' is not an image (declared content type '{content_type}')")]
    InvalidInput {
        identifier: String,
        content_type: String,
    },

    /// Submitted bytes could not be decoded into an image
    #[error("Failed to decode image '{identifier}': {reason}")]
    Decode { identifier: String, reason: String },

    /// Checkpoint missing, corrupt, or shaped for a different architecture
    #[error("Failed to load weights: {0}")]
    WeightLoad(String),

    /// Invalid training or service setup (empty loader, missing dataset root, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A directory could not be read
    #[error("Filesystem error at '{path}': {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A dataset sample could not be loaded during training or evaluation
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// The model produced something that is not a valid prediction
    #[error("Inference error: {0}")]
    Inference(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DiagnosisError {
    /// Identifier of the offending upload, for per-image errors
    pub fn identifier(&self) -> Option<&str> {
        match self {
            DiagnosisError::InvalidInput { identifier, .. }
            | DiagnosisError::Decode { identifier, .. } => Some(identifier),
            _ => None,
        }
    }

    /// Whether the error was caused by the caller's request rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DiagnosisError::Validation(_)
                | DiagnosisError::InvalidInput { .. }
                | DiagnosisError::Decode { .. }
        )
    }
}

impl From<serde_json::Error> for DiagnosisError {
    fn from(err: serde_json::Error) -> Self {
        DiagnosisError::Serialization(err.to_string())
    }
}

/// Convenience Result type for corn leaf diagnosis operations
pub type Result<T> = std::result::Result<T, DiagnosisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DiagnosisError::Configuration("training loader is empty".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: training loader is empty"
        );
    }

    #[test]
    fn test_per_image_errors_name_identifier() {
        let err = DiagnosisError::InvalidInput {
            identifier: "notes.txt".to_string(),
            content_type: "text/plain".to_string(),
        };
        assert_eq!(err.identifier(), Some("notes.txt"));
        assert!(err.to_string().contains("notes.txt"));

        let err = DiagnosisError::Decode {
            identifier: "leaf.png".to_string(),
            reason: "unexpected end of file".to_string(),
        };
        assert_eq!(err.identifier(), Some("leaf.png"));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_weight_load_is_not_client_error() {
        let err = DiagnosisError::WeightLoad("missing".to_string());
        assert!(!err.is_client_error());
        assert_eq!(err.identifier(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DiagnosisError = io_err.into();
        assert!(matches!(err, DiagnosisError::Io(_)));
    }
}
