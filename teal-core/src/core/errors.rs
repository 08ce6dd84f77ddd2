//! Error types for the trace service

use crate::core::models::{ErrorBody, ErrorTitle};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Reasons an upload is rejected before anything touches the filesystem
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no file part in the request")]
    MissingFile,

    #[error("file part has an empty filename")]
    MissingFileName,

    #[error("file '{filename}' has a disallowed extension")]
    DisallowedExtension { filename: String },
}

#[derive(Error, Debug)]
pub enum TealError {
    #[error("Invalid upload: {0}")]
    Validation(#[from] ValidationError),

    #[error("Malformed multipart request: {0}")]
    MalformedUpload(String),

    #[error("Upload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Analyzer exited with {exit_code:?}")]
    Execution { exit_code: Option<i32>, stderr: String },

    #[error("Analyzer timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Analyzer output {path} unusable: {reason}")]
    Artifact { path: PathBuf, reason: String },

    #[error("Storage failure at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Sample trace {path} is not available")]
    SampleUnavailable { path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error categories used for status mapping and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Validation,
    Execution,
    Artifact,
    Storage,
    Config,
    Internal,
}

impl TealError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TealError::Storage {
            path: path.into(),
            source,
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TealError::Artifact {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TealError::Validation(_)
            | TealError::MalformedUpload(_)
            | TealError::PayloadTooLarge { .. } => ErrorCategory::Validation,
            TealError::Execution { .. } | TealError::Timeout { .. } | TealError::Launch { .. } => {
                ErrorCategory::Execution
            }
            TealError::Artifact { .. } => ErrorCategory::Artifact,
            TealError::Storage { .. } | TealError::SampleUnavailable { .. } => {
                ErrorCategory::Storage
            }
            TealError::Config(_) => ErrorCategory::Config,
            TealError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// HTTP status reported to the caller
    pub fn status_code(&self) -> u16 {
        match self {
            TealError::Validation(_) | TealError::MalformedUpload(_) => 400,
            TealError::PayloadTooLarge { .. } => 413,
            // A trace the analyzer refuses is treated as a bad upload
            TealError::Execution { .. } => 400,
            _ => 500,
        }
    }

    /// Human-readable title placed in the error envelope
    pub fn title(&self) -> String {
        match self {
            TealError::Validation(ValidationError::MissingFile) => {
                "Chromatogram file is missing!".to_string()
            }
            TealError::Validation(ValidationError::MissingFileName) => {
                "Chromatogram file name is missing!".to_string()
            }
            TealError::Validation(ValidationError::DisallowedExtension { .. }) => {
                "Chromatogram file has incorrect file type!".to_string()
            }
            TealError::MalformedUpload(_) => "Error in handling POST request!".to_string(),
            TealError::PayloadTooLarge { .. } => {
                "Chromatogram file exceeds the maximum upload size!".to_string()
            }
            TealError::Execution { stderr, .. } => {
                if stderr.is_empty() {
                    "Error in running teal!".to_string()
                } else {
                    format!("Error in running teal: {}", stderr)
                }
            }
            TealError::Timeout { after } => {
                format!("Error in running teal: analysis timed out after {:?}!", after)
            }
            TealError::Launch { .. } => "Unable to start the trace analyzer!".to_string(),
            TealError::Artifact { .. } => "Analysis output is missing or invalid!".to_string(),
            TealError::Storage { .. } => "Unable to store chromatogram file!".to_string(),
            TealError::SampleUnavailable { .. } => {
                "Sample chromatogram is not available!".to_string()
            }
            TealError::Config(_) => "Service is misconfigured!".to_string(),
            TealError::Internal(_) => "Internal server error!".to_string(),
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            errors: vec![ErrorTitle {
                title: self.title(),
            }],
        }
    }

    /// Emit a structured log event; client mistakes at warn, server faults at error
    pub fn log(&self) {
        let category = self.category();
        let status = self.status_code();
        if status < 500 {
            warn!(?category, status, error = %self, "Request rejected");
        } else {
            error!(?category, status, error = %self, "Request failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_titles_and_status() {
        let missing = TealError::from(ValidationError::MissingFile);
        assert_eq!(missing.status_code(), 400);
        assert_eq!(missing.title(), "Chromatogram file is missing!");

        let wrong_type = TealError::from(ValidationError::DisallowedExtension {
            filename: "trace.txt".to_string(),
        });
        assert_eq!(wrong_type.category(), ErrorCategory::Validation);
        assert_eq!(wrong_type.title(), "Chromatogram file has incorrect file type!");
    }

    #[test]
    fn test_execution_title_includes_stderr() {
        let err = TealError::Execution {
            exit_code: Some(1),
            stderr: "Unknown trace format".to_string(),
        };
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.title(), "Error in running teal: Unknown trace format");

        let quiet = TealError::Execution {
            exit_code: Some(2),
            stderr: String::new(),
        };
        assert_eq!(quiet.title(), "Error in running teal!");
    }

    #[test]
    fn test_server_side_errors_are_500() {
        let artifact = TealError::artifact("/data/ab/teal_x.json", "missing");
        assert_eq!(artifact.status_code(), 500);
        assert_eq!(artifact.category(), ErrorCategory::Artifact);

        let storage = TealError::storage(
            "/data/ab",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(storage.status_code(), 500);

        let timeout = TealError::Timeout {
            after: Duration::from_secs(30),
        };
        assert_eq!(timeout.status_code(), 500);
        assert!(timeout.title().contains("30s"));

        let short = TealError::Timeout {
            after: Duration::from_millis(250),
        };
        assert_eq!(
            short.title(),
            "Error in running teal: analysis timed out after 250ms!"
        );
    }

    #[test]
    fn test_error_body_shape() {
        let body = TealError::from(ValidationError::MissingFileName).to_error_body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"errors": [{"title": "Chromatogram file name is missing!"}]})
        );
    }
}
