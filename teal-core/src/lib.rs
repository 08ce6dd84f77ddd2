//! Teal core library
//!
//! Request lifecycle for the chromatogram trace service: upload validation,
//! per-request workspaces, the external analyzer runner and workspace
//! retention. The HTTP surface lives in `teal-server`.

pub mod core;
pub mod analysis;

// Re-export commonly used types
pub use self::core::{
    config::{ServiceConfig, ServiceConfigBuilder, DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_MAX_UPLOAD_BYTES},
    errors::{ErrorCategory, TealError, ValidationError},
    models::{
        AnalysisResult, ErrorBody, ErrorTitle, RequestLifecycle, RequestState, SuccessBody,
        UploadRequest, UploadResponse, UploadedFile,
    },
};

pub use self::analysis::{
    file_cleanup::{CleanupReport, RetentionPolicy, WorkspaceJanitor},
    file_security::{secure_filename, TraceSource, UploadValidator},
    input_sanitization::{sanitize_diagnostics, validate_program_path},
    process_isolation::{
        AnalyzerInvocation, InvocationStyle, IsolationConfig, IsolationConfigBuilder,
        ProcessIsolation, ProcessRunner, RunOutcome,
    },
    upload::{error_response, UploadService},
    workspace::RequestWorkspace,
};

/// Result type used throughout the trace service
pub type Result<T> = std::result::Result<T, TealError>;
