//! Upload validation, workspaces and analyzer execution

pub mod file_cleanup;
pub mod file_security;
pub mod input_sanitization;
pub mod process_isolation;
pub mod upload;
pub mod workspace;
