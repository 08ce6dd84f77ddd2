//! Startup configuration for the trace service

use crate::analysis::file_cleanup::RetentionPolicy;
use crate::analysis::input_sanitization::validate_program_path;
use crate::analysis::process_isolation::InvocationStyle;
use crate::core::errors::TealError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum accepted request body (8 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 8 * 1024 * 1024;

/// Extensions accepted for chromatogram uploads
pub const DEFAULT_ALLOWED_EXTENSIONS: [&str; 4] = ["abi", "ab1", "ab!", "ab"];

/// Immutable service configuration, built once at startup and shared by reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Root directory under which request workspaces are sharded
    pub data_root: PathBuf,
    /// Analyzer program, either a bare name resolved through PATH or a path
    pub executable: String,
    /// Argument layout passed to the analyzer
    pub invocation: InvocationStyle,
    /// Case-insensitive allow-list of upload extensions
    pub allowed_extensions: Vec<String>,
    /// Maximum request body size in bytes
    pub max_upload_bytes: usize,
    /// Bundled trace used when the client asks for the sample
    pub sample_trace: PathBuf,
    /// Multipart field carrying the uploaded trace
    pub file_field: String,
    /// Multipart field selecting sample mode
    pub sample_field: String,
    /// Upper bound on one analyzer run; `None` waits forever
    pub analysis_timeout: Option<Duration>,
    /// Number of analyzer processes allowed to run at once
    pub max_concurrent_analyses: usize,
    /// Cap on the stderr excerpt echoed back in error titles
    pub max_diagnostic_bytes: usize,
    /// Workspace retention
    pub retention: RetentionPolicy,
    pub host: String,
    pub port: u16,
    /// Path prefix when running behind a reverse proxy
    pub base_url: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            executable: "tracy".to_string(),
            invocation: InvocationStyle::Basecall,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            sample_trace: PathBuf::from("sample.abi"),
            file_field: "queryFile".to_string(),
            sample_field: "showExample".to_string(),
            analysis_timeout: Some(Duration::from_secs(300)),
            max_concurrent_analyses: default_pool_size(),
            max_diagnostic_bytes: 4096,
            retention: RetentionPolicy::default(),
            host: "0.0.0.0".to_string(),
            port: 3300,
            base_url: String::new(),
        }
    }
}

impl ServiceConfig {
    /// Check the configuration before the server starts accepting requests
    pub fn validate(&self) -> Result<()> {
        if self.allowed_extensions.is_empty() {
            return Err(TealError::Config(
                "at least one upload extension must be allowed".to_string(),
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(TealError::Config(
                "maximum upload size must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_analyses == 0 {
            return Err(TealError::Config(
                "analysis pool needs at least one worker".to_string(),
            ));
        }
        if self.file_field.is_empty() || self.sample_field.is_empty() {
            return Err(TealError::Config("form field names cannot be empty".to_string()));
        }
        if !self.base_url.is_empty() && !self.base_url.starts_with('/') {
            return Err(TealError::Config(format!(
                "base url '{}' must start with '/'",
                self.base_url
            )));
        }
        validate_program_path(&self.executable)?;
        self.validate_retention()
    }

    /// Expired files must never belong to a request that may still be running
    fn validate_retention(&self) -> Result<()> {
        if !self.retention.enabled {
            return Ok(());
        }
        if self.retention.sweep_interval.is_zero() {
            return Err(TealError::Config(
                "retention sweep interval must be greater than zero".to_string(),
            ));
        }
        match self.analysis_timeout {
            None => Err(TealError::Config(
                "retention cannot be enabled while analyses run without a timeout".to_string(),
            )),
            Some(timeout) if self.retention.max_age <= timeout => Err(TealError::Config(format!(
                "retention max age {:?} must exceed the analysis timeout {:?}",
                self.retention.max_age, timeout
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Lower-cased extension allow-list
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.allowed_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .collect()
    }

    /// Base url without a trailing slash, empty when serving from the root
    pub fn route_prefix(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Builder for service configurations
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ServiceConfig::default(),
        }
    }

    pub fn data_root<P: Into<PathBuf>>(mut self, data_root: P) -> Self {
        self.config.data_root = data_root.into();
        self
    }

    pub fn executable<S: Into<String>>(mut self, executable: S) -> Self {
        self.config.executable = executable.into();
        self
    }

    pub fn invocation(mut self, invocation: InvocationStyle) -> Self {
        self.config.invocation = invocation;
        self
    }

    pub fn allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.config.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn sample_trace<P: Into<PathBuf>>(mut self, sample_trace: P) -> Self {
        self.config.sample_trace = sample_trace.into();
        self
    }

    pub fn file_field<S: Into<String>>(mut self, file_field: S) -> Self {
        self.config.file_field = file_field.into();
        self
    }

    pub fn sample_field<S: Into<String>>(mut self, sample_field: S) -> Self {
        self.config.sample_field = sample_field.into();
        self
    }

    pub fn analysis_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.analysis_timeout = timeout;
        self
    }

    pub fn max_concurrent_analyses(mut self, workers: usize) -> Self {
        self.config.max_concurrent_analyses = workers;
        self
    }

    pub fn max_diagnostic_bytes(mut self, max_bytes: usize) -> Self {
        self.config.max_diagnostic_bytes = max_bytes;
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.config
    }
}

impl Default for ServiceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
