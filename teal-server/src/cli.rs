//! Command-line and environment configuration

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use teal_core::{
    InvocationStyle, RetentionPolicy, ServiceConfig, ServiceConfigBuilder,
    DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_MAX_UPLOAD_BYTES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InvocationArg {
    /// `<exe> basecall -o <out.json> <trace>`
    Basecall,
    /// `<exe> <trace> <out.json>`
    Positional,
    /// `<exe> <trace> <out.json> <out.tsv>`
    PositionalTsv,
}

impl From<InvocationArg> for InvocationStyle {
    fn from(arg: InvocationArg) -> Self {
        match arg {
            InvocationArg::Basecall => InvocationStyle::Basecall,
            InvocationArg::Positional => InvocationStyle::Positional { with_tsv: false },
            InvocationArg::PositionalTsv => InvocationStyle::Positional { with_tsv: true },
        }
    }
}

/// Settings shared by the server and one-off analysis runs
#[derive(Debug, Clone, Args)]
pub struct AnalyzerArgs {
    /// Directory holding per-request workspaces
    #[arg(long, env = "TEAL_DATA_ROOT", default_value = "data")]
    pub data_root: PathBuf,

    /// Trace analyzer executable
    #[arg(long, env = "TEAL_EXECUTABLE", default_value = "tracy")]
    pub executable: String,

    /// Argument layout expected by the analyzer
    #[arg(long, env = "TEAL_INVOCATION", value_enum, default_value = "basecall")]
    pub invocation: InvocationArg,

    /// Accepted upload extensions (comma separated, case-insensitive)
    #[arg(
        long,
        env = "TEAL_ALLOWED_EXTENSIONS",
        value_delimiter = ',',
        default_values_t = DEFAULT_ALLOWED_EXTENSIONS.map(String::from)
    )]
    pub allowed_extensions: Vec<String>,

    /// Bundled trace used for sample requests
    #[arg(long, env = "TEAL_SAMPLE_TRACE", default_value = "sample.abi")]
    pub sample_trace: PathBuf,

    /// Seconds before a running analyzer is killed (0 waits forever)
    #[arg(long, env = "TEAL_TIMEOUT_SECS", default_value_t = 300)]
    pub timeout_secs: u64,

    /// Analyzer processes allowed at once (defaults to CPU count)
    #[arg(long, env = "TEAL_WORKERS")]
    pub workers: Option<usize>,

    /// Bytes of analyzer stderr echoed back in error responses
    #[arg(long, env = "TEAL_MAX_DIAGNOSTIC_BYTES", default_value_t = 4096)]
    pub max_diagnostic_bytes: usize,
}

impl AnalyzerArgs {
    fn apply(&self, builder: ServiceConfigBuilder) -> ServiceConfigBuilder {
        let timeout = (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs));
        let builder = builder
            .data_root(&self.data_root)
            .executable(&self.executable)
            .invocation(self.invocation.into())
            .allowed_extensions(self.allowed_extensions.iter().map(|ext| ext.trim().to_string()))
            .sample_trace(&self.sample_trace)
            .analysis_timeout(timeout)
            .max_diagnostic_bytes(self.max_diagnostic_bytes);

        match self.workers {
            Some(workers) => builder.max_concurrent_analyses(workers),
            None => builder,
        }
    }

    /// One-off runs never start the janitor
    pub fn into_config(&self) -> ServiceConfig {
        self.apply(ServiceConfigBuilder::new())
            .retention(RetentionPolicy::disabled())
            .build()
    }
}

/// Settings for the HTTP server
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub analyzer: AnalyzerArgs,

    /// Address to bind
    #[arg(long, env = "TEAL_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind
    #[arg(short, long, env = "TEAL_PORT", default_value_t = 3300)]
    pub port: u16,

    /// Path prefix when served behind a reverse proxy, e.g. /teal
    #[arg(long, env = "TEAL_BASE_URL", default_value = "")]
    pub base_url: String,

    /// Maximum request body in bytes
    #[arg(long, env = "TEAL_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    /// Multipart field carrying the trace
    #[arg(long, env = "TEAL_FILE_FIELD", default_value = "queryFile")]
    pub file_field: String,

    /// Multipart field selecting the bundled sample
    #[arg(long, env = "TEAL_SAMPLE_FIELD", default_value = "showExample")]
    pub sample_field: String,

    /// Hours request files are kept (0 disables cleanup)
    #[arg(long, env = "TEAL_RETENTION_HOURS", default_value_t = 24)]
    pub retention_hours: u64,

    /// Minutes between cleanup sweeps
    #[arg(long, env = "TEAL_SWEEP_MINUTES", default_value_t = 60)]
    pub sweep_minutes: u64,
}

impl ServeArgs {
    pub fn into_config(&self) -> ServiceConfig {
        let retention = if self.retention_hours == 0 {
            RetentionPolicy::disabled()
        } else {
            RetentionPolicy {
                max_age: Duration::from_secs(self.retention_hours * 60 * 60),
                sweep_interval: Duration::from_secs(self.sweep_minutes.max(1) * 60),
                enabled: true,
            }
        };

        self.analyzer
            .apply(ServiceConfigBuilder::new())
            .host(&self.host)
            .port(self.port)
            .base_url(&self.base_url)
            .max_upload_bytes(self.max_upload_bytes)
            .file_field(&self.file_field)
            .sample_field(&self.sample_field)
            .retention(retention)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn test_defaults_match_service_defaults() {
        let cli = TestCli::parse_from(["teal-server"]);
        let config = cli.serve.into_config();
        let defaults = ServiceConfig::default();

        assert_eq!(config.executable, defaults.executable);
        assert_eq!(config.invocation, InvocationStyle::Basecall);
        assert_eq!(config.allowed_extensions, defaults.allowed_extensions);
        assert_eq!(config.max_upload_bytes, 8 * 1024 * 1024);
        assert_eq!(config.port, 3300);
        assert_eq!(config.analysis_timeout, Some(Duration::from_secs(300)));
        assert!(config.retention.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let cli = TestCli::parse_from([
            "teal-server",
            "--executable",
            "/opt/teal/src/teal",
            "--invocation",
            "positional-tsv",
            "--allowed-extensions",
            "ab1",
            "--timeout-secs",
            "0",
            "--workers",
            "2",
            "--base-url",
            "/teal",
            "--retention-hours",
            "0",
        ]);
        let config = cli.serve.into_config();

        assert_eq!(config.invocation, InvocationStyle::Positional { with_tsv: true });
        assert_eq!(config.allowed_extensions, vec!["ab1".to_string()]);
        assert_eq!(config.analysis_timeout, None);
        assert_eq!(config.max_concurrent_analyses, 2);
        assert_eq!(config.base_url, "/teal");
        assert!(!config.retention.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unbounded_analyses_require_retention_off() {
        let cli = TestCli::parse_from(["teal-server", "--timeout-secs", "0"]);
        assert!(cli.serve.into_config().validate().is_err());

        let oneoff = cli.serve.analyzer.into_config();
        assert!(!oneoff.retention.enabled);
        assert!(oneoff.validate().is_ok());
    }
}
