//! Process isolation for running the external trace analyzer

use crate::analysis::workspace::RequestWorkspace;
use crate::core::config::ServiceConfig;
use crate::core::errors::TealError;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::process::Command as TokioCommand;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Loader variables never passed through to the analyzer
const STRIPPED_ENV_VARS: [&str; 3] = ["LD_PRELOAD", "DYLD_INSERT_LIBRARIES", "DYLD_LIBRARY_PATH"];

/// Argument layout understood by the analyzer binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStyle {
    /// `<exe> <input> <output.json> [<output.tsv>]`
    Positional { with_tsv: bool },
    /// `<exe> basecall -o <output.json> <input>`
    Basecall,
}

impl InvocationStyle {
    pub fn arguments(&self, input: &Path, workspace: &RequestWorkspace) -> Vec<OsString> {
        match self {
            InvocationStyle::Positional { with_tsv } => {
                let mut args = vec![
                    input.as_os_str().to_owned(),
                    workspace.output_json().into_os_string(),
                ];
                if *with_tsv {
                    args.push(workspace.output_tsv().into_os_string());
                }
                args
            }
            InvocationStyle::Basecall => vec![
                OsString::from("basecall"),
                OsString::from("-o"),
                workspace.output_json().into_os_string(),
                input.as_os_str().to_owned(),
            ],
        }
    }
}

/// One analyzer call with its log destinations
#[derive(Debug, Clone)]
pub struct AnalyzerInvocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

impl AnalyzerInvocation {
    pub fn for_workspace(config: &ServiceConfig, input: &Path, workspace: &RequestWorkspace) -> Self {
        Self {
            program: config.executable.clone(),
            args: config.invocation.arguments(input, workspace),
            stdout_log: workspace.stdout_log(),
            stderr_log: workspace.stderr_log(),
        }
    }
}

/// Result of one analyzer run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// `None` when the process was killed by a signal or the timeout
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs an analyzer invocation to completion
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, invocation: &AnalyzerInvocation) -> Result<RunOutcome>;
}

/// Configuration for process isolation
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    /// Maximum execution time; `None` waits for the process indefinitely
    pub timeout: Option<Duration>,
    /// Number of analyzer processes allowed to run at once
    pub max_concurrent: usize,
    /// Working directory for the process, inherited when unset
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env_vars: HashMap<String, String>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(300)),
            max_concurrent: 4,
            working_dir: None,
            env_vars: HashMap::new(),
        }
    }
}

impl IsolationConfig {
    pub fn from_service_config(config: &ServiceConfig) -> Self {
        Self {
            timeout: config.analysis_timeout,
            max_concurrent: config.max_concurrent_analyses.max(1),
            ..Self::default()
        }
    }
}

/// Subprocess runner bounded by a worker pool and an optional timeout
///
/// Callers beyond `max_concurrent` wait for a permit before their process is
/// spawned, so the pool size is the service's analysis capacity.
pub struct ProcessIsolation {
    config: IsolationConfig,
    permits: Arc<Semaphore>,
}

impl ProcessIsolation {
    pub fn new() -> Self {
        Self::with_config(IsolationConfig::default())
    }

    pub fn with_config(config: IsolationConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { config, permits }
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    /// Free worker slots right now
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn configure_command(&self, cmd: &mut TokioCommand) {
        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for var in &STRIPPED_ENV_VARS {
            cmd.env_remove(var);
        }
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
    }
}

impl Default for ProcessIsolation {
    fn default() -> Self {
        Self::new()
    }
}

async fn create_log(path: &Path) -> Result<std::fs::File> {
    let file = File::create(path)
        .await
        .map_err(|e| TealError::storage(path, e))?;
    Ok(file.into_std().await)
}

#[async_trait]
impl ProcessRunner for ProcessIsolation {
    async fn run(&self, invocation: &AnalyzerInvocation) -> Result<RunOutcome> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TealError::Internal("analysis pool is closed".to_string()))?;

        let start_time = Instant::now();
        debug!(
            program = %invocation.program,
            args = ?invocation.args,
            "Executing analyzer"
        );

        // The command owns both log handles; they close when it drops,
        // including on the spawn-failure path
        let stdout_log = create_log(&invocation.stdout_log).await?;
        let stderr_log = create_log(&invocation.stderr_log).await?;

        let mut cmd = TokioCommand::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log));
        self.configure_command(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            error!(program = %invocation.program, "Failed to spawn analyzer: {}", e);
            TealError::Launch {
                program: invocation.program.clone(),
                source: e,
            }
        })?;
        drop(cmd);

        let status = match self.config.timeout {
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(program = %invocation.program, "Analyzer timed out after {:?}", limit);
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill timed out analyzer: {}", e);
                    }
                    return Ok(RunOutcome {
                        exit_code: None,
                        timed_out: true,
                        elapsed: start_time.elapsed(),
                    });
                }
            },
            None => child.wait().await,
        }
        .map_err(|e| TealError::Internal(format!("failed to wait for analyzer: {}", e)))?;

        let outcome = RunOutcome {
            exit_code: status.code(),
            timed_out: false,
            elapsed: start_time.elapsed(),
        };
        debug!(
            exit_code = ?outcome.exit_code,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Analyzer finished"
        );
        Ok(outcome)
    }
}

/// Builder for creating process isolation configurations
pub struct IsolationConfigBuilder {
    config: IsolationConfig,
}

impl IsolationConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: IsolationConfig::default(),
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    pub fn working_dir<P: Into<PathBuf>>(mut self, working_dir: P) -> Self {
        self.config.working_dir = Some(working_dir.into());
        self
    }

    pub fn env_var<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> IsolationConfig {
        self.config
    }
}

impl Default for IsolationConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn shell(dir: &TempDir, script: &str) -> AnalyzerInvocation {
        AnalyzerInvocation {
            program: "sh".to_string(),
            args: vec![OsString::from("-c"), OsString::from(script)],
            stdout_log: dir.path().join("run.log"),
            stderr_log: dir.path().join("run.err"),
        }
    }

    #[test]
    fn test_config_builder() {
        let config = IsolationConfigBuilder::new()
            .timeout(Some(Duration::from_secs(10)))
            .max_concurrent(2)
            .env_var("TEAL_MODE", "test")
            .build();

        assert_eq!(config.timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.env_vars.get("TEAL_MODE"), Some(&"test".to_string()));
    }

    #[tokio::test]
    async fn test_invocation_styles() {
        let root = TempDir::new().unwrap();
        let workspace = RequestWorkspace::allocate(root.path(), Uuid::new_v4())
            .await
            .unwrap();
        let input = workspace.input_path("trace.ab1");

        let positional = InvocationStyle::Positional { with_tsv: true }.arguments(&input, &workspace);
        assert_eq!(
            positional,
            vec![
                input.clone().into_os_string(),
                workspace.output_json().into_os_string(),
                workspace.output_tsv().into_os_string(),
            ]
        );

        let without_tsv = InvocationStyle::Positional { with_tsv: false }.arguments(&input, &workspace);
        assert_eq!(without_tsv.len(), 2);

        let basecall = InvocationStyle::Basecall.arguments(&input, &workspace);
        assert_eq!(basecall[0], "basecall");
        assert_eq!(basecall[1], "-o");
        assert_eq!(basecall[2], workspace.output_json().into_os_string());
        assert_eq!(basecall[3], input.into_os_string());
    }

    #[tokio::test]
    async fn test_streams_redirected_to_logs() {
        let dir = TempDir::new().unwrap();
        let runner = ProcessIsolation::new();
        let invocation = shell(&dir, "echo processed; echo 'bad peak' >&2; exit 3");

        let outcome = runner.run(&invocation).await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());

        let stdout = std::fs::read_to_string(&invocation.stdout_log).unwrap();
        let stderr = std::fs::read_to_string(&invocation.stderr_log).unwrap();
        assert_eq!(stdout.trim(), "processed");
        assert_eq!(stderr.trim(), "bad peak");
    }

    #[tokio::test]
    async fn test_successful_run() {
        let dir = TempDir::new().unwrap();
        let runner = ProcessIsolation::new();
        let outcome = runner.run(&shell(&dir, "exit 0")).await.unwrap();
        assert!(outcome.success());
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let runner = ProcessIsolation::new();
        let invocation = AnalyzerInvocation {
            program: "/nonexistent/teal-analyzer".to_string(),
            args: Vec::new(),
            stdout_log: dir.path().join("run.log"),
            stderr_log: dir.path().join("run.err"),
        };

        let err = runner.run(&invocation).await.unwrap_err();
        assert!(matches!(err, TealError::Launch { .. }));
        assert!(invocation.stdout_log.exists());
        assert!(invocation.stderr_log.exists());
        assert_eq!(runner.available_permits(), runner.config().max_concurrent);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let config = IsolationConfigBuilder::new()
            .timeout(Some(Duration::from_millis(100)))
            .build();
        let runner = ProcessIsolation::with_config(config);

        let outcome = runner.run(&shell(&dir, "sleep 5")).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let dir = TempDir::new().unwrap();
        let config = IsolationConfigBuilder::new().max_concurrent(1).build();
        let runner = Arc::new(ProcessIsolation::with_config(config));

        let first = {
            let runner = Arc::clone(&runner);
            let invocation = AnalyzerInvocation {
                stdout_log: dir.path().join("a.log"),
                stderr_log: dir.path().join("a.err"),
                ..shell(&dir, "sleep 0.3")
            };
            tokio::spawn(async move { runner.run(&invocation).await })
        };
        let second = {
            let runner = Arc::clone(&runner);
            let invocation = AnalyzerInvocation {
                stdout_log: dir.path().join("b.log"),
                stderr_log: dir.path().join("b.err"),
                ..shell(&dir, "sleep 0.3")
            };
            tokio::spawn(async move { runner.run(&invocation).await })
        };

        let started = Instant::now();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(550));
        assert_eq!(runner.available_permits(), 1);
    }
}
