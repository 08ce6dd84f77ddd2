//! Upload-and-execute request lifecycle

use crate::analysis::file_security::{TraceSource, UploadValidator};
use crate::analysis::input_sanitization::sanitize_diagnostics;
use crate::analysis::process_isolation::{AnalyzerInvocation, ProcessRunner, RunOutcome};
use crate::analysis::workspace::RequestWorkspace;
use crate::core::config::ServiceConfig;
use crate::core::errors::TealError;
use crate::core::models::{
    AnalysisResult, RequestLifecycle, RequestState, SuccessBody, UploadRequest, UploadResponse,
};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Turns an upload into an analyzer run and a JSON response
///
/// Each call gets its own uuid-named workspace; calls share nothing but the
/// configuration and the runner's worker pool.
#[derive(Clone)]
pub struct UploadService {
    config: Arc<ServiceConfig>,
    validator: UploadValidator,
    runner: Arc<dyn ProcessRunner>,
}

impl UploadService {
    pub fn new(config: Arc<ServiceConfig>, runner: Arc<dyn ProcessRunner>) -> Self {
        let validator = UploadValidator::new(&config);
        Self {
            config,
            validator,
            runner,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Run the full lifecycle and map the outcome to `(status, body)`
    pub async fn handle_upload(&self, request: UploadRequest) -> UploadResponse {
        match self.process(request).await {
            Ok(data) => UploadResponse {
                status: 200,
                body: serde_json::to_value(SuccessBody { data })
                    .unwrap_or(serde_json::Value::Null),
            },
            Err(err) => error_response(&err),
        }
    }

    /// Validate, persist, execute and read back the analysis document
    pub async fn process(&self, request: UploadRequest) -> Result<AnalysisResult> {
        let id = Uuid::new_v4();
        let span = info_span!("upload", request_id = %id);

        async move {
            let mut lifecycle = RequestLifecycle::new(id);
            let result = self.run_lifecycle(&request, &mut lifecycle).await;
            let terminal = if result.is_ok() {
                RequestState::Succeeded
            } else {
                RequestState::Failed
            };
            lifecycle.advance(terminal);
            result
        }
        .instrument(span)
        .await
    }

    async fn run_lifecycle(
        &self,
        request: &UploadRequest,
        lifecycle: &mut RequestLifecycle,
    ) -> Result<AnalysisResult> {
        // Nothing touches the filesystem until validation passes
        let source = self.validator.validate(request)?;
        lifecycle.advance(RequestState::Validated);

        let workspace = RequestWorkspace::allocate(&self.config.data_root, lifecycle.id()).await?;
        let input = self.resolve_input(&source, &workspace).await?;
        lifecycle.advance(RequestState::Persisted);

        let invocation = AnalyzerInvocation::for_workspace(&self.config, &input, &workspace);
        lifecycle.advance(RequestState::Executing);
        let outcome = self.runner.run(&invocation).await?;

        if !outcome.success() {
            return Err(self.execution_error(&outcome, &workspace).await);
        }

        let data = read_artifact(workspace.output_json()).await?;
        info!(
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Analysis succeeded"
        );
        Ok(data)
    }

    async fn resolve_input(
        &self,
        source: &TraceSource<'_>,
        workspace: &RequestWorkspace,
    ) -> Result<PathBuf> {
        match source {
            TraceSource::Upload(file) => workspace.persist_upload(file).await,
            TraceSource::Sample => {
                let sample = &self.config.sample_trace;
                if fs::metadata(sample).await.map(|m| m.is_file()).unwrap_or(false) {
                    Ok(sample.clone())
                } else {
                    Err(TealError::SampleUnavailable {
                        path: sample.clone(),
                    })
                }
            }
        }
    }

    /// Build the failure for a non-zero exit; the output artifact is never read here
    async fn execution_error(&self, outcome: &RunOutcome, workspace: &RequestWorkspace) -> TealError {
        if outcome.timed_out {
            let after = self
                .config
                .analysis_timeout
                .unwrap_or(outcome.elapsed);
            return TealError::Timeout { after };
        }

        let stderr = match fs::read(workspace.stderr_log()).await {
            Ok(bytes) => sanitize_diagnostics(
                &String::from_utf8_lossy(&bytes),
                self.config.max_diagnostic_bytes,
            ),
            Err(e) => {
                warn!("Could not read analyzer error log: {}", e);
                String::new()
            }
        };

        TealError::Execution {
            exit_code: outcome.exit_code,
            stderr,
        }
    }
}

/// Parse the analyzer's JSON output without imposing a schema
async fn read_artifact(path: PathBuf) -> Result<AnalysisResult> {
    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TealError::artifact(path, "output file was not written"));
        }
        Err(e) => return Err(TealError::storage(path, e)),
    };

    serde_json::from_slice(&bytes)
        .map_err(|e| TealError::artifact(path, format!("invalid JSON: {}", e)))
}

/// Map an error to its status and envelope, logging it once
pub fn error_response(err: &TealError) -> UploadResponse {
    err.log();
    UploadResponse {
        status: err.status_code(),
        body: serde_json::to_value(err.to_error_body()).unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ServiceConfigBuilder;
    use crate::core::errors::ValidationError;
    use crate::core::models::UploadedFile;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// What the stub analyzer does when invoked
    enum StubBehavior {
        /// Exit 0 after writing this text to the output path
        Write(String),
        /// Exit 0 without writing anything
        Silent,
        /// Exit with a code after writing stderr
        Fail(i32, String),
        TimedOut,
    }

    struct StubRunner {
        behavior: StubBehavior,
        calls: AtomicUsize,
        invocations: Mutex<Vec<AnalyzerInvocation>>,
    }

    impl StubRunner {
        fn new(behavior: StubBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
                invocations: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcessRunner for StubRunner {
        async fn run(&self, invocation: &AnalyzerInvocation) -> Result<RunOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.invocations.lock().unwrap().push(invocation.clone());

            // Basecall layout: basecall -o <json> <input>
            let output = PathBuf::from(&invocation.args[2]);
            std::fs::write(&invocation.stdout_log, "").unwrap();
            std::fs::write(&invocation.stderr_log, "").unwrap();

            let exit_code = match &self.behavior {
                StubBehavior::Write(text) => {
                    std::fs::write(&output, text).unwrap();
                    0
                }
                StubBehavior::Silent => 0,
                StubBehavior::Fail(code, stderr) => {
                    std::fs::write(&invocation.stderr_log, stderr).unwrap();
                    *code
                }
                StubBehavior::TimedOut => {
                    return Ok(RunOutcome {
                        exit_code: None,
                        timed_out: true,
                        elapsed: Duration::from_secs(1),
                    })
                }
            };

            Ok(RunOutcome {
                exit_code: Some(exit_code),
                timed_out: false,
                elapsed: Duration::from_millis(5),
            })
        }
    }

    fn service(root: &TempDir, runner: Arc<StubRunner>) -> UploadService {
        let sample = root.path().join("sample.abi");
        std::fs::write(&sample, b"ABIF-sample").unwrap();
        let config = ServiceConfigBuilder::new()
            .data_root(root.path().join("data"))
            .sample_trace(sample)
            .analysis_timeout(Some(Duration::from_secs(1)))
            .build();
        UploadService::new(Arc::new(config), runner)
    }

    fn upload(name: &str) -> UploadRequest {
        UploadRequest::with_file(UploadedFile::new(name, b"ABIF".to_vec()))
    }

    fn count_files(dir: &std::path::Path) -> usize {
        if !dir.exists() {
            return 0;
        }
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    count_files(&path)
                } else {
                    1
                }
            })
            .sum()
    }

    #[tokio::test]
    async fn test_success_wraps_document() {
        let root = TempDir::new().unwrap();
        let runner = StubRunner::new(StubBehavior::Write(r#"{"pos":[1,2,3],"seq":"ACG"}"#.into()));
        let service = service(&root, runner.clone());

        let response = service.handle_upload(upload("trace.ab1")).await;
        assert_eq!(response.status, 200);
        assert_eq!(
            response.body,
            serde_json::json!({"data": {"pos": [1, 2, 3], "seq": "ACG"}})
        );
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_disallowed_extension_touches_nothing() {
        let root = TempDir::new().unwrap();
        let runner = StubRunner::new(StubBehavior::Silent);
        let service = service(&root, runner.clone());

        for name in ["trace.txt", "trace", "trace.ab1.exe"] {
            let response = service.handle_upload(upload(name)).await;
            assert_eq!(response.status, 400);
            assert_eq!(
                response.body["errors"][0]["title"],
                "Chromatogram file has incorrect file type!"
            );
        }

        assert_eq!(runner.calls(), 0);
        assert_eq!(count_files(&root.path().join("data")), 0);
    }

    #[tokio::test]
    async fn test_missing_file_and_name() {
        let root = TempDir::new().unwrap();
        let runner = StubRunner::new(StubBehavior::Silent);
        let service = service(&root, runner.clone());

        let err = service.process(UploadRequest::default()).await.unwrap_err();
        assert!(matches!(
            err,
            TealError::Validation(ValidationError::MissingFile)
        ));

        let response = service.handle_upload(upload("")).await;
        assert_eq!(response.status, 400);
        assert_eq!(
            response.body,
            serde_json::json!({"errors": [{"title": "Chromatogram file name is missing!"}]})
        );
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_never_reads_artifact() {
        let root = TempDir::new().unwrap();
        let runner = StubRunner::new(StubBehavior::Fail(1, "\x1b[1mUnknown trace\x1b[0m\n".into()));
        let service = service(&root, runner.clone());

        let err = service.process(upload("trace.ab1")).await.unwrap_err();
        match err {
            TealError::Execution { exit_code, stderr } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr, "Unknown trace");
            }
            other => panic!("expected execution error, got {:?}", other),
        }

        let response = service.handle_upload(upload("trace.ab1")).await;
        assert_eq!(response.status, 400);
        assert_eq!(
            response.body["errors"][0]["title"],
            "Error in running teal: Unknown trace"
        );
    }

    #[tokio::test]
    async fn test_missing_and_invalid_artifacts() {
        let root = TempDir::new().unwrap();
        let silent = service(&root, StubRunner::new(StubBehavior::Silent));
        let err = silent.process(upload("trace.ab1")).await.unwrap_err();
        assert!(matches!(err, TealError::Artifact { .. }));

        let garbage = service(&root, StubRunner::new(StubBehavior::Write("{not json".into())));
        let response = garbage.handle_upload(upload("trace.ab1")).await;
        assert_eq!(response.status, 500);
        assert_eq!(
            response.body["errors"][0]["title"],
            "Analysis output is missing or invalid!"
        );
    }

    #[tokio::test]
    async fn test_timeout_maps_to_server_error() {
        let root = TempDir::new().unwrap();
        let service = service(&root, StubRunner::new(StubBehavior::TimedOut));
        let err = service.process(upload("trace.ab1")).await.unwrap_err();
        assert!(matches!(err, TealError::Timeout { after } if after == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_sample_mode_uses_bundled_trace() {
        let root = TempDir::new().unwrap();
        let runner = StubRunner::new(StubBehavior::Write(r#"{"sample":true}"#.into()));
        let service = service(&root, runner.clone());

        let response = service.handle_upload(UploadRequest::sample()).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["data"]["sample"], true);

        let invocations = runner.invocations.lock().unwrap();
        assert_eq!(
            PathBuf::from(&invocations[0].args[3]),
            service.config().sample_trace
        );
    }

    #[tokio::test]
    async fn test_sample_missing_is_server_error() {
        let root = TempDir::new().unwrap();
        let runner = StubRunner::new(StubBehavior::Silent);
        let config = ServiceConfigBuilder::new()
            .data_root(root.path().join("data"))
            .sample_trace(root.path().join("absent.abi"))
            .build();
        let service = UploadService::new(Arc::new(config), runner.clone());

        let response = service.handle_upload(UploadRequest::sample()).await;
        assert_eq!(response.status, 500);
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_identical_uploads_use_distinct_workspaces() {
        let root = TempDir::new().unwrap();
        let runner = StubRunner::new(StubBehavior::Write("{}".into()));
        let service = service(&root, runner.clone());

        service.handle_upload(upload("trace.ab1")).await;
        service.handle_upload(upload("trace.ab1")).await;

        let invocations = runner.invocations.lock().unwrap();
        assert_ne!(invocations[0].args[3], invocations[1].args[3]);
        assert_ne!(invocations[0].args[2], invocations[1].args[2]);
        assert_ne!(invocations[0].stderr_log, invocations[1].stderr_log);
    }
}
