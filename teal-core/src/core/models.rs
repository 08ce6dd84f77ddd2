//! Core data models for the trace service

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Analyzer output, relayed without schema checks
pub type AnalysisResult = serde_json::Value;

/// A file part as received from the client
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Client-supplied name, untrusted
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

/// Decoded upload form handed to the request handler
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Client asked for the bundled sample trace
    pub sample: bool,
    pub file: Option<UploadedFile>,
}

impl UploadRequest {
    pub fn with_file(file: UploadedFile) -> Self {
        Self {
            sample: false,
            file: Some(file),
        }
    }

    pub fn sample() -> Self {
        Self {
            sample: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTitle {
    pub title: String,
}

/// Failure envelope: `{"errors": [{"title": ...}]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub errors: Vec<ErrorTitle>,
}

/// Success envelope: `{"data": <analysis>}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessBody {
    pub data: AnalysisResult,
}

/// Status code plus JSON body, independent of any web framework
#[derive(Debug, Clone)]
pub struct UploadResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl UploadResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Per-request states; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestState {
    Received,
    Validated,
    Persisted,
    Executing,
    Succeeded,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Succeeded | RequestState::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Validated => "validated",
            RequestState::Persisted => "persisted",
            RequestState::Executing => "executing",
            RequestState::Succeeded => "succeeded",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the state machine of one upload
#[derive(Debug)]
pub struct RequestLifecycle {
    id: Uuid,
    state: RequestState,
    started_at: Instant,
    history: Vec<RequestState>,
}

impl RequestLifecycle {
    pub fn new(id: Uuid) -> Self {
        debug!(request_id = %id, state = %RequestState::Received, "Request state");
        Self {
            id,
            state: RequestState::Received,
            started_at: Instant::now(),
            history: vec![RequestState::Received],
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn history(&self) -> &[RequestState] {
        &self.history
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Move to `next`; returns false and stays put on a backwards or post-terminal move
    pub fn advance(&mut self, next: RequestState) -> bool {
        if self.state.is_terminal() || next <= self.state {
            warn!(
                request_id = %self.id,
                from = %self.state,
                to = %next,
                "Ignoring invalid request state transition"
            );
            return false;
        }

        self.state = next;
        self.history.push(next);

        if next.is_terminal() {
            info!(
                request_id = %self.id,
                state = %next,
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Request finished"
            );
        } else {
            debug!(request_id = %self.id, state = %next, "Request state");
        }
        true
    }
}
