//! Upload validation and filename sanitization

use crate::core::config::ServiceConfig;
use crate::core::errors::ValidationError;
use crate::core::models::{UploadRequest, UploadedFile};
use std::collections::HashSet;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

/// Longest sanitized filename kept on disk (the uuid prefix is added on top)
const MAX_SANITIZED_LEN: usize = 200;

/// Name used when nothing of the client filename survives sanitization
const FALLBACK_FILENAME: &str = "upload";

const RESERVED_NAMES: [&str; 22] = [
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Where the analyzer input comes from once validation passes
#[derive(Debug)]
pub enum TraceSource<'a> {
    /// Bundled sample trace
    Sample,
    /// Client upload with an allowed extension
    Upload(&'a UploadedFile),
}

/// Validates upload requests against the configured allow-list
#[derive(Debug, Clone)]
pub struct UploadValidator {
    allowed_extensions: HashSet<String>,
}

impl UploadValidator {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            allowed_extensions: config.normalized_extensions().into_iter().collect(),
        }
    }

    /// Decide the trace source, checking sample flag, file part, name and extension in that order
    pub fn validate<'a>(
        &self,
        request: &'a UploadRequest,
    ) -> std::result::Result<TraceSource<'a>, ValidationError> {
        if request.sample {
            debug!("Sample mode requested");
            return Ok(TraceSource::Sample);
        }

        let file = request.file.as_ref().ok_or(ValidationError::MissingFile)?;

        if file.filename.is_empty() {
            return Err(ValidationError::MissingFileName);
        }

        if !self.is_allowed(&file.filename) {
            return Err(ValidationError::DisallowedExtension {
                filename: file.filename.clone(),
            });
        }

        Ok(TraceSource::Upload(file))
    }

    /// Extension is the text after the last '.', compared case-insensitively
    pub fn is_allowed(&self, filename: &str) -> bool {
        match filename.rsplit_once('.') {
            Some((_, extension)) => self.allowed_extensions.contains(&extension.to_lowercase()),
            None => false,
        }
    }
}

/// Reduce a client filename to a safe single path component
///
/// Only the final component survives. Accented letters are decomposed
/// (NFKD) so their base letter is kept, remaining non-ASCII characters are
/// dropped, whitespace runs become `_`, anything outside `[A-Za-z0-9._-]` is removed
/// and leading or trailing dots and underscores are stripped.
pub fn secure_filename(filename: &str) -> String {
    let last_component = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("");

    let decomposed: String = last_component.nfkd().filter(char::is_ascii).collect();

    let joined = decomposed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");

    let filtered: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    let mut sanitized = filtered.trim_matches(|c| c == '.' || c == '_').to_string();

    let stem = sanitized
        .split('.')
        .next()
        .unwrap_or("")
        .to_lowercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        sanitized = format!("_{}", sanitized);
    }

    // ASCII only at this point, so any byte index is a char boundary
    sanitized.truncate(MAX_SANITIZED_LEN);

    if sanitized.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        sanitized
    }
}
