//! Per-request workspace on the data root

use crate::analysis::file_security::secure_filename;
use crate::core::errors::TealError;
use crate::core::models::UploadedFile;
use crate::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Prefix shared by every file a request creates
pub const FILE_PREFIX: &str = "teal_";

/// Directory and derived file paths owned by one request
///
/// Uniqueness comes from the uuid: two requests never share a derived path,
/// so no locking is needed.
#[derive(Debug, Clone)]
pub struct RequestWorkspace {
    id: Uuid,
    dir: PathBuf,
}

impl RequestWorkspace {
    /// Create (or reuse) the shard directory `data_root/<uuid[0:2]>`
    pub async fn allocate(data_root: &Path, id: Uuid) -> Result<Self> {
        let dir = data_root.join(shard_name(&id));
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| TealError::storage(&dir, e))?;

        debug!(request_id = %id, dir = %dir.display(), "Allocated request workspace");
        Ok(Self { id, dir })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn derived(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}{}", FILE_PREFIX, self.id, suffix))
    }

    /// `teal_<uuid>_<sanitized name>`
    pub fn input_path(&self, original_name: &str) -> PathBuf {
        self.derived(&format!("_{}", secure_filename(original_name)))
    }

    pub fn output_json(&self) -> PathBuf {
        self.derived(".json")
    }

    pub fn output_tsv(&self) -> PathBuf {
        self.derived(".tsv")
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.derived(".log")
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.derived(".err")
    }

    /// Write the uploaded bytes; never overwrites an existing file
    pub async fn persist_upload(&self, upload: &UploadedFile) -> Result<PathBuf> {
        let path = self.input_path(&upload.filename);

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| TealError::storage(&path, e))?;
        file.write_all(&upload.bytes)
            .await
            .map_err(|e| TealError::storage(&path, e))?;
        file.flush().await.map_err(|e| TealError::storage(&path, e))?;

        debug!(
            request_id = %self.id,
            path = %path.display(),
            bytes = upload.bytes.len(),
            "Persisted upload"
        );
        Ok(path)
    }
}

/// Two-character shard bounding directory fan-out
pub fn shard_name(id: &Uuid) -> String {
    id.to_string()[..2].to_string()
}
