//! Output file publication.
//!
//! The runner writes artifacts to local paths; before results are exposed,
//! the worker turns each path into a client-usable reference. Two backends:
//! inline data URIs (no shared storage needed) and a mounted directory.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;

use crate::error::ServerError;

#[async_trait]
pub trait FileUploader: Send + Sync {
    /// Publish the given files and return one reference string per file, in
    /// input order.
    async fn upload(&self, files: Vec<PathBuf>) -> Result<Vec<String>, ServerError>;
}

/// Inlines file contents as `data:` URIs.
pub struct InMemoryFileUploader;

#[async_trait]
impl FileUploader for InMemoryFileUploader {
    async fn upload(&self, files: Vec<PathBuf>) -> Result<Vec<String>, ServerError> {
        let mut refs = Vec::with_capacity(files.len());
        for path in files {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| ServerError::Upload(format!("failed to read {}: {e}", path.display())))?;
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            refs.push(format!("data:{mime};base64,{encoded}"));
        }
        Ok(refs)
    }
}

/// Copies files into a directory shared with clients (a mounted volume) and
/// returns the destination paths.
pub struct LocalFsFileUploader {
    mount_point: PathBuf,
}

impl LocalFsFileUploader {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
        }
    }

    fn destination(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let id = uuid::Uuid::new_v4().simple();
        self.mount_point.join(format!("output-{id}-{name}"))
    }
}

#[async_trait]
impl FileUploader for LocalFsFileUploader {
    async fn upload(&self, files: Vec<PathBuf>) -> Result<Vec<String>, ServerError> {
        let mut refs = Vec::with_capacity(files.len());
        for path in files {
            let dest = self.destination(&path);
            tokio::fs::copy(&path, &dest).await.map_err(|e| {
                ServerError::Upload(format!(
                    "failed to copy {} to {}: {e}",
                    path.display(),
                    dest.display()
                ))
            })?;
            // The volume is shared with processes running as other users.
            tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o666))
                .await
                .map_err(|e| {
                    ServerError::Upload(format!("failed to chmod {}: {e}", dest.display()))
                })?;
            refs.push(dest.to_string_lossy().into_owned());
        }
        Ok(refs)
    }
}
