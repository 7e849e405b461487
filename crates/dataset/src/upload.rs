//! Batch directory upload.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use storage::ObjectStorage;
use tracing::{debug, info, instrument, warn};

use nowcasting_common::{retry_with_backoff, NowcastingError, NowcastingResult, RetryPolicy};

/// Outcome of uploading one batch directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadResult {
    pub files: usize,
    pub bytes: u64,
}

/// Object key for `relative` under `prefix`, always `/`-separated.
fn object_key(prefix: &str, relative: &Path) -> String {
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        relative
    } else {
        format!("{}/{}", prefix, relative)
    }
}

/// Upload a batch directory to object storage, then delete it locally.
///
/// Every file is put under `remote_prefix` with bounded exponential-backoff
/// retry on transient failures. The local directory is removed only after
/// every file uploaded; on failure it is left in place and the files already
/// put are deleted again, so a batch is never left half-written remotely.
///
/// # Returns
/// Number of files and total bytes uploaded
#[instrument(skip(storage, retry), fields(bucket = storage.bucket()))]
pub async fn upload_batch(
    storage: &ObjectStorage,
    local_path: &Path,
    remote_prefix: &str,
    retry: &RetryPolicy,
) -> NowcastingResult<UploadResult> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(local_path).sort_by_file_name() {
        let entry = entry.map_err(|e| NowcastingError::Storage(e.to_string()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    let mut uploaded = Vec::with_capacity(files.len());
    let mut total_size = 0u64;
    for file in &files {
        match upload_file(storage, local_path, file, remote_prefix, retry).await {
            Ok((key, size)) => {
                total_size += size;
                uploaded.push(key);
            }
            Err(e) => {
                remove_uploaded(storage, &uploaded).await;
                return Err(e);
            }
        }
    }

    tokio::fs::remove_dir_all(local_path).await?;
    info!(
        local = %local_path.display(),
        remote = remote_prefix,
        files = files.len(),
        bytes = total_size,
        "Uploaded batch"
    );

    Ok(UploadResult {
        files: files.len(),
        bytes: total_size,
    })
}

async fn upload_file(
    storage: &ObjectStorage,
    local_path: &Path,
    file: &Path,
    remote_prefix: &str,
    retry: &RetryPolicy,
) -> NowcastingResult<(String, u64)> {
    let relative = file
        .strip_prefix(local_path)
        .map_err(|e| NowcastingError::internal(e.to_string()))?;
    let key = object_key(remote_prefix, relative);

    let data = Bytes::from(tokio::fs::read(file).await?);
    let size = data.len() as u64;
    retry_with_backoff(retry, "upload", || storage.put(&key, data.clone())).await?;

    debug!(path = %key, size, "Uploaded batch file");
    Ok((key, size))
}

async fn remove_uploaded(storage: &ObjectStorage, keys: &[String]) {
    for key in keys {
        if let Err(e) = storage.delete(key).await {
            warn!(path = %key, error = %e, "Failed to remove partially uploaded file");
        }
    }
}
