//! Object storage interface for batch upload (MinIO/S3 compatible).

use bytes::Bytes;
use object_store::{aws::AmazonS3Builder, memory::InMemory, path::Path, ObjectStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use nowcasting_common::{NowcastingError, NowcastingResult, UploadConfig};

/// Configuration for object storage connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    /// S3/MinIO endpoint URL
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// AWS region (use "us-east-1" for MinIO)
    pub region: String,
    /// Allow HTTP (for local MinIO)
    pub allow_http: bool,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://minio:9000".to_string(),
            bucket: "nowcasting-dataset".to_string(),
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin".to_string(),
            region: "us-east-1".to_string(),
            allow_http: true,
        }
    }
}

impl From<&UploadConfig> for ObjectStorageConfig {
    fn from(upload: &UploadConfig) -> Self {
        Self {
            endpoint: upload.endpoint.clone(),
            bucket: upload.bucket.clone(),
            access_key_id: upload.access_key_id.clone(),
            secret_access_key: upload.secret_access_key.clone(),
            region: upload.region.clone(),
            allow_http: upload.allow_http,
        }
    }
}

/// Map an object store failure into the common taxonomy.
///
/// Missing objects and bad paths are permanent. I/O errors are transient
/// only for interrupted or dropped connections; other backend errors
/// (HTTP, throttling) are treated as transient.
fn classify(context: String, err: object_store::Error) -> NowcastingError {
    use object_store::Error as E;
    match &err {
        E::NotFound { .. }
        | E::AlreadyExists { .. }
        | E::InvalidPath { .. }
        | E::NotSupported { .. }
        | E::NotImplemented
        | E::UnknownConfigurationKey { .. } => {
            return NowcastingError::Storage(format!("{}: {}", context, err));
        }
        _ => {}
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            let transient = matches!(
                io.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
            );
            return NowcastingError::Io {
                transient,
                message: format!("{}: {}", context, err),
            };
        }
        source = e.source();
    }
    NowcastingError::transient(format!("{}: {}", context, err))
}

/// Object storage client for prepared batches.
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ObjectStorage {
    /// Create a new object storage client from config.
    pub fn new(config: &ObjectStorageConfig) -> NowcastingResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_endpoint(&config.endpoint)
            .with_bucket_name(&config.bucket)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_region(&config.region);

        if config.allow_http {
            builder = builder.with_allow_http(true);
        }

        let store = builder
            .build()
            .map_err(|e| NowcastingError::Storage(format!("Failed to create S3 client: {}", e)))?;

        Ok(Self::from_store(Arc::new(store), &config.bucket))
    }

    /// Wrap an existing store, e.g. a local filesystem.
    pub fn from_store(store: Arc<dyn ObjectStore>, bucket: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
        }
    }

    /// In-process store, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self::from_store(Arc::new(InMemory::new()), "memory")
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Write bytes to a path in the bucket.
    #[instrument(skip(self, data), fields(bucket = %self.bucket, path = %path))]
    pub async fn put(&self, path: &str, data: Bytes) -> NowcastingResult<()> {
        let location = Path::from(path);
        debug!(size = data.len(), "Writing object");

        self.store
            .put(&location, data.into())
            .await
            .map_err(|e| classify(format!("Failed to write {}", path), e))?;

        Ok(())
    }

    /// Read bytes from a path.
    #[instrument(skip(self), fields(bucket = %self.bucket, path = %path))]
    pub async fn get(&self, path: &str) -> NowcastingResult<Bytes> {
        let location = Path::from(path);

        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| classify(format!("Failed to read {}", path), e))?;

        let bytes = result
            .bytes()
            .await
            .map_err(|e| classify(format!("Failed to read bytes of {}", path), e))?;

        debug!(size = bytes.len(), "Read object");
        Ok(bytes)
    }

    /// Check if an object exists.
    pub async fn exists(&self, path: &str) -> NowcastingResult<bool> {
        let location = Path::from(path);

        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(classify(format!("Failed to check {}", path), e)),
        }
    }

    /// List objects with a given prefix.
    pub async fn list(&self, prefix: &str) -> NowcastingResult<Vec<String>> {
        use futures::TryStreamExt;

        let prefix_path = Path::from(prefix);
        let mut paths = Vec::new();

        let mut stream = self.store.list(Some(&prefix_path));
        while let Some(meta) = stream
            .try_next()
            .await
            .map_err(|e| classify(format!("List of {} failed", prefix), e))?
        {
            paths.push(meta.location.to_string());
        }

        paths.sort();
        Ok(paths)
    }

    /// Delete an object.
    #[instrument(skip(self), fields(bucket = %self.bucket, path = %path))]
    pub async fn delete(&self, path: &str) -> NowcastingResult<()> {
        let location = Path::from(path);

        self.store
            .delete(&location)
            .await
            .map_err(|e| classify(format!("Failed to delete {}", path), e))?;

        Ok(())
    }
}
