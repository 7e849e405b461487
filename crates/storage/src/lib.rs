//! Remote object storage for prepared batches (MinIO/S3 compatible).

pub mod object_store;

pub use self::object_store::{ObjectStorage, ObjectStorageConfig};
