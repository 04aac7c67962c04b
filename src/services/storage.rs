use s3::creds::Credentials;
use s3::{Bucket, Region};

use crate::config::BlobConfig;
use crate::models::outcome::FailureKind;

/// Client for the S3-compatible bucket holding frames referenced by key.
pub struct BlobStore {
    bucket: Box<Bucket>,
}

impl BlobStore {
    pub fn new(config: &BlobConfig) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: config.endpoint.clone(),
        };

        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }

    /// Download frame bytes.
    pub async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        match response.status_code() {
            200 => Ok(response.to_vec()),
            404 => Err(StorageError::NotFound(key.to_string())),
            status => Err(StorageError::Status(status)),
        }
    }

    /// Upload frame bytes. Used by tooling and integration tests.
    pub async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.bucket.delete_object(key).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Frame blob not found: {0}")]
    NotFound(String),

    #[error("Object storage returned status {0}")]
    Status(u16),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StorageError::NotFound(_) | StorageError::Config(_) => FailureKind::Data,
            StorageError::Status(429) | StorageError::Status(503) => FailureKind::Capacity,
            StorageError::Status(s) if (400..500).contains(s) => FailureKind::Data,
            StorageError::Status(_) | StorageError::S3(_) => FailureKind::Transport,
        }
    }
}
