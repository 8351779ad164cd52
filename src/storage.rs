//! Object storage backends for source media and published exports.
//!
//! Objects are addressed by `(bucket, key)`. [`LocalStorage`] maps buckets to
//! directories below a root folder; [`S3Storage`] talks to any S3-compatible
//! endpoint.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;
use tracing::{debug, info};

use crate::security::is_safe_relative_path;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("download of {key} failed: {message}")]
    DownloadFailed { key: String, message: String },

    #[error("upload of {key} failed: {message}")]
    UploadFailed { key: String, message: String },
}

impl StorageError {
    fn download(key: &str, err: impl std::fmt::Display) -> Self {
        Self::DownloadFailed {
            key: key.to_string(),
            message: err.to_string(),
        }
    }

    fn upload(key: &str, err: impl std::fmt::Display) -> Self {
        Self::UploadFailed {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Copies the object into `dest`, creating parent directories as needed.
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> StorageResult<()>;

    /// Stores the file at `src` under `key`.
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        content_type: &str,
    ) -> StorageResult<()>;
}

fn check_key(key: &str) -> StorageResult<()> {
    if is_safe_relative_path(key) {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Buckets are directories under `root`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        check_key(bucket)?;
        check_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> StorageResult<()> {
        let source = self.object_path(bucket, key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::download(key, err))?;
        }
        tokio::fs::copy(&source, dest)
            .await
            .map_err(|err| StorageError::download(key, err))?;
        debug!(bucket, key, dest = %dest.display(), "copied local object");
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        _content_type: &str,
    ) -> StorageResult<()> {
        let target = self.object_path(bucket, key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::upload(key, err))?;
        }
        tokio::fs::copy(src, &target)
            .await
            .map_err(|err| StorageError::upload(key, err))?;
        info!(bucket, key, "stored object on local disk");
        Ok(())
    }
}

/// S3 (or S3-compatible) backend.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    /// Builds a client from the default AWS credential chain. A custom
    /// `endpoint` switches to path-style addressing for MinIO/R2 style hosts.
    pub async fn connect(region: Option<String>, endpoint: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> StorageResult<()> {
        debug!(bucket, key, dest = %dest.display(), "downloading object");
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StorageError::download(key, err))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::download(key, err))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|err| StorageError::download(key, err))?;
        let body = response.body.into_async_read();
        tokio::pin!(body);
        tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|err| StorageError::download(key, err))?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        content_type: &str,
    ) -> StorageResult<()> {
        let body = ByteStream::from_path(src)
            .await
            .map_err(|err| StorageError::upload(key, err))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| StorageError::upload(key, err))?;
        info!(bucket, key, "uploaded object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn local_roundtrip_through_bucket_directory() {
        let root = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let storage = LocalStorage::new(root.path());

        let src = scratch.path().join("clip.mp4");
        std::fs::write(&src, b"video-bytes").unwrap();
        storage
            .upload("media", "videos/u1/clip.mp4", &src, "video/mp4")
            .await
            .unwrap();
        assert!(root.path().join("media/videos/u1/clip.mp4").exists());

        let dest = scratch.path().join("nested/copy.mp4");
        storage
            .download("media", "videos/u1/clip.mp4", &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"video-bytes");
    }

    #[tokio::test]
    async fn local_download_of_missing_object_fails() {
        let root = tempdir().unwrap();
        let storage = LocalStorage::new(root.path());
        let err = storage
            .download("media", "nope.mp4", &root.path().join("out.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DownloadFailed { .. }));
    }

    #[test]
    fn local_rejects_escaping_keys() {
        let storage = LocalStorage::new("/srv/storage");
        assert!(matches!(
            storage.object_path("media", "../etc/passwd"),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            storage.object_path("..", "a.mp4"),
            Err(StorageError::InvalidKey(_))
        ));
        assert_eq!(
            storage.object_path("media", "a/b.mp4").unwrap(),
            PathBuf::from("/srv/storage/media/a/b.mp4")
        );
    }
}
