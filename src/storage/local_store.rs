//! Local filesystem storage backend.
//!
//! Objects live at `root/<bucket>/<key>`. Every write streams into
//! `root/.tmp/<random>`, is fsynced, then renamed into place: rename is
//! atomic within a filesystem, so a crash at any point leaves either the
//! old object or the new one, never a torn file. Multipart parts are staged
//! under `root/.multipart/<upload_id>/` until assembly or abort.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::errors::{S3Error, S3ErrorCode};
use crate::storage::{composite_etag, etag_of, part_file_name, AssemblePart, StorageBackend};

/// Reserved directory for in-flight temp files.
const TMP_DIR: &str = ".tmp";
/// Reserved directory for staged multipart parts.
const MULTIPART_DIR: &str = ".multipart";

pub struct LocalStorageBackend {
    root: PathBuf,
}

impl LocalStorageBackend {
    /// Open the backend rooted at `root`, creating the tree if needed and
    /// sweeping any temp files a previous process left behind.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, S3Error> {
        let root = root.into();
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        std::fs::create_dir_all(root.join(MULTIPART_DIR))?;

        let mut swept = 0usize;
        for entry in std::fs::read_dir(root.join(TMP_DIR))? {
            let entry = entry?;
            if std::fs::remove_file(entry.path()).is_ok() {
                swept += 1;
            }
        }
        if swept > 0 {
            info!("removed {} orphaned temp files from {}", swept, root.display());
        }
        Ok(LocalStorageBackend { root })
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, S3Error> {
        let rel = Path::new(key);
        // Object keys are opaque strings, not paths; refuse anything that
        // would resolve outside the bucket directory.
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(S3Error::with_message(
                        S3ErrorCode::InvalidArgument,
                        "object key is not storable on this backend",
                    ))
                }
            }
        }
        Ok(self.root.join(bucket).join(rel))
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(MULTIPART_DIR).join(upload_id)
    }

    fn temp_path(&self) -> PathBuf {
        self.root.join(TMP_DIR).join(Uuid::new_v4().to_string())
    }

    /// Write `data` to a fresh temp file, fsync, rename to `dest`.
    async fn write_via_temp(&self, dest: &Path, data: &[u8]) -> Result<(), S3Error> {
        let temp = self.temp_path();
        let result = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&temp, dest).await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp).await;
        }
        result
    }

    /// Remove now-empty directories between a deleted object and the bucket
    /// root. Stops at the first non-empty directory.
    async fn prune_empty_dirs(&self, bucket: &str, deleted: &Path) {
        let bucket_root = self.root.join(bucket);
        let mut dir = deleted.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == bucket_root || !d.starts_with(&bucket_root) {
                break;
            }
            if tokio::fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
    }
}

fn not_found_is_no_such_key(e: std::io::Error) -> S3Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        S3Error::new(S3ErrorCode::NoSuchKey)
    } else {
        e.into()
    }
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    async fn create_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        tokio::fs::create_dir_all(self.root.join(bucket)).await?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        match tokio::fs::remove_dir_all(self.root.join(bucket)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
    ) -> Result<(u64, String), S3Error> {
        let dest = self.object_path(bucket, key)?;
        let etag = etag_of(&data);
        self.write_via_temp(&dest, &data).await?;
        debug!("stored {}/{} ({} bytes)", bucket, key, data.len());
        Ok((data.len() as u64, etag))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, S3Error> {
        let path = self.object_path(bucket, key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(not_found_is_no_such_key)?;
        Ok(Bytes::from(data))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, S3Error> {
        let path = self.object_path(bucket, key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(not_found_is_no_such_key)?;
        Ok(meta.len())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_dirs(bucket, &path).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<String, S3Error> {
        let data = self.get_object(src_bucket, src_key).await?;
        let (_, etag) = self.put_object(dst_bucket, dst_key, data).await?;
        Ok(etag)
    }

    async fn put_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, S3Error> {
        let dest = self.upload_dir(upload_id).join(part_file_name(part_number));
        let etag = etag_of(&data);
        self.write_via_temp(&dest, &data).await?;
        Ok(etag)
    }

    async fn assemble_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[AssemblePart],
    ) -> Result<String, S3Error> {
        let dest = self.object_path(bucket, key)?;
        let upload_dir = self.upload_dir(upload_id);
        let temp = self.temp_path();

        let result = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            let mut part_etags = Vec::with_capacity(parts.len());
            for part in parts {
                let part_path = upload_dir.join(part_file_name(part.part_number));
                let part_data = tokio::fs::read(&part_path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        S3Error::new(S3ErrorCode::InvalidPart)
                    } else {
                        e.into()
                    }
                })?;
                part_etags.push(part.etag.clone());
                file.write_all(&part_data).await?;
            }
            file.sync_all().await?;
            drop(file);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&temp, &dest).await?;
            composite_etag(&part_etags)
        }
        .await;

        match result {
            Ok(etag) => {
                if let Err(e) = tokio::fs::remove_dir_all(&upload_dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("failed to remove part directory {}: {}", upload_dir.display(), e);
                    }
                }
                Ok(etag)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Err(e)
            }
        }
    }

    async fn delete_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), S3Error> {
        match tokio::fs::remove_dir_all(self.upload_dir(upload_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, S3Error> {
        let path = self.object_path(bucket, key)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    async fn health_check(&self) -> Result<(), S3Error> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(S3Error::with_message(
                S3ErrorCode::ServiceUnavailable,
                "storage root is not accessible",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> (tempfile::TempDir, LocalStorageBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalStorageBackend::new(dir.path()).unwrap();
        (dir, backend)
    }

    #[actix_web::test]
    async fn test_put_get_head_delete_round_trip() {
        let (_dir, backend) = test_backend();
        backend.create_bucket("b").await.unwrap();

        let (written, etag) = backend
            .put_object("b", "nested/key.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert_eq!(etag, "\"5d41402abc4b2a76b9719d911017c592\"");

        assert_eq!(
            backend.get_object("b", "nested/key.txt").await.unwrap(),
            Bytes::from_static(b"hello")
        );
        assert_eq!(backend.head_object("b", "nested/key.txt").await.unwrap(), 5);
        assert!(backend.exists("b", "nested/key.txt").await.unwrap());

        backend.delete_object("b", "nested/key.txt").await.unwrap();
        let err = backend.get_object("b", "nested/key.txt").await.unwrap_err();
        assert_eq!(err.code(), S3ErrorCode::NoSuchKey);
        // The intermediate directory was pruned, the bucket root remains.
        assert!(!_dir.path().join("b/nested").exists());
        assert!(_dir.path().join("b").exists());

        // Deleting again is success.
        backend.delete_object("b", "nested/key.txt").await.unwrap();
    }

    #[actix_web::test]
    async fn test_put_overwrites_atomically() {
        let (_dir, backend) = test_backend();
        backend.create_bucket("b").await.unwrap();
        backend
            .put_object("b", "k", Bytes::from_static(b"one"))
            .await
            .unwrap();
        backend
            .put_object("b", "k", Bytes::from_static(b"two"))
            .await
            .unwrap();
        assert_eq!(
            backend.get_object("b", "k").await.unwrap(),
            Bytes::from_static(b"two")
        );
    }

    #[actix_web::test]
    async fn test_key_traversal_is_rejected() {
        let (_dir, backend) = test_backend();
        let err = backend
            .put_object("b", "../escape", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), S3ErrorCode::InvalidArgument);
    }

    #[actix_web::test]
    async fn test_multipart_assemble_and_cleanup() {
        let (dir, backend) = test_backend();
        backend.create_bucket("b").await.unwrap();

        let etag1 = backend
            .put_part("b", "big", "upl1", 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let etag2 = backend
            .put_part("b", "big", "upl1", 2, Bytes::from_static(b"world"))
            .await
            .unwrap();

        let etag = backend
            .assemble_parts(
                "b",
                "big",
                "upl1",
                &[
                    AssemblePart {
                        part_number: 1,
                        etag: etag1.clone(),
                    },
                    AssemblePart {
                        part_number: 2,
                        etag: etag2.clone(),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(etag, composite_etag(&[etag1, etag2]).unwrap());
        assert_eq!(
            backend.get_object("b", "big").await.unwrap(),
            Bytes::from_static(b"hello world")
        );
        assert!(!dir.path().join(".multipart/upl1").exists());
    }

    #[actix_web::test]
    async fn test_assemble_missing_part_is_invalid_part() {
        let (_dir, backend) = test_backend();
        backend.create_bucket("b").await.unwrap();
        backend
            .put_part("b", "big", "upl1", 1, Bytes::from_static(b"data"))
            .await
            .unwrap();
        let err = backend
            .assemble_parts(
                "b",
                "big",
                "upl1",
                &[
                    AssemblePart {
                        part_number: 1,
                        etag: "\"e1\"".to_string(),
                    },
                    AssemblePart {
                        part_number: 2,
                        etag: "\"e2\"".to_string(),
                    },
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), S3ErrorCode::InvalidPart);
        // No final object appeared.
        assert!(!backend.exists("b", "big").await.unwrap());
    }

    #[actix_web::test]
    async fn test_delete_parts_is_idempotent() {
        let (_dir, backend) = test_backend();
        backend
            .put_part("b", "k", "upl1", 1, Bytes::from_static(b"data"))
            .await
            .unwrap();
        backend.delete_parts("b", "k", "upl1").await.unwrap();
        backend.delete_parts("b", "k", "upl1").await.unwrap();
    }

    #[test]
    fn test_startup_sweeps_orphaned_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".tmp")).unwrap();
        std::fs::write(dir.path().join(".tmp/leftover"), b"junk").unwrap();

        let _backend = LocalStorageBackend::new(dir.path()).unwrap();
        assert!(!dir.path().join(".tmp/leftover").exists());
    }
}
