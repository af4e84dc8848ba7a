//! In-memory storage backend.
//!
//! Holds everything in process memory. Used by tests and suitable for
//! ephemeral deployments where durability is explicitly not wanted.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::{S3Error, S3ErrorCode};
use crate::storage::{composite_etag, etag_of, AssemblePart, StorageBackend};

#[derive(Default)]
pub struct MemoryStorageBackend {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    parts: Mutex<HashMap<(String, u32), Bytes>>,
}

impl MemoryStorageBackend {
    pub fn new() -> Self {
        MemoryStorageBackend::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorageBackend {
    async fn create_bucket(&self, _bucket: &str) -> Result<(), S3Error> {
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        self.objects
            .lock()
            .unwrap()
            .retain(|(b, _), _| b != bucket);
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
    ) -> Result<(u64, String), S3Error> {
        let etag = etag_of(&data);
        let size = data.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data);
        Ok((size, etag))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, S3Error> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| S3Error::new(S3ErrorCode::NoSuchKey))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, S3Error> {
        self.get_object(bucket, key).await.map(|d| d.len() as u64)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
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
        let etag = etag_of(&data);
        self.parts
            .lock()
            .unwrap()
            .insert((upload_id.to_string(), part_number), data);
        Ok(etag)
    }

    async fn assemble_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[AssemblePart],
    ) -> Result<String, S3Error> {
        let mut assembled = Vec::new();
        let mut part_etags = Vec::with_capacity(parts.len());
        {
            let staged = self.parts.lock().unwrap();
            for part in parts {
                let data = staged
                    .get(&(upload_id.to_string(), part.part_number))
                    .ok_or_else(|| S3Error::new(S3ErrorCode::InvalidPart))?;
                part_etags.push(part.etag.clone());
                assembled.extend_from_slice(data);
            }
        }
        self.put_object(bucket, key, Bytes::from(assembled)).await?;
        self.delete_parts(bucket, key, upload_id).await?;
        composite_etag(&part_etags)
    }

    async fn delete_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), S3Error> {
        self.parts
            .lock()
            .unwrap()
            .retain(|(id, _), _| id != upload_id);
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, S3Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn health_check(&self) -> Result<(), S3Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn test_round_trip_and_overwrite() {
        let backend = MemoryStorageBackend::new();
        backend
            .put_object("b", "k", Bytes::from_static(b"v1"))
            .await
            .unwrap();
        backend
            .put_object("b", "k", Bytes::from_static(b"v2"))
            .await
            .unwrap();
        assert_eq!(
            backend.get_object("b", "k").await.unwrap(),
            Bytes::from_static(b"v2")
        );

        backend.delete_object("b", "k").await.unwrap();
        assert!(!backend.exists("b", "k").await.unwrap());
        // Missing delete is success.
        backend.delete_object("b", "k").await.unwrap();
    }

    #[actix_web::test]
    async fn test_assemble_concatenates_in_requested_order() {
        let backend = MemoryStorageBackend::new();
        backend
            .put_part("b", "k", "u", 1, Bytes::from_static(b"BB"))
            .await
            .unwrap();
        backend
            .put_part("b", "k", "u", 2, Bytes::from_static(b"AA"))
            .await
            .unwrap();
        let spec: Vec<AssemblePart> = [(1u32, etag_of(b"BB")), (2u32, etag_of(b"AA"))]
            .into_iter()
            .map(|(part_number, etag)| AssemblePart { part_number, etag })
            .collect();
        backend.assemble_parts("b", "k", "u", &spec).await.unwrap();
        assert_eq!(
            backend.get_object("b", "k").await.unwrap(),
            Bytes::from_static(b"BBAA")
        );
        // Parts are gone after assembly.
        let err = backend
            .assemble_parts("b", "k2", "u", &spec[..1])
            .await
            .unwrap_err();
        assert_eq!(err.code(), S3ErrorCode::InvalidPart);
    }
}
