//! Binary storage layer.
//!
//! A [`StorageBackend`] holds raw object bytes addressed by logical bucket
//! and key; the metadata store stays authoritative. Backends never expose
//! partially written objects: writes land in a staging area and become
//! visible atomically. Bytes without a metadata row are orphans and safe to
//! delete.

pub mod aws_store;
pub mod azure_store;
pub mod gcp_store;
pub mod local_store;
pub mod memory_store;
pub mod sqlite_store;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::{S3Error, S3ErrorCode};

/// Quoted lowercase-hex MD5 of a byte slice, the ETag of a whole put.
pub fn etag_of(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(md5::compute(data).0))
}

/// Composite ETag for an assembled multipart object:
/// `"hex(MD5(bin_md5_1 || ... || bin_md5_N))-N"`.
///
/// Input ETags are the stored per-part values (quoted hex).
pub fn composite_etag(part_etags: &[String]) -> Result<String, S3Error> {
    let mut ctx = md5::Context::new();
    for etag in part_etags {
        let digest = hex::decode(etag.trim_matches('"')).map_err(|_| {
            S3Error::with_message(S3ErrorCode::InternalError, "unparseable stored part etag")
        })?;
        ctx.consume(&digest);
    }
    Ok(format!(
        "\"{}-{}\"",
        hex::encode(ctx.compute().0),
        part_etags.len()
    ))
}

/// Zero-padded file/part-name form of a part number.
pub fn part_file_name(part_number: u32) -> String {
    format!("{:05}", part_number)
}

/// One part reference handed to [`StorageBackend::assemble_parts`]: the
/// staged part number plus its validated ETag from the metadata store.
#[derive(Debug, Clone)]
pub struct AssemblePart {
    pub part_number: u32,
    /// Quoted hex MD5 of the staged part bytes.
    pub etag: String,
}

/// Raw byte storage contract.
///
/// All methods are idempotent where S3 semantics require it: deleting a
/// missing object or the parts of an unknown upload succeeds.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reserve backend-side space for a bucket. No-op for gateways that
    /// fold everything into one upstream container.
    async fn create_bucket(&self, bucket: &str) -> Result<(), S3Error>;

    /// Release backend-side space for a bucket. Idempotent.
    async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error>;

    /// Durably store the object bytes. Returns `(bytes_written, etag)`.
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes)
        -> Result<(u64, String), S3Error>;

    /// Fetch the full object bytes. `NoSuchKey` if absent.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, S3Error>;

    /// Existence probe returning the stored size. `NoSuchKey` if absent.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, S3Error>;

    /// Remove the object bytes. Missing is success.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error>;

    /// Server-side copy. Returns the destination ETag, which always equals
    /// the plain MD5 of the copied bytes (composite sources flatten).
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<String, S3Error>;

    /// Stage one part of a multipart upload. Returns the part ETag.
    async fn put_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, S3Error>;

    /// Concatenate the staged parts, in the given order, into the final
    /// object and release the staging area. Returns the composite ETag,
    /// derived from the parts' validated ETags.
    async fn assemble_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[AssemblePart],
    ) -> Result<String, S3Error>;

    /// Drop all staged parts of an upload. Idempotent.
    async fn delete_parts(&self, bucket: &str, key: &str, upload_id: &str)
        -> Result<(), S3Error>;

    /// Whether object bytes exist for `(bucket, key)`.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, S3Error>;

    /// Probe the backend's availability.
    async fn health_check(&self) -> Result<(), S3Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_of_empty_is_the_md5_of_nothing() {
        assert_eq!(etag_of(b""), "\"d41d8cd98f00b204e9800998ecf8427e\"");
    }

    #[test]
    fn test_composite_etag_formula() {
        let part1 = etag_of(b"hello ");
        let part2 = etag_of(b"world");
        let composite = composite_etag(&[part1.clone(), part2.clone()]).unwrap();
        assert!(composite.starts_with('"'));
        assert!(composite.ends_with("-2\""));

        // Recompute by hand.
        let mut ctx = md5::Context::new();
        ctx.consume(md5::compute(b"hello ").0);
        ctx.consume(md5::compute(b"world").0);
        let expected = format!("\"{}-2\"", hex::encode(ctx.compute().0));
        assert_eq!(composite, expected);

        assert!(composite_etag(&["\"not-hex\"".to_string()]).is_err());
    }

    #[test]
    fn test_part_file_name_padding() {
        assert_eq!(part_file_name(1), "00001");
        assert_eq!(part_file_name(10000), "10000");
    }
}
