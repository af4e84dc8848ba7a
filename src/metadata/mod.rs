//! Metadata storage layer.
//!
//! The metadata store is the authoritative index: an object exists for
//! clients exactly when its row exists here, whatever bytes the storage
//! backend may hold. Implementations must be thread-safe; the multipart
//! completion, abort and batch-delete operations must be transactional.

pub mod sqlite_store;

use std::collections::HashMap;

use crate::errors::S3Error;

/// A bucket row.
#[derive(Debug, Clone)]
pub struct BucketRecord {
    pub name: String,
    /// ISO 8601 creation timestamp with milliseconds.
    pub creation_date: String,
    pub region: String,
    pub owner_id: String,
    pub owner_display: String,
    /// ACL grants, serialized as one JSON blob.
    pub acl_json: String,
}

/// An object row.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    /// Quoted ETag, `"hex"` or `"hex-N"` for multipart-completed objects.
    pub etag: String,
    pub content_type: String,
    /// ISO 8601 with milliseconds, server-assigned.
    pub last_modified: String,
    pub storage_class: String,
    pub acl_json: String,
    /// Lowercased `x-amz-meta-*` suffix → value.
    pub user_metadata: HashMap<String, String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub expires: Option<String>,
}

/// An in-progress multipart upload row. Carries every header that will be
/// copied onto the completed object, captured at creation time.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    /// ISO 8601 with milliseconds.
    pub initiated: String,
    pub content_type: String,
    pub user_metadata: HashMap<String, String>,
    pub acl_json: String,
    pub owner_id: String,
    pub owner_display: String,
    pub storage_class: String,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub expires: Option<String>,
}

/// One uploaded part of a multipart upload.
#[derive(Debug, Clone)]
pub struct PartRecord {
    pub part_number: u32,
    pub size: u64,
    /// Quoted MD5 of the part bytes.
    pub etag: String,
    /// ISO 8601 with milliseconds.
    pub stored_at: String,
}

/// A SigV4 credential row.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub access_key_id: String,
    pub secret_key: String,
    pub owner_id: String,
    pub active: bool,
}

/// Parameters for an object listing. The caller resolves the v1/v2 marker
/// variants into a single effective `start_after` before calling.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsQuery {
    pub prefix: String,
    pub delimiter: String,
    /// Keys strictly greater than this are returned.
    pub start_after: String,
    pub max_keys: u32,
}

/// One page of an object listing.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsPage {
    pub objects: Vec<ObjectRecord>,
    /// De-duplicated, in encounter order.
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Last emitted entry (object key or common prefix) when truncated.
    pub next_token: Option<String>,
}

/// One page of a multipart upload listing.
#[derive(Debug, Clone, Default)]
pub struct ListUploadsPage {
    pub uploads: Vec<UploadRecord>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
}

/// One page of a parts listing.
#[derive(Debug, Clone, Default)]
pub struct ListPartsPage {
    pub parts: Vec<PartRecord>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

/// Authoritative metadata index contract.
///
/// All write methods are durable when they return. Errors surface as
/// [`S3Error`] so the store can speak `NoSuchBucket`/`BucketNotEmpty`
/// directly where the condition is only visible inside a transaction.
pub trait MetadataStore: Send + Sync {
    // -- Buckets --

    /// Insert a bucket row. Fails with `BucketAlreadyExists` on conflict.
    fn create_bucket(&self, record: &BucketRecord) -> Result<(), S3Error>;

    /// Delete a bucket. Fails with `BucketNotEmpty` while objects remain
    /// and `NoSuchBucket` when absent.
    fn delete_bucket(&self, name: &str) -> Result<(), S3Error>;

    fn get_bucket(&self, name: &str) -> Result<Option<BucketRecord>, S3Error>;

    fn bucket_exists(&self, name: &str) -> Result<bool, S3Error>;

    /// All buckets ordered by name.
    fn list_buckets(&self) -> Result<Vec<BucketRecord>, S3Error>;

    fn update_bucket_acl(&self, name: &str, acl_json: &str) -> Result<(), S3Error>;

    // -- Objects --

    /// Upsert: replaces any existing row for the same `(bucket, key)`.
    fn put_object(&self, record: &ObjectRecord) -> Result<(), S3Error>;

    fn get_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectRecord>, S3Error>;

    /// Delete one object row. Returns whether a row was present; never
    /// fails for a missing key.
    fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, S3Error>;

    /// Batch delete within one transaction per chunk. Returns the keys
    /// whose rows were present and removed.
    fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<String>, S3Error>;

    /// Ordered prefix/delimiter listing, see [`ListObjectsQuery`].
    fn list_objects(
        &self,
        bucket: &str,
        query: &ListObjectsQuery,
    ) -> Result<ListObjectsPage, S3Error>;

    fn update_object_acl(&self, bucket: &str, key: &str, acl_json: &str) -> Result<(), S3Error>;

    // -- Multipart uploads --

    fn create_upload(&self, record: &UploadRecord) -> Result<(), S3Error>;

    fn get_upload(&self, upload_id: &str) -> Result<Option<UploadRecord>, S3Error>;

    /// Delete the upload row and all its parts in one transaction.
    fn abort_upload(&self, upload_id: &str) -> Result<(), S3Error>;

    /// Upsert on `(upload_id, part_number)`.
    fn put_part(&self, upload_id: &str, part: &PartRecord) -> Result<(), S3Error>;

    fn list_parts(
        &self,
        upload_id: &str,
        part_number_marker: u32,
        max_parts: u32,
    ) -> Result<ListPartsPage, S3Error>;

    /// All parts of an upload in ascending part-number order.
    fn get_parts_for_completion(&self, upload_id: &str) -> Result<Vec<PartRecord>, S3Error>;

    /// Atomically publish the completed object: insert/replace the object
    /// row and delete the upload row with all its parts. Either everything
    /// commits or nothing does.
    fn complete_upload(
        &self,
        upload_id: &str,
        final_object: &ObjectRecord,
    ) -> Result<(), S3Error>;

    fn list_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: &str,
        upload_id_marker: &str,
        max_uploads: u32,
    ) -> Result<ListUploadsPage, S3Error>;

    /// Remove uploads older than `max_age_seconds`, cascading to their
    /// parts. Returns the removed upload records so the caller can release
    /// backend storage.
    fn reap_expired_uploads(&self, max_age_seconds: u64) -> Result<Vec<UploadRecord>, S3Error>;

    // -- Credentials --

    /// Look up an active credential. Inactive rows read as absent.
    fn get_credential(&self, access_key_id: &str) -> Result<Option<CredentialRecord>, S3Error>;

    /// Upsert a credential row.
    fn put_credential(&self, record: &CredentialRecord) -> Result<(), S3Error>;

    /// Idempotent startup insert; an existing row is left untouched.
    fn seed_credential(&self, record: &CredentialRecord) -> Result<(), S3Error>;

    // -- Counts --

    fn count_buckets(&self) -> Result<u64, S3Error>;

    /// Total object rows across all buckets.
    fn count_objects(&self) -> Result<u64, S3Error>;
}
