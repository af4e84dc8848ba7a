//! AWS S3 gateway storage backend.
//!
//! Proxies byte storage to one upstream S3 bucket. All logical buckets fold
//! into the upstream container as `<prefix><bucket>/<key>`; multipart parts
//! stage at `<prefix>.parts/<upload_id>/<NNNNN>`. ETags are always computed
//! locally so composite-ETag semantics match the local backend exactly,
//! whatever the upstream would report.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use log::{info, warn};

use crate::config::AwsStorageConfig;
use crate::errors::{S3Error, S3ErrorCode};
use crate::s3::uri_encode;
use crate::storage::{composite_etag, etag_of, part_file_name, AssemblePart, StorageBackend};

pub struct AwsStorageBackend {
    client: Client,
    /// The single upstream bucket.
    bucket: String,
    /// Key prefix namespacing everything this instance stores.
    prefix: String,
}

impl AwsStorageBackend {
    /// Build the SDK client. Explicit credentials from the config win;
    /// otherwise the default chain applies (`AWS_ACCESS_KEY_ID` /
    /// `AWS_SECRET_ACCESS_KEY` / `AWS_REGION` environment, profiles, IMDS).
    pub async fn new(cfg: &AwsStorageConfig) -> Result<Self, S3Error> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if !cfg.region.is_empty() {
            loader = loader.region(aws_config::Region::new(cfg.region.clone()));
        }
        if let Some(endpoint) = &cfg.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }
        if let (Some(ak), Some(sk)) = (&cfg.access_key_id, &cfg.secret_access_key) {
            let creds =
                aws_sdk_s3::config::Credentials::new(ak, sk, None, None, "bleepstore-config");
            loader = loader.credentials_provider(creds);
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(cfg.use_path_style)
            .build();
        let client = Client::from_conf(s3_config);
        info!(
            "aws gateway ready: upstream bucket {} prefix '{}'",
            cfg.bucket, cfg.prefix
        );
        Ok(AwsStorageBackend {
            client,
            bucket: cfg.bucket.clone(),
            prefix: cfg.prefix.clone(),
        })
    }

    fn object_key(&self, bucket: &str, key: &str) -> String {
        format!("{}{}/{}", self.prefix, bucket, key)
    }

    fn part_key(&self, upload_id: &str, part_number: u32) -> String {
        format!(
            "{}.parts/{}/{}",
            self.prefix,
            upload_id,
            part_file_name(part_number)
        )
    }

    async fn download(&self, upstream_key: &str) -> Result<Bytes, S3Error> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(upstream_key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_no_such_key()) == Some(true) {
                    S3Error::new(S3ErrorCode::NoSuchKey)
                } else {
                    upstream_error("get_object", &e)
                }
            })?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| upstream_error("get_object body", &e))?;
        Ok(data.into_bytes())
    }

    async fn upload(&self, upstream_key: &str, data: Bytes) -> Result<(), S3Error> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(upstream_key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| upstream_error("put_object", &e))?;
        Ok(())
    }

    /// Delete every upstream object below `key_prefix`, page by page.
    async fn delete_prefix(&self, key_prefix: &str) -> Result<(), S3Error> {
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(key_prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token.clone());
            }
            let page = req
                .send()
                .await
                .map_err(|e| upstream_error("list_objects_v2", &e))?;

            let identifiers: Vec<ObjectIdentifier> = page
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .filter_map(|k| ObjectIdentifier::builder().key(k).build().ok())
                .collect();
            if !identifiers.is_empty() {
                let delete = Delete::builder()
                    .set_objects(Some(identifiers))
                    .quiet(true)
                    .build()
                    .map_err(|e| upstream_error("delete batch build", &e))?;
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| upstream_error("delete_objects", &e))?;
            }
            continuation = page.next_continuation_token().map(String::from);
            if continuation.is_none() {
                break;
            }
        }
        Ok(())
    }
}

fn upstream_error(context: &str, e: &dyn std::fmt::Debug) -> S3Error {
    warn!("aws upstream failure during {}: {:?}", context, e);
    S3Error::with_message(S3ErrorCode::ServiceUnavailable, "upstream storage unavailable")
}

#[async_trait]
impl StorageBackend for AwsStorageBackend {
    async fn create_bucket(&self, _bucket: &str) -> Result<(), S3Error> {
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        self.delete_prefix(&format!("{}{}/", self.prefix, bucket)).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
    ) -> Result<(u64, String), S3Error> {
        // Upstream may report a different ETag (encryption at rest); the
        // locally computed MD5 is the authoritative one.
        let etag = etag_of(&data);
        let size = data.len() as u64;
        self.upload(&self.object_key(bucket, key), data).await?;
        Ok((size, etag))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, S3Error> {
        self.download(&self.object_key(bucket, key)).await
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, S3Error> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(bucket, key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_not_found()) == Some(true) {
                    S3Error::new(S3ErrorCode::NoSuchKey)
                } else {
                    upstream_error("head_object", &e)
                }
            })?;
        Ok(resp.content_length().unwrap_or(0) as u64)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(bucket, key))
            .send()
            .await
            .map_err(|e| upstream_error("delete_object", &e))?;
        Ok(())
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<String, S3Error> {
        let source = format!(
            "{}/{}",
            self.bucket,
            uri_encode(&self.object_key(src_bucket, src_key), false)
        );
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(self.object_key(dst_bucket, dst_key))
            .copy_source(source)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_object_not_in_active_tier_error())
                    == Some(true)
                    || format!("{:?}", e).contains("NoSuchKey");
                if not_found {
                    S3Error::new(S3ErrorCode::NoSuchKey)
                } else {
                    upstream_error("copy_object", &e)
                }
            })?;
        // Re-read the destination so the ETag is our own MD5, consistent
        // with every other backend.
        let data = self.download(&self.object_key(dst_bucket, dst_key)).await?;
        Ok(etag_of(&data))
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
        self.upload(&self.part_key(upload_id, part_number), data).await?;
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
        for part in parts {
            let data = self
                .download(&self.part_key(upload_id, part.part_number))
                .await
                .map_err(|e| {
                    if e.code() == S3ErrorCode::NoSuchKey {
                        S3Error::new(S3ErrorCode::InvalidPart)
                    } else {
                        e
                    }
                })?;
            part_etags.push(part.etag.clone());
            assembled.extend_from_slice(&data);
        }
        self.upload(&self.object_key(bucket, key), Bytes::from(assembled))
            .await?;
        self.delete_parts(bucket, key, upload_id).await?;
        composite_etag(&part_etags)
    }

    async fn delete_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), S3Error> {
        self.delete_prefix(&format!("{}.parts/{}/", self.prefix, upload_id))
            .await
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, S3Error> {
        match self.head_object(bucket, key).await {
            Ok(_) => Ok(true),
            Err(e) if e.code() == S3ErrorCode::NoSuchKey => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> Result<(), S3Error> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| upstream_error("head_bucket", &e))?;
        Ok(())
    }
}
