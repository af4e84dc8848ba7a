//! Azure Blob Storage gateway backend.
//!
//! Talks to the Blob REST API with a bearer token. Logical buckets fold
//! into one container as `<prefix><bucket>/<key>`. Multipart parts become
//! uncommitted *blocks* staged directly on the final blob, with block IDs
//! `base64("<upload_id>:<NNNNN>")`; completion commits a block list and
//! abort simply leaves the uncommitted blocks to expire upstream.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use log::{info, warn};

use crate::config::AzureStorageConfig;
use crate::errors::{S3Error, S3ErrorCode};
use crate::s3::uri_encode;
use crate::storage::{composite_etag, etag_of, part_file_name, AssemblePart, StorageBackend};
use crate::xml::XmlWriter;

const API_VERSION: &str = "2021-08-06";

pub struct AzureStorageBackend {
    http: reqwest::Client,
    container: String,
    prefix: String,
    token: String,
    base_url: String,
}

impl AzureStorageBackend {
    pub fn new(cfg: &AzureStorageConfig) -> Result<Self, S3Error> {
        let token = std::env::var("AZURE_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                S3Error::with_message(
                    S3ErrorCode::InternalError,
                    "no Azure access token configured (set AZURE_ACCESS_TOKEN)",
                )
            })?;
        let base_url = format!("https://{}.blob.core.windows.net", cfg.account);
        info!(
            "azure gateway ready: container {} prefix '{}'",
            cfg.container, cfg.prefix
        );
        Ok(AzureStorageBackend {
            http: reqwest::Client::new(),
            container: cfg.container.clone(),
            prefix: cfg.prefix.clone(),
            token,
            base_url,
        })
    }

    fn blob_name(&self, bucket: &str, key: &str) -> String {
        format!("{}{}/{}", self.prefix, bucket, key)
    }

    fn blob_url(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            self.container,
            uri_encode(name, false)
        )
    }

    fn block_id(upload_id: &str, part_number: u32) -> String {
        BASE64.encode(format!("{}:{}", upload_id, part_file_name(part_number)))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("x-ms-version", API_VERSION)
    }
}

fn upstream_error(context: &str, e: &dyn std::fmt::Display) -> S3Error {
    warn!("azure upstream failure during {}: {}", context, e);
    S3Error::with_message(S3ErrorCode::ServiceUnavailable, "upstream storage unavailable")
}

async fn expect_success(
    context: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, S3Error> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    warn!("azure {} returned {}: {}", context, status, body);
    if status.is_server_error() {
        Err(S3Error::with_message(
            S3ErrorCode::ServiceUnavailable,
            "upstream storage unavailable",
        ))
    } else {
        Err(S3Error::new(S3ErrorCode::InternalError))
    }
}

#[async_trait]
impl StorageBackend for AzureStorageBackend {
    async fn create_bucket(&self, _bucket: &str) -> Result<(), S3Error> {
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        // Enumerate blobs below the folded prefix and delete each.
        let mut marker: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/{}?restype=container&comp=list&prefix={}",
                self.base_url,
                self.container,
                uri_encode(&format!("{}{}/", self.prefix, bucket), true)
            );
            if let Some(m) = &marker {
                url.push_str("&marker=");
                url.push_str(&uri_encode(m, true));
            }
            let resp = self
                .request(reqwest::Method::GET, &url)
                .send()
                .await
                .map_err(|e| upstream_error("list", &e))?;
            let resp = expect_success("list", resp).await?;
            let body = resp.text().await.map_err(|e| upstream_error("list body", &e))?;
            for name in crate::xml::extract_tag_blocks(&body, "Name") {
                self.delete_object_by_name(&crate::xml::unescape(&name)).await?;
            }
            marker = crate::xml::extract_tag(&body, "NextMarker").filter(|m| !m.is_empty());
            if marker.is_none() {
                break;
            }
        }
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
        let resp = self
            .request(reqwest::Method::PUT, &self.blob_url(&self.blob_name(bucket, key)))
            .header("x-ms-blob-type", "BlockBlob")
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| upstream_error("put_blob", &e))?;
        expect_success("put_blob", resp).await?;
        Ok((size, etag))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, S3Error> {
        let resp = self
            .request(reqwest::Method::GET, &self.blob_url(&self.blob_name(bucket, key)))
            .send()
            .await
            .map_err(|e| upstream_error("get_blob", &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(S3Error::new(S3ErrorCode::NoSuchKey));
        }
        let resp = expect_success("get_blob", resp).await?;
        resp.bytes()
            .await
            .map_err(|e| upstream_error("get_blob body", &e))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, S3Error> {
        let resp = self
            .request(reqwest::Method::HEAD, &self.blob_url(&self.blob_name(bucket, key)))
            .send()
            .await
            .map_err(|e| upstream_error("head_blob", &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(S3Error::new(S3ErrorCode::NoSuchKey));
        }
        let resp = expect_success("head_blob", resp).await?;
        Ok(resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error> {
        self.delete_object_by_name(&self.blob_name(bucket, key)).await
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<String, S3Error> {
        // Same-account copy through the data path keeps the semantics
        // synchronous; the async x-ms-copy-source path would leave the
        // destination pending at return time.
        let data = self.get_object(src_bucket, src_key).await?;
        let (_, etag) = self.put_object(dst_bucket, dst_key, data).await?;
        Ok(etag)
    }

    async fn put_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, S3Error> {
        let etag = etag_of(&data);
        let url = format!(
            "{}?comp=block&blockid={}",
            self.blob_url(&self.blob_name(bucket, key)),
            uri_encode(&Self::block_id(upload_id, part_number), true)
        );
        let resp = self
            .request(reqwest::Method::PUT, &url)
            .body(data)
            .send()
            .await
            .map_err(|e| upstream_error("stage_block", &e))?;
        expect_success("stage_block", resp).await?;
        Ok(etag)
    }

    async fn assemble_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[AssemblePart],
    ) -> Result<String, S3Error> {
        let mut w = XmlWriter::new();
        w.declaration();
        w.open("BlockList");
        for part in parts {
            w.element("Latest", &Self::block_id(upload_id, part.part_number));
        }
        w.close("BlockList");

        let url = format!(
            "{}?comp=blocklist",
            self.blob_url(&self.blob_name(bucket, key))
        );
        let resp = self
            .request(reqwest::Method::PUT, &url)
            .header("content-type", "application/xml")
            .body(w.finish())
            .send()
            .await
            .map_err(|e| upstream_error("commit_block_list", &e))?;
        if resp.status() == reqwest::StatusCode::BAD_REQUEST {
            // The service rejects a list referencing a block it never saw.
            return Err(S3Error::new(S3ErrorCode::InvalidPart));
        }
        expect_success("commit_block_list", resp).await?;

        let part_etags: Vec<String> = parts.iter().map(|p| p.etag.clone()).collect();
        composite_etag(&part_etags)
    }

    async fn delete_parts(
        &self,
        _bucket: &str,
        _key: &str,
        _upload_id: &str,
    ) -> Result<(), S3Error> {
        // Uncommitted blocks cannot be deleted individually; the service
        // garbage-collects them after a week.
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, S3Error> {
        match self.head_object(bucket, key).await {
            Ok(_) => Ok(true),
            Err(e) if e.code() == S3ErrorCode::NoSuchKey => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> Result<(), S3Error> {
        let url = format!(
            "{}/{}?restype=container",
            self.base_url, self.container
        );
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| upstream_error("health", &e))?;
        expect_success("health", resp).await?;
        Ok(())
    }
}

impl AzureStorageBackend {
    async fn delete_object_by_name(&self, name: &str) -> Result<(), S3Error> {
        let resp = self
            .request(reqwest::Method::DELETE, &self.blob_url(name))
            .send()
            .await
            .map_err(|e| upstream_error("delete_blob", &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_success("delete_blob", resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_ids_are_fixed_width() {
        let a = AzureStorageBackend::block_id("upl", 1);
        let b = AzureStorageBackend::block_id("upl", 10000);
        // The service requires every block id of a blob to have equal length.
        assert_eq!(a.len(), b.len());
        assert_eq!(BASE64.decode(&a).unwrap(), b"upl:00001");
    }
}
