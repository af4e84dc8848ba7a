//! Google Cloud Storage gateway backend.
//!
//! Talks to the GCS JSON API over HTTPS with a bearer token. All logical
//! buckets fold into one upstream bucket as `<prefix><bucket>/<key>`, parts
//! stage at `<prefix>.parts/<upload_id>/<NNNNN>`. Assembly uses the native
//! `compose` operation, chaining intermediate compositions when an upload
//! has more than the 32 sources compose accepts.

use async_trait::async_trait;
use bytes::Bytes;
use log::{info, warn};

use crate::config::GcpStorageConfig;
use crate::errors::{S3Error, S3ErrorCode};
use crate::s3::uri_encode;
use crate::storage::{composite_etag, etag_of, part_file_name, AssemblePart, StorageBackend};

/// Compose accepts at most this many source objects per call.
const COMPOSE_LIMIT: usize = 32;

pub struct GcpStorageBackend {
    http: reqwest::Client,
    bucket: String,
    prefix: String,
    token: String,
    base_url: String,
}

impl GcpStorageBackend {
    pub fn new(cfg: &GcpStorageConfig) -> Result<Self, S3Error> {
        let token = resolve_token(cfg)?;
        info!("gcs gateway ready: upstream bucket {} prefix '{}'", cfg.bucket, cfg.prefix);
        Ok(GcpStorageBackend {
            http: reqwest::Client::new(),
            bucket: cfg.bucket.clone(),
            prefix: cfg.prefix.clone(),
            token,
            base_url: "https://storage.googleapis.com".to_string(),
        })
    }

    fn object_name(&self, bucket: &str, key: &str) -> String {
        format!("{}{}/{}", self.prefix, bucket, key)
    }

    fn part_name(&self, upload_id: &str, part_number: u32) -> String {
        format!(
            "{}.parts/{}/{}",
            self.prefix,
            upload_id,
            part_file_name(part_number)
        )
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            self.bucket,
            uri_encode(name, true)
        )
    }

    async fn upload(&self, name: &str, data: Bytes) -> Result<(), S3Error> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.base_url,
            self.bucket,
            uri_encode(name, true)
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| upstream_error("upload", &e))?;
        expect_success("upload", resp).await?;
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Bytes, S3Error> {
        let url = format!("{}?alt=media", self.object_url(name));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| upstream_error("download", &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(S3Error::new(S3ErrorCode::NoSuchKey));
        }
        let resp = expect_success("download", resp).await?;
        resp.bytes()
            .await
            .map_err(|e| upstream_error("download body", &e))
    }

    async fn object_size(&self, name: &str) -> Result<u64, S3Error> {
        let resp = self
            .http
            .get(self.object_url(name))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| upstream_error("stat", &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(S3Error::new(S3ErrorCode::NoSuchKey));
        }
        let resp = expect_success("stat", resp).await?;
        let meta: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| upstream_error("stat body", &e))?;
        Ok(meta["size"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    async fn delete(&self, name: &str) -> Result<(), S3Error> {
        let resp = self
            .http
            .delete(self.object_url(name))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| upstream_error("delete", &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_success("delete", resp).await?;
        Ok(())
    }

    /// Compose `sources` (≤32) into `dest`, all within the upstream bucket.
    async fn compose(&self, dest: &str, sources: &[String]) -> Result<(), S3Error> {
        let body = serde_json::json!({
            "sourceObjects": sources
                .iter()
                .map(|name| serde_json::json!({ "name": name }))
                .collect::<Vec<_>>(),
            "destination": { "contentType": "application/octet-stream" },
        });
        let url = format!("{}/compose", self.object_url(dest));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| upstream_error("compose", &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(S3Error::new(S3ErrorCode::InvalidPart));
        }
        expect_success("compose", resp).await?;
        Ok(())
    }

    /// List all upstream object names below `name_prefix`.
    async fn list_prefix(&self, name_prefix: &str) -> Result<Vec<String>, S3Error> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/storage/v1/b/{}/o?prefix={}",
                self.base_url,
                self.bucket,
                uri_encode(name_prefix, true)
            );
            if let Some(token) = &page_token {
                url.push_str("&pageToken=");
                url.push_str(&uri_encode(token, true));
            }
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| upstream_error("list", &e))?;
            let resp = expect_success("list", resp).await?;
            let listing: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| upstream_error("list body", &e))?;
            if let Some(items) = listing["items"].as_array() {
                for item in items {
                    if let Some(name) = item["name"].as_str() {
                        names.push(name.to_string());
                    }
                }
            }
            page_token = listing["nextPageToken"].as_str().map(String::from);
            if page_token.is_none() {
                break;
            }
        }
        Ok(names)
    }
}

fn resolve_token(cfg: &GcpStorageConfig) -> Result<String, S3Error> {
    for var in ["GCS_ACCESS_TOKEN", "GOOGLE_ACCESS_TOKEN"] {
        if let Ok(token) = std::env::var(var) {
            if !token.is_empty() {
                return Ok(token);
            }
        }
    }
    if let Some(path) = &cfg.credentials_file {
        let token = std::fs::read_to_string(path)?;
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }
    Err(S3Error::with_message(
        S3ErrorCode::InternalError,
        "no GCS access token configured",
    ))
}

fn upstream_error(context: &str, e: &dyn std::fmt::Display) -> S3Error {
    warn!("gcs upstream failure during {}: {}", context, e);
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
    warn!("gcs {} returned {}: {}", context, status, body);
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
impl StorageBackend for GcpStorageBackend {
    async fn create_bucket(&self, _bucket: &str) -> Result<(), S3Error> {
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        for name in self
            .list_prefix(&format!("{}{}/", self.prefix, bucket))
            .await?
        {
            self.delete(&name).await?;
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
        self.upload(&self.object_name(bucket, key), data).await?;
        Ok((size, etag))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, S3Error> {
        self.download(&self.object_name(bucket, key)).await
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, S3Error> {
        self.object_size(&self.object_name(bucket, key)).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error> {
        self.delete(&self.object_name(bucket, key)).await
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<String, S3Error> {
        let src = self.object_name(src_bucket, src_key);
        let dst = self.object_name(dst_bucket, dst_key);
        // rewriteTo may return a continuation token for large objects;
        // keep calling until the copy reports done.
        let url = format!(
            "{}/rewriteTo/b/{}/o/{}",
            self.object_url(&src),
            self.bucket,
            uri_encode(&dst, true)
        );
        let mut rewrite_token: Option<String> = None;
        loop {
            let mut call = url.clone();
            if let Some(token) = &rewrite_token {
                call.push_str("?rewriteToken=");
                call.push_str(&uri_encode(token, true));
            }
            let resp = self
                .http
                .post(&call)
                .bearer_auth(&self.token)
                .header("content-length", "0")
                .send()
                .await
                .map_err(|e| upstream_error("rewrite", &e))?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(S3Error::new(S3ErrorCode::NoSuchKey));
            }
            let resp = expect_success("rewrite", resp).await?;
            let status: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| upstream_error("rewrite body", &e))?;
            if status["done"].as_bool().unwrap_or(true) {
                break;
            }
            rewrite_token = status["rewriteToken"].as_str().map(String::from);
            if rewrite_token.is_none() {
                break;
            }
        }
        // The ETag is our own MD5 of the destination bytes, consistent with
        // the local backend.
        let data = self.download(&dst).await?;
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
        self.upload(&self.part_name(upload_id, part_number), data)
            .await?;
        Ok(etag)
    }

    async fn assemble_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[AssemblePart],
    ) -> Result<String, S3Error> {
        let final_name = self.object_name(bucket, key);
        let part_names: Vec<String> = parts
            .iter()
            .map(|p| self.part_name(upload_id, p.part_number))
            .collect();

        if part_names.len() <= COMPOSE_LIMIT {
            self.compose(&final_name, &part_names).await?;
        } else {
            // Fold: compose the first 32 into an accumulator, then repeat
            // with the accumulator as the leading source.
            let acc_name = format!("{}.parts/{}/compose-acc", self.prefix, upload_id);
            let mut iter = part_names.iter().cloned();
            let first: Vec<String> = iter.by_ref().take(COMPOSE_LIMIT).collect();
            self.compose(&acc_name, &first).await?;
            loop {
                let mut sources = vec![acc_name.clone()];
                sources.extend(iter.by_ref().take(COMPOSE_LIMIT - 1));
                if sources.len() == 1 {
                    break;
                }
                self.compose(&acc_name, &sources).await?;
            }
            self.compose(&final_name, &[acc_name.clone()]).await?;
        }

        self.delete_parts(bucket, key, upload_id).await?;
        let part_etags: Vec<String> = parts.iter().map(|p| p.etag.clone()).collect();
        composite_etag(&part_etags)
    }

    async fn delete_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), S3Error> {
        for name in self
            .list_prefix(&format!("{}.parts/{}/", self.prefix, upload_id))
            .await?
        {
            self.delete(&name).await?;
        }
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
        let url = format!("{}/storage/v1/b/{}", self.base_url, self.bucket);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| upstream_error("health", &e))?;
        expect_success("health", resp).await?;
        Ok(())
    }
}
