//! S3 request dispatch.
//!
//! A single entry point receives every request and routes on the tuple
//! `(method, path depth, significant query flags)`. The entry point owns
//! the cross-cutting steps: body buffering, SigV4 verification, the common
//! response headers, error rendering and the request counters. Handlers
//! return `Result<HttpResponse, S3Error>` and never render errors
//! themselves.

pub mod bucket;
pub mod multipart;
pub mod object;

use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::app_state::AppState;
use crate::errors::{S3Error, S3ErrorCode};
use crate::metadata::BucketRecord;
use crate::s3::acl::Acl;
use crate::s3::auth::{AuthContext, RequestInfo};
use crate::s3::{generate_amz_id2, generate_request_id, http_date, uri_decode, uri_encode};
use crate::xml::XmlWriter;

/// Namespace stamped on every non-error response document.
pub const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Everything a handler needs about the current request.
pub struct S3Request<'a> {
    pub state: &'a AppState,
    pub auth: AuthContext,
    /// Decoded query pairs in arrival order.
    pub query: Vec<(String, String)>,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    /// `/bucket/key` as received, for error bodies.
    pub resource: String,
    /// The id stamped on this response as `x-amz-request-id`.
    pub request_id: String,
}

impl S3Request<'_> {
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_query(&self, name: &str) -> bool {
        self.query.iter().any(|(n, _)| n == name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn err(&self, code: S3ErrorCode) -> S3Error {
        S3Error::new(code).resource(self.resource.clone())
    }
}

/// Catch-all service entry: authenticate, dispatch, stamp, render.
pub async fn entry(
    req: HttpRequest,
    mut payload: web::Payload,
    state: web::Data<AppState>,
) -> HttpResponse {
    let request_id = generate_request_id();
    let amz_id2 = generate_amz_id2();
    let is_head = req.method() == actix_web::http::Method::HEAD;

    let (operation, result) = handle(&req, &mut payload, &state, &request_id).await;
    state.metrics.record_request(operation, body_len_hint(&req));

    let mut response = match result {
        Ok(response) => response,
        Err(error) => {
            debug!(
                "{} {} -> {} ({})",
                req.method(),
                req.path(),
                error.code().as_str(),
                request_id
            );
            if is_head {
                // HEAD errors carry status and headers only.
                HttpResponse::build(error.code().status()).finish()
            } else {
                error.to_response(&request_id)
            }
        }
    };

    let headers = response.headers_mut();
    insert_header(headers, "x-amz-request-id", &request_id);
    insert_header(headers, "x-amz-id-2", &amz_id2);
    insert_header(headers, "date", &http_date(Utc::now()));
    insert_header(headers, "server", "BleepStore");
    if !headers.contains_key("content-type") {
        insert_header(headers, "content-type", "application/xml");
    }
    response
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn body_len_hint(req: &HttpRequest) -> u64 {
    req.headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Authenticate and route. Returns the operation name for the counters
/// together with the handler outcome.
async fn handle(
    req: &HttpRequest,
    payload: &mut web::Payload,
    state: &AppState,
    request_id: &str,
) -> (&'static str, Result<HttpResponse, S3Error>) {
    let body = match read_body(payload, state.config.server.max_body_size).await {
        Ok(body) => body,
        Err(e) => return ("InvalidRequest", Err(e)),
    };

    // Path split happens on the raw request line; bucket and key decode
    // exactly once.
    let raw_path = req.path().trim_start_matches('/');
    let (bucket_raw, key_raw) = match raw_path.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (raw_path, ""),
    };
    let decode = |s: &str| {
        uri_decode(s).ok_or_else(|| {
            S3Error::with_message(S3ErrorCode::InvalidArgument, "unparseable request path")
        })
    };
    let bucket = match decode(bucket_raw) {
        Ok(b) => b,
        Err(e) => return ("InvalidRequest", Err(e)),
    };
    let key = match decode(key_raw) {
        Ok(k) => k,
        Err(e) => return ("InvalidRequest", Err(e)),
    };

    let auth = {
        let headers: Vec<(String, String)> = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body_sha256 = hex::encode(Sha256::digest(&body));
        let info = RequestInfo {
            method: req.method().as_str(),
            raw_path: req.path(),
            raw_query: req.query_string(),
            headers,
            body_sha256: &body_sha256,
        };
        match state
            .authenticator
            .authenticate(state.metadata.as_ref(), &info, Utc::now())
        {
            Ok(auth) => auth,
            Err(e) => return ("AccessDenied", Err(e.resource(req.path().to_string()))),
        }
    };

    let query = match crate::s3::auth::parse_query_pairs(req.query_string()) {
        Ok(query) => query,
        Err(e) => return ("InvalidRequest", Err(e)),
    };
    let request = S3Request {
        state,
        auth,
        query,
        headers: req.headers(),
        body,
        resource: req.path().to_string(),
        request_id: request_id.to_string(),
    };

    use actix_web::http::Method;
    let method = req.method();
    let method_not_allowed = || {
        (
            "MethodNotAllowed",
            Err(S3Error::new(S3ErrorCode::MethodNotAllowed).resource(req.path().to_string())),
        )
    };

    if bucket.is_empty() {
        return if method == Method::GET {
            ("ListBuckets", bucket::list_buckets(&request).await)
        } else {
            method_not_allowed()
        };
    }

    if key.is_empty() {
        return if method == Method::GET {
            if request.has_query("location") {
                (
                    "GetBucketLocation",
                    bucket::get_bucket_location(&request, &bucket).await,
                )
            } else if request.has_query("acl") {
                ("GetBucketAcl", bucket::get_bucket_acl(&request, &bucket).await)
            } else if request.has_query("uploads") {
                (
                    "ListMultipartUploads",
                    multipart::list_multipart_uploads(&request, &bucket).await,
                )
            } else if request.query_value("list-type") == Some("2") {
                ("ListObjectsV2", bucket::list_objects_v2(&request, &bucket).await)
            } else {
                ("ListObjects", bucket::list_objects_v1(&request, &bucket).await)
            }
        } else if method == Method::PUT {
            if request.has_query("acl") {
                ("PutBucketAcl", bucket::put_bucket_acl(&request, &bucket).await)
            } else {
                ("CreateBucket", bucket::create_bucket(&request, &bucket).await)
            }
        } else if method == Method::DELETE {
            ("DeleteBucket", bucket::delete_bucket(&request, &bucket).await)
        } else if method == Method::HEAD {
            ("HeadBucket", bucket::head_bucket(&request, &bucket).await)
        } else if method == Method::POST && request.has_query("delete") {
            ("DeleteObjects", bucket::delete_objects(&request, &bucket).await)
        } else {
            method_not_allowed()
        };
    }

    if method == Method::PUT {
        let has_copy_source = request.header("x-amz-copy-source").is_some();
        let has_part = request.has_query("partNumber") && request.has_query("uploadId");
        if has_copy_source && has_part {
            (
                "UploadPartCopy",
                multipart::upload_part_copy(&request, &bucket, &key).await,
            )
        } else if has_part {
            ("UploadPart", multipart::upload_part(&request, &bucket, &key).await)
        } else if has_copy_source {
            ("CopyObject", object::copy_object(&request, &bucket, &key).await)
        } else if request.has_query("acl") {
            ("PutObjectAcl", object::put_object_acl(&request, &bucket, &key).await)
        } else {
            ("PutObject", object::put_object(&request, &bucket, &key).await)
        }
    } else if method == Method::GET {
        if request.has_query("acl") {
            ("GetObjectAcl", object::get_object_acl(&request, &bucket, &key).await)
        } else if request.has_query("uploadId") {
            ("ListParts", multipart::list_parts(&request, &bucket, &key).await)
        } else {
            ("GetObject", object::get_object(&request, &bucket, &key, false).await)
        }
    } else if method == Method::HEAD {
        (
            "HeadObject",
            object::get_object(&request, &bucket, &key, true).await,
        )
    } else if method == Method::DELETE {
        if request.has_query("uploadId") {
            (
                "AbortMultipartUpload",
                multipart::abort_multipart_upload(&request, &bucket, &key).await,
            )
        } else {
            ("DeleteObject", object::delete_object(&request, &bucket, &key).await)
        }
    } else if method == Method::POST {
        if request.has_query("uploads") {
            (
                "CreateMultipartUpload",
                multipart::create_multipart_upload(&request, &bucket, &key).await,
            )
        } else if request.has_query("uploadId") {
            (
                "CompleteMultipartUpload",
                multipart::complete_multipart_upload(&request, &bucket, &key).await,
            )
        } else {
            method_not_allowed()
        }
    } else {
        method_not_allowed()
    }
}

/// Buffer the request body up to the HTTP-layer cap.
async fn read_body(payload: &mut web::Payload, limit: usize) -> Result<Bytes, S3Error> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| {
            warn!("error reading request body: {}", e);
            S3Error::with_message(S3ErrorCode::InvalidRequest, "error reading request body")
        })?;
        if buf.len() + chunk.len() > limit {
            return Err(S3Error::with_message(
                S3ErrorCode::EntityTooLarge,
                "request body exceeds the configured limit",
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

// -- Shared handler helpers --------------------------------------------------

/// Look up the bucket row or fail with `NoSuchBucket`.
pub fn require_bucket(request: &S3Request<'_>, bucket: &str) -> Result<BucketRecord, S3Error> {
    request
        .state
        .metadata
        .get_bucket(bucket)?
        .ok_or_else(|| request.err(S3ErrorCode::NoSuchBucket))
}

/// Enforce the 1024-byte key limit.
pub fn validate_key(request: &S3Request<'_>, key: &str) -> Result<(), S3Error> {
    if key.len() > 1024 {
        return Err(request.err(S3ErrorCode::KeyTooLongError));
    }
    Ok(())
}

/// S3 bucket naming rules: 3-63 characters of lowercase letters, digits,
/// hyphens and dots; label structure; no IP-address form.
pub fn validate_bucket_name(name: &str) -> bool {
    if name.len() < 3 || name.len() > 63 {
        return false;
    }
    let bytes = name.as_bytes();
    if !bytes[0].is_ascii_lowercase() && !bytes[0].is_ascii_digit() {
        return false;
    }
    if !bytes[bytes.len() - 1].is_ascii_lowercase() && !bytes[bytes.len() - 1].is_ascii_digit() {
        return false;
    }
    let mut prev = 0u8;
    for &b in bytes {
        match b {
            b'a'..=b'z' | b'0'..=b'9' => {}
            b'-' | b'.' => {
                if prev == b'.' || prev == b'-' {
                    return false;
                }
            }
            _ => return false,
        }
        prev = b;
    }
    // Reject dotted-quad names.
    if name.split('.').count() == 4 && name.split('.').all(|p| p.parse::<u8>().is_ok()) {
        return false;
    }
    true
}

/// Collect `x-amz-meta-*` headers, lowercased, suffix-keyed.
pub fn extract_user_metadata(
    headers: &HeaderMap,
) -> std::collections::HashMap<String, String> {
    let mut meta = std::collections::HashMap::new();
    for (name, value) in headers.iter() {
        let name = name.as_str();
        if let Some(suffix) = name.strip_prefix("x-amz-meta-") {
            if let Ok(value) = value.to_str() {
                meta.insert(suffix.to_string(), value.to_string());
            }
        }
    }
    meta
}

/// The Content-Type stored on an object, defaulting to octet-stream.
pub fn extract_content_type(headers: &HeaderMap) -> String {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Resolve the ACL for a write: canned `x-amz-acl` header, or the owner's
/// private default. Explicit `x-amz-grant-*` headers are not supported.
pub fn resolve_request_acl(request: &S3Request<'_>) -> Result<Acl, S3Error> {
    if request
        .headers
        .iter()
        .any(|(name, _)| name.as_str().starts_with("x-amz-grant-"))
    {
        return Err(S3Error::with_message(
            S3ErrorCode::NotImplemented,
            "explicit grant headers are not supported",
        ));
    }
    match request.header("x-amz-acl") {
        Some(canned) => Acl::from_canned(canned, &request.auth.owner_id, &request.auth.owner_display),
        None => Ok(Acl::private(
            &request.auth.owner_id,
            &request.auth.owner_display,
        )),
    }
}

/// Validate a `Content-MD5` header against the payload when present.
pub fn check_content_md5(request: &S3Request<'_>) -> Result<(), S3Error> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let Some(header) = request.header("content-md5") else {
        return Ok(());
    };
    let claimed = BASE64
        .decode(header)
        .map_err(|_| request.err(S3ErrorCode::InvalidDigest))?;
    if claimed.len() != 16 {
        return Err(request.err(S3ErrorCode::InvalidDigest));
    }
    if claimed != md5::compute(&request.body).0 {
        return Err(request.err(S3ErrorCode::BadDigest));
    }
    Ok(())
}

/// Apply `encoding-type=url` to a listing string when requested.
pub fn encode_listing_value(value: &str, url_encode: bool) -> String {
    if url_encode {
        uri_encode(value, false)
    } else {
        value.to_string()
    }
}

/// Clamp `max-keys`-style parameters to 0..=1000, defaulting to 1000.
pub fn clamp_max_keys(value: Option<&str>) -> Result<u32, S3Error> {
    match value {
        None => Ok(1000),
        Some(raw) => {
            let parsed: i64 = raw.parse().map_err(|_| {
                S3Error::with_message(S3ErrorCode::InvalidArgument, "invalid max-keys value")
            })?;
            if parsed < 0 {
                return Err(S3Error::with_message(
                    S3ErrorCode::InvalidArgument,
                    "max-keys must not be negative",
                ));
            }
            Ok(parsed.min(1000) as u32)
        }
    }
}

/// 200 response with an XML body.
pub fn xml_response(writer: XmlWriter) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/xml")
        .body(writer.finish())
}

/// Owner element used by several listing responses.
pub fn write_owner(w: &mut XmlWriter, owner_id: &str, owner_display: &str) {
    w.open("Owner");
    w.element("ID", owner_id);
    w.element("DisplayName", owner_display);
    w.close("Owner");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bucket_name() {
        assert!(validate_bucket_name("my-bucket"));
        assert!(validate_bucket_name("abc"));
        assert!(validate_bucket_name("a.b-c.1"));

        assert!(!validate_bucket_name("ab"));
        assert!(!validate_bucket_name(&"a".repeat(64)));
        assert!(!validate_bucket_name("MyBucket"));
        assert!(!validate_bucket_name("-leading"));
        assert!(!validate_bucket_name("trailing-"));
        assert!(!validate_bucket_name("double..dot"));
        assert!(!validate_bucket_name("dash-.dot"));
        assert!(!validate_bucket_name("192.168.1.1"));
        assert!(!validate_bucket_name("under_score"));
    }

    #[test]
    fn test_clamp_max_keys() {
        assert_eq!(clamp_max_keys(None).unwrap(), 1000);
        assert_eq!(clamp_max_keys(Some("10")).unwrap(), 10);
        assert_eq!(clamp_max_keys(Some("0")).unwrap(), 0);
        assert_eq!(clamp_max_keys(Some("5000")).unwrap(), 1000);
        assert!(clamp_max_keys(Some("-1")).is_err());
        assert!(clamp_max_keys(Some("lots")).is_err());
    }
}
