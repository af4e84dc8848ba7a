//! Object-level S3 handlers: put, get/head, delete, copy and object ACLs.

use std::convert::Infallible;

use actix_web::body::SizedStream;
use actix_web::HttpResponse;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use log::{debug, warn};

use crate::errors::{S3Error, S3ErrorCode};
use crate::metadata::ObjectRecord;
use crate::s3::acl::Acl;
use crate::s3::handlers::{
    check_content_md5, extract_content_type, extract_user_metadata, require_bucket,
    resolve_request_acl, validate_key, xml_response, S3Request, S3_XMLNS,
};
use crate::s3::{http_date, iso8601_millis, parse_http_date, parse_iso8601, uri_decode};
use crate::xml::XmlWriter;

/// `PUT /{bucket}/{key}`: store an object.
pub async fn put_object(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    validate_key(request, key)?;
    require_bucket(request, bucket)?;
    if request.header("content-length").is_none() {
        return Err(request.err(S3ErrorCode::MissingContentLength));
    }
    let size = request.body.len() as u64;
    if size > request.state.config.server.max_object_size {
        return Err(request.err(S3ErrorCode::EntityTooLarge));
    }
    check_content_md5(request)?;
    let acl = resolve_request_acl(request)?;

    let existing = request.state.metadata.get_object(bucket, key)?;
    if request.header("if-none-match") == Some("*") && existing.is_some() {
        return Err(request.err(S3ErrorCode::PreconditionFailed));
    }

    // Bytes first, index second: the object is only visible once both are
    // durable, and a crash in between leaves a harmless orphan.
    let (written, etag) = request
        .state
        .storage
        .put_object(bucket, key, request.body.clone())
        .await?;

    let record = ObjectRecord {
        bucket: bucket.to_string(),
        key: key.to_string(),
        size: written,
        etag: etag.clone(),
        content_type: extract_content_type(request.headers),
        last_modified: iso8601_millis(Utc::now()),
        storage_class: "STANDARD".to_string(),
        acl_json: acl.to_json(),
        user_metadata: extract_user_metadata(request.headers),
        content_encoding: request.header("content-encoding").map(String::from),
        content_language: request.header("content-language").map(String::from),
        content_disposition: request.header("content-disposition").map(String::from),
        cache_control: request.header("cache-control").map(String::from),
        expires: request.header("expires").map(String::from),
    };
    request.state.metadata.put_object(&record)?;
    if existing.is_none() {
        request.state.metrics.add_objects(1);
    }
    debug!("put {}/{} ({} bytes, {})", bucket, key, written, etag);

    Ok(HttpResponse::Ok()
        .insert_header(("etag", etag))
        .finish())
}

/// A body that advertises `len` bytes but streams none. HEAD responses
/// carry the object's Content-Length while the transport sends no payload.
fn empty_sized_body(len: u64) -> SizedStream<stream::Empty<Result<Bytes, Infallible>>> {
    SizedStream::new(len, stream::empty())
}

/// `GET`/`HEAD /{bucket}/{key}`: read an object. HEAD answers entirely from
/// the metadata row and never reads the payload from the backend.
pub async fn get_object(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
    is_head: bool,
) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let record = request
        .state
        .metadata
        .get_object(bucket, key)?
        .ok_or_else(|| request.err(S3ErrorCode::NoSuchKey))?;
    let last_modified = parse_iso8601(&record.last_modified).unwrap_or_else(Utc::now);

    match evaluate_conditionals(request, &record.etag, last_modified) {
        Some(ConditionalOutcome::PreconditionFailed) => {
            return Err(request.err(S3ErrorCode::PreconditionFailed));
        }
        Some(ConditionalOutcome::NotModified) => {
            let mut response = HttpResponse::NotModified();
            response.insert_header(("etag", record.etag.clone()));
            response.insert_header(("last-modified", http_date(last_modified)));
            return Ok(response.finish());
        }
        None => {}
    }

    let range = match parse_range(request.header("range"), record.size) {
        Ok(range) => range,
        Err(_) => {
            let error = request.err(S3ErrorCode::InvalidRange);
            let mut response = error.to_response(&request.request_id);
            response.headers_mut().insert(
                actix_web::http::header::CONTENT_RANGE,
                actix_web::http::header::HeaderValue::from_str(&format!(
                    "bytes */{}",
                    record.size
                ))
                .expect("content-range is ascii"),
            );
            return Ok(response);
        }
    };

    let mut response = if is_head {
        match range {
            Some((start, end)) => {
                let mut builder = HttpResponse::PartialContent();
                builder.insert_header((
                    "content-range",
                    format!("bytes {}-{}/{}", start, end, record.size),
                ));
                builder.body(empty_sized_body(end - start + 1))
            }
            None => HttpResponse::Ok().body(empty_sized_body(record.size)),
        }
    } else {
        let data = request.state.storage.get_object(bucket, key).await.map_err(|e| {
            // The metadata row is authoritative; missing bytes are corruption,
            // not NoSuchKey.
            if e.code() == S3ErrorCode::NoSuchKey {
                warn!("metadata row without backend bytes: {}/{}", bucket, key);
                S3Error::with_message(S3ErrorCode::InternalError, "stored object is unreadable")
            } else {
                e
            }
        })?;
        match range {
            Some((start, end)) => {
                let mut builder = HttpResponse::PartialContent();
                builder.insert_header((
                    "content-range",
                    format!("bytes {}-{}/{}", start, end, record.size),
                ));
                let slice = data.slice(start as usize..=end as usize);
                request.state.metrics.record_bytes_out(slice.len() as u64);
                builder.body(slice)
            }
            None => {
                request.state.metrics.record_bytes_out(data.len() as u64);
                HttpResponse::Ok().body(data)
            }
        }
    };

    let headers = response.headers_mut();
    let mut insert = |name: &str, value: &str| {
        if let (Ok(name), Ok(value)) = (
            actix_web::http::header::HeaderName::from_bytes(name.as_bytes()),
            actix_web::http::header::HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    };
    insert("etag", &record.etag);
    insert("last-modified", &http_date(last_modified));
    insert("accept-ranges", "bytes");

    // Stored representation headers, each overridable per request.
    let overridden = |query_name: &str, stored: Option<&str>| -> Option<String> {
        request
            .query_value(query_name)
            .map(String::from)
            .or_else(|| stored.map(String::from))
    };
    if let Some(content_type) =
        overridden("response-content-type", Some(record.content_type.as_str()))
    {
        insert("content-type", &content_type);
    }
    for (query_name, header_name, stored) in [
        ("response-content-language", "content-language", record.content_language.as_deref()),
        ("response-content-encoding", "content-encoding", record.content_encoding.as_deref()),
        ("response-content-disposition", "content-disposition", record.content_disposition.as_deref()),
        ("response-cache-control", "cache-control", record.cache_control.as_deref()),
        ("response-expires", "expires", record.expires.as_deref()),
    ] {
        if let Some(value) = overridden(query_name, stored) {
            insert(header_name, &value);
        }
    }
    for (suffix, value) in &record.user_metadata {
        insert(&format!("x-amz-meta-{}", suffix), value);
    }
    Ok(response)
}

/// `DELETE /{bucket}/{key}`: idempotent, always 204.
pub async fn delete_object(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let removed = request.state.metadata.delete_object(bucket, key)?;
    if removed {
        request.state.metrics.add_objects(-1);
    }
    if let Err(e) = request.state.storage.delete_object(bucket, key).await {
        warn!("backend delete of {}/{} failed: {}", bucket, key, e);
    }
    Ok(HttpResponse::NoContent().finish())
}

/// `PUT /{bucket}/{key}` with `x-amz-copy-source`.
pub async fn copy_object(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    validate_key(request, key)?;
    require_bucket(request, bucket)?;
    let (src_bucket, src_key) = parse_copy_source(request)?;
    require_bucket(request, &src_bucket)?;
    let source = request
        .state
        .metadata
        .get_object(&src_bucket, &src_key)?
        .ok_or_else(|| {
            S3Error::new(S3ErrorCode::NoSuchKey).resource(format!("/{}/{}", src_bucket, src_key))
        })?;
    check_copy_source_conditionals(request, &source)?;

    let directive = request
        .header("x-amz-metadata-directive")
        .unwrap_or("COPY")
        .to_uppercase();
    if directive != "COPY" && directive != "REPLACE" {
        return Err(S3Error::with_message(
            S3ErrorCode::InvalidArgument,
            "x-amz-metadata-directive must be COPY or REPLACE",
        ));
    }
    if src_bucket == bucket && src_key == key && directive == "COPY" {
        return Err(S3Error::with_message(
            S3ErrorCode::InvalidRequest,
            "copying an object to itself requires REPLACE metadata",
        ));
    }

    let acl = resolve_request_acl(request)?;
    let existing = request.state.metadata.get_object(bucket, key)?;
    let etag = request
        .state
        .storage
        .copy_object(&src_bucket, &src_key, bucket, key)
        .await?;
    let last_modified = iso8601_millis(Utc::now());

    let record = if directive == "REPLACE" {
        ObjectRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: source.size,
            etag: etag.clone(),
            content_type: extract_content_type(request.headers),
            last_modified: last_modified.clone(),
            storage_class: "STANDARD".to_string(),
            acl_json: acl.to_json(),
            user_metadata: extract_user_metadata(request.headers),
            content_encoding: request.header("content-encoding").map(String::from),
            content_language: request.header("content-language").map(String::from),
            content_disposition: request.header("content-disposition").map(String::from),
            cache_control: request.header("cache-control").map(String::from),
            expires: request.header("expires").map(String::from),
        }
    } else {
        ObjectRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: etag.clone(),
            last_modified: last_modified.clone(),
            acl_json: acl.to_json(),
            ..source
        }
    };
    request.state.metadata.put_object(&record)?;
    if existing.is_none() {
        request.state.metrics.add_objects(1);
    }

    let mut w = XmlWriter::new();
    w.declaration();
    w.open_with_attrs("CopyObjectResult", &[("xmlns", S3_XMLNS)]);
    w.element("ETag", &etag);
    w.element("LastModified", &last_modified);
    w.close("CopyObjectResult");
    Ok(xml_response(w))
}

/// `GET /{bucket}/{key}?acl`.
pub async fn get_object_acl(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let record = request
        .state
        .metadata
        .get_object(bucket, key)?
        .ok_or_else(|| request.err(S3ErrorCode::NoSuchKey))?;
    Ok(HttpResponse::Ok()
        .content_type("application/xml")
        .body(Acl::from_json(&record.acl_json).to_xml()))
}

/// `PUT /{bucket}/{key}?acl`.
pub async fn put_object_acl(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let acl = super::bucket::resolve_acl_write(request)?;
    request
        .state
        .metadata
        .update_object_acl(bucket, key, &acl.to_json())?;
    Ok(HttpResponse::Ok().finish())
}

// -- Conditional requests ----------------------------------------------------

pub enum ConditionalOutcome {
    PreconditionFailed,
    NotModified,
}

/// Evaluate the conditional-request ladder in the order S3 does:
/// If-Match, If-Unmodified-Since, If-None-Match, If-Modified-Since.
pub fn evaluate_conditionals(
    request: &S3Request<'_>,
    etag: &str,
    last_modified: DateTime<Utc>,
) -> Option<ConditionalOutcome> {
    if let Some(if_match) = request.header("if-match") {
        if !etag_matches(if_match, etag) {
            return Some(ConditionalOutcome::PreconditionFailed);
        }
    }
    if let Some(if_unmodified) = request.header("if-unmodified-since") {
        if let Some(limit) = parse_http_date(if_unmodified) {
            if last_modified > limit {
                return Some(ConditionalOutcome::PreconditionFailed);
            }
        }
    }
    if let Some(if_none_match) = request.header("if-none-match") {
        if etag_matches(if_none_match, etag) {
            return Some(ConditionalOutcome::NotModified);
        }
    }
    if let Some(if_modified) = request.header("if-modified-since") {
        if let Some(limit) = parse_http_date(if_modified) {
            if last_modified <= limit {
                return Some(ConditionalOutcome::NotModified);
            }
        }
    }
    None
}

/// ETag list match, tolerating missing quotes and `*`.
fn etag_matches(header: &str, etag: &str) -> bool {
    let stored = etag.trim_matches('"');
    header
        .split(',')
        .map(|candidate| candidate.trim().trim_matches('"'))
        .any(|candidate| candidate == "*" || candidate == stored)
}

/// Parse a `Range: bytes=` header against the object size. `Ok(None)`
/// means no (or an ignorable) range; `Err` means unsatisfiable.
pub fn parse_range(header: Option<&str>, size: u64) -> Result<Option<(u64, u64)>, ()> {
    let Some(header) = header else {
        return Ok(None);
    };
    let Some(spec) = header.strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        // Multiple ranges are not supported; serve the full object.
        return Ok(None);
    }
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return Ok(None);
    };
    match (start_str.is_empty(), end_str.is_empty()) {
        // bytes=-N : trailing N bytes
        (true, false) => {
            let Ok(suffix) = end_str.parse::<u64>() else {
                return Ok(None);
            };
            if suffix == 0 || size == 0 {
                return Err(());
            }
            Ok(Some((size.saturating_sub(suffix), size - 1)))
        }
        // bytes=N- : from N to the end
        (false, true) => {
            let Ok(start) = start_str.parse::<u64>() else {
                return Ok(None);
            };
            if start >= size {
                return Err(());
            }
            Ok(Some((start, size - 1)))
        }
        // bytes=N-M
        (false, false) => {
            let (Ok(start), Ok(end)) = (start_str.parse::<u64>(), end_str.parse::<u64>()) else {
                return Ok(None);
            };
            if start > end {
                return Ok(None);
            }
            if start >= size {
                return Err(());
            }
            Ok(Some((start, end.min(size - 1))))
        }
        (true, true) => Ok(None),
    }
}

/// Parse `x-amz-copy-source`: strip one leading slash, decode once, split
/// on the first `/`.
pub fn parse_copy_source(request: &S3Request<'_>) -> Result<(String, String), S3Error> {
    let header = request
        .header("x-amz-copy-source")
        .ok_or_else(|| request.err(S3ErrorCode::InvalidArgument))?;
    let stripped = header.strip_prefix('/').unwrap_or(header);
    let decoded = uri_decode(stripped).ok_or_else(|| {
        S3Error::with_message(S3ErrorCode::InvalidArgument, "unparseable x-amz-copy-source")
    })?;
    match decoded.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(S3Error::with_message(
            S3ErrorCode::InvalidArgument,
            "x-amz-copy-source must be bucket/key",
        )),
    }
}

/// Apply the `x-amz-copy-source-if-*` headers to the source record.
pub fn check_copy_source_conditionals(
    request: &S3Request<'_>,
    source: &ObjectRecord,
) -> Result<(), S3Error> {
    let last_modified = parse_iso8601(&source.last_modified).unwrap_or_else(Utc::now);
    if let Some(if_match) = request.header("x-amz-copy-source-if-match") {
        if !etag_matches(if_match, &source.etag) {
            return Err(request.err(S3ErrorCode::PreconditionFailed));
        }
    }
    if let Some(if_unmodified) = request.header("x-amz-copy-source-if-unmodified-since") {
        if let Some(limit) = parse_http_date(if_unmodified) {
            if last_modified > limit {
                return Err(request.err(S3ErrorCode::PreconditionFailed));
            }
        }
    }
    if let Some(if_none_match) = request.header("x-amz-copy-source-if-none-match") {
        if etag_matches(if_none_match, &source.etag) {
            return Err(request.err(S3ErrorCode::PreconditionFailed));
        }
    }
    if let Some(if_modified) = request.header("x-amz-copy-source-if-modified-since") {
        if let Some(limit) = parse_http_date(if_modified) {
            if last_modified <= limit {
                return Err(request.err(S3ErrorCode::PreconditionFailed));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range(None, 10), Ok(None));
        assert_eq!(parse_range(Some("bytes=0-0"), 10), Ok(Some((0, 0))));
        assert_eq!(parse_range(Some("bytes=1-3"), 10), Ok(Some((1, 3))));
        assert_eq!(parse_range(Some("bytes=5-"), 10), Ok(Some((5, 9))));
        assert_eq!(parse_range(Some("bytes=-3"), 10), Ok(Some((7, 9))));
        // An end past the object is clamped.
        assert_eq!(parse_range(Some("bytes=8-99"), 10), Ok(Some((8, 9))));
        // Unsatisfiable.
        assert_eq!(parse_range(Some("bytes=10-"), 10), Err(()));
        assert_eq!(parse_range(Some("bytes=12-14"), 10), Err(()));
        assert_eq!(parse_range(Some("bytes=-0"), 10), Err(()));
        assert_eq!(parse_range(Some("bytes=0-"), 0), Err(()));
        // Ignorable.
        assert_eq!(parse_range(Some("lines=1-2"), 10), Ok(None));
        assert_eq!(parse_range(Some("bytes=3-1"), 10), Ok(None));
        assert_eq!(parse_range(Some("bytes=0-1,3-4"), 10), Ok(None));
    }

    #[test]
    fn test_etag_matches() {
        assert!(etag_matches("\"abc\"", "\"abc\""));
        assert!(etag_matches("abc", "\"abc\""));
        assert!(etag_matches("*", "\"anything\""));
        assert!(etag_matches("\"x\", \"abc\"", "\"abc\""));
        assert!(!etag_matches("\"x\"", "\"abc\""));
    }
}
