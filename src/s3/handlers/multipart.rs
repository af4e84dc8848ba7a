//! Multipart-upload S3 handlers.
//!
//! An upload is created with the final object's metadata captured up
//! front, parts accumulate independently, and completion validates the
//! client's part list against the stored parts before the backend
//! assembles and the metadata store publishes atomically.

use actix_web::HttpResponse;
use chrono::Utc;
use log::{debug, info};
use uuid::Uuid;

use crate::errors::{S3Error, S3ErrorCode};
use crate::metadata::{ObjectRecord, PartRecord, UploadRecord};
use crate::s3::handlers::object::{check_copy_source_conditionals, parse_copy_source, parse_range};
use crate::s3::handlers::{
    check_content_md5, clamp_max_keys, extract_content_type, extract_user_metadata,
    require_bucket, resolve_request_acl, validate_key, write_owner, xml_response, S3Request,
    S3_XMLNS,
};
use crate::s3::iso8601_millis;
use crate::storage::AssemblePart;
use crate::xml::{self, XmlWriter};

/// Every part except the last must be at least this large.
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const MAX_PART_NUMBER: u32 = 10_000;

/// `POST /{bucket}/{key}?uploads`: initiate a multipart upload.
pub async fn create_multipart_upload(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    validate_key(request, key)?;
    require_bucket(request, bucket)?;
    let acl = resolve_request_acl(request)?;

    let upload_id = Uuid::new_v4().to_string();
    let record = UploadRecord {
        upload_id: upload_id.clone(),
        bucket: bucket.to_string(),
        key: key.to_string(),
        initiated: iso8601_millis(Utc::now()),
        content_type: extract_content_type(request.headers),
        user_metadata: extract_user_metadata(request.headers),
        acl_json: acl.to_json(),
        owner_id: request.auth.owner_id.clone(),
        owner_display: request.auth.owner_display.clone(),
        storage_class: "STANDARD".to_string(),
        content_encoding: request.header("content-encoding").map(String::from),
        content_language: request.header("content-language").map(String::from),
        content_disposition: request.header("content-disposition").map(String::from),
        cache_control: request.header("cache-control").map(String::from),
        expires: request.header("expires").map(String::from),
    };
    request.state.metadata.create_upload(&record)?;
    info!("initiated multipart upload {} for {}/{}", upload_id, bucket, key);

    let mut w = XmlWriter::new();
    w.declaration();
    w.open_with_attrs("InitiateMultipartUploadResult", &[("xmlns", S3_XMLNS)]);
    w.element("Bucket", bucket);
    w.element("Key", key);
    w.element("UploadId", &upload_id);
    w.close("InitiateMultipartUploadResult");
    Ok(xml_response(w))
}

/// Fetch the upload and check it belongs to this bucket/key.
fn require_upload(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<UploadRecord, S3Error> {
    let upload_id = request
        .query_value("uploadId")
        .ok_or_else(|| request.err(S3ErrorCode::NoSuchUpload))?;
    let upload = request
        .state
        .metadata
        .get_upload(upload_id)?
        .ok_or_else(|| request.err(S3ErrorCode::NoSuchUpload))?;
    if upload.bucket != bucket || upload.key != key {
        return Err(request.err(S3ErrorCode::NoSuchUpload));
    }
    Ok(upload)
}

fn parse_part_number(request: &S3Request<'_>) -> Result<u32, S3Error> {
    let number: u32 = request
        .query_value("partNumber")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            S3Error::with_message(S3ErrorCode::InvalidArgument, "invalid partNumber")
        })?;
    if number < 1 || number > MAX_PART_NUMBER {
        return Err(S3Error::with_message(
            S3ErrorCode::InvalidArgument,
            "partNumber must be between 1 and 10000",
        ));
    }
    Ok(number)
}

/// `PUT /{bucket}/{key}?partNumber=N&uploadId=...`: upload one part.
pub async fn upload_part(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let upload = require_upload(request, bucket, key)?;
    let part_number = parse_part_number(request)?;
    let size = request.body.len() as u64;
    if size > request.state.config.server.max_object_size {
        return Err(request.err(S3ErrorCode::EntityTooLarge));
    }
    check_content_md5(request)?;

    let etag = request
        .state
        .storage
        .put_part(bucket, key, &upload.upload_id, part_number, request.body.clone())
        .await?;
    request.state.metadata.put_part(
        &upload.upload_id,
        &PartRecord {
            part_number,
            size,
            etag: etag.clone(),
            stored_at: iso8601_millis(Utc::now()),
        },
    )?;
    debug!(
        "stored part {} of upload {} ({} bytes)",
        part_number, upload.upload_id, size
    );

    Ok(HttpResponse::Ok().insert_header(("etag", etag)).finish())
}

/// `PUT /{bucket}/{key}?partNumber=N&uploadId=...` with `x-amz-copy-source`:
/// source a part from an existing object.
pub async fn upload_part_copy(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let upload = require_upload(request, bucket, key)?;
    let part_number = parse_part_number(request)?;

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

    let data = request
        .state
        .storage
        .get_object(&src_bucket, &src_key)
        .await?;
    let data = match request.header("x-amz-copy-source-range") {
        None => data,
        Some(range_header) => {
            match parse_range(Some(range_header), source.size) {
                Ok(Some((start, end))) => data.slice(start as usize..=end as usize),
                // A copy range must be explicit and satisfiable.
                Ok(None) => {
                    return Err(S3Error::with_message(
                        S3ErrorCode::InvalidArgument,
                        "x-amz-copy-source-range must be of the form bytes=first-last",
                    ))
                }
                Err(_) => return Err(request.err(S3ErrorCode::InvalidRange)),
            }
        }
    };
    let size = data.len() as u64;

    let etag = request
        .state
        .storage
        .put_part(bucket, key, &upload.upload_id, part_number, data)
        .await?;
    let stored_at = iso8601_millis(Utc::now());
    request.state.metadata.put_part(
        &upload.upload_id,
        &PartRecord {
            part_number,
            size,
            etag: etag.clone(),
            stored_at: stored_at.clone(),
        },
    )?;

    let mut w = XmlWriter::new();
    w.declaration();
    w.open_with_attrs("CopyPartResult", &[("xmlns", S3_XMLNS)]);
    w.element("ETag", &etag);
    w.element("LastModified", &stored_at);
    w.close("CopyPartResult");
    Ok(xml_response(w))
}

/// `GET /{bucket}/{key}?uploadId=...`: list uploaded parts.
pub async fn list_parts(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let upload = require_upload(request, bucket, key)?;
    let marker: u32 = request
        .query_value("part-number-marker")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let max_parts = clamp_max_keys(request.query_value("max-parts"))?;

    let page = request
        .state
        .metadata
        .list_parts(&upload.upload_id, marker, max_parts)?;

    let mut w = XmlWriter::new();
    w.declaration();
    w.open_with_attrs("ListPartsResult", &[("xmlns", S3_XMLNS)]);
    w.element("Bucket", bucket);
    w.element("Key", key);
    w.element("UploadId", &upload.upload_id);
    w.open("Initiator");
    w.element("ID", &upload.owner_id);
    w.element("DisplayName", &upload.owner_display);
    w.close("Initiator");
    write_owner(&mut w, &upload.owner_id, &upload.owner_display);
    w.element("StorageClass", &upload.storage_class);
    w.element("PartNumberMarker", &marker.to_string());
    if let Some(next) = page.next_part_number_marker {
        w.element("NextPartNumberMarker", &next.to_string());
    }
    w.element("MaxParts", &max_parts.to_string());
    w.element("IsTruncated", if page.is_truncated { "true" } else { "false" });
    for part in &page.parts {
        w.open("Part");
        w.element("PartNumber", &part.part_number.to_string());
        w.element("LastModified", &part.stored_at);
        w.element("ETag", &part.etag);
        w.element("Size", &part.size.to_string());
        w.close("Part");
    }
    w.close("ListPartsResult");
    Ok(xml_response(w))
}

/// `POST /{bucket}/{key}?uploadId=...`: complete the upload atomically.
pub async fn complete_multipart_upload(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let upload = require_upload(request, bucket, key)?;
    if request.body.is_empty() {
        return Err(request.err(S3ErrorCode::MalformedXML));
    }
    let requested = xml::parse_complete_multipart_upload(&String::from_utf8_lossy(&request.body))?;

    for window in requested.windows(2) {
        if window[1].part_number <= window[0].part_number {
            return Err(request.err(S3ErrorCode::InvalidPartOrder));
        }
    }

    let stored = request
        .state
        .metadata
        .get_parts_for_completion(&upload.upload_id)?;
    let stored_by_number: std::collections::HashMap<u32, &PartRecord> =
        stored.iter().map(|p| (p.part_number, p)).collect();

    let mut assemble = Vec::with_capacity(requested.len());
    let mut total_size = 0u64;
    for (index, part) in requested.iter().enumerate() {
        let stored_part = stored_by_number
            .get(&part.part_number)
            .ok_or_else(|| request.err(S3ErrorCode::InvalidPart))?;
        if part.etag.trim_matches('"') != stored_part.etag.trim_matches('"') {
            return Err(request.err(S3ErrorCode::InvalidPart));
        }
        let is_last = index == requested.len() - 1;
        if !is_last && stored_part.size < MIN_PART_SIZE {
            return Err(request.err(S3ErrorCode::EntityTooSmall));
        }
        total_size += stored_part.size;
        assemble.push(AssemblePart {
            part_number: part.part_number,
            etag: stored_part.etag.clone(),
        });
    }

    let existing = request.state.metadata.get_object(bucket, key)?;
    let etag = request
        .state
        .storage
        .assemble_parts(bucket, key, &upload.upload_id, &assemble)
        .await?;

    let record = ObjectRecord {
        bucket: bucket.to_string(),
        key: key.to_string(),
        size: total_size,
        etag: etag.clone(),
        content_type: upload.content_type.clone(),
        last_modified: iso8601_millis(Utc::now()),
        storage_class: upload.storage_class.clone(),
        acl_json: upload.acl_json.clone(),
        user_metadata: upload.user_metadata.clone(),
        content_encoding: upload.content_encoding.clone(),
        content_language: upload.content_language.clone(),
        content_disposition: upload.content_disposition.clone(),
        cache_control: upload.cache_control.clone(),
        expires: upload.expires.clone(),
    };
    request
        .state
        .metadata
        .complete_upload(&upload.upload_id, &record)?;
    if existing.is_none() {
        request.state.metrics.add_objects(1);
    }
    info!(
        "completed multipart upload {} for {}/{} ({} parts, {} bytes)",
        upload.upload_id,
        bucket,
        key,
        assemble.len(),
        total_size
    );

    let host = request.header("host").unwrap_or("localhost");
    let mut w = XmlWriter::new();
    w.declaration();
    w.open_with_attrs("CompleteMultipartUploadResult", &[("xmlns", S3_XMLNS)]);
    w.element("Location", &format!("http://{}/{}/{}", host, bucket, key));
    w.element("Bucket", bucket);
    w.element("Key", key);
    w.element("ETag", &etag);
    w.close("CompleteMultipartUploadResult");
    Ok(xml_response(w))
}

/// `DELETE /{bucket}/{key}?uploadId=...`: abort and release parts.
pub async fn abort_multipart_upload(
    request: &S3Request<'_>,
    bucket: &str,
    key: &str,
) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let upload = require_upload(request, bucket, key)?;
    request
        .state
        .storage
        .delete_parts(bucket, key, &upload.upload_id)
        .await?;
    request.state.metadata.abort_upload(&upload.upload_id)?;
    info!("aborted multipart upload {}", upload.upload_id);
    Ok(HttpResponse::NoContent().finish())
}

/// `GET /{bucket}?uploads`: list in-progress uploads.
pub async fn list_multipart_uploads(
    request: &S3Request<'_>,
    bucket: &str,
) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let prefix = request.query_value("prefix").unwrap_or("").to_string();
    let key_marker = request.query_value("key-marker").unwrap_or("").to_string();
    let upload_id_marker = request
        .query_value("upload-id-marker")
        .unwrap_or("")
        .to_string();
    let max_uploads = clamp_max_keys(request.query_value("max-uploads"))?;

    let page = request.state.metadata.list_uploads(
        bucket,
        &prefix,
        &key_marker,
        &upload_id_marker,
        max_uploads,
    )?;

    let mut w = XmlWriter::new();
    w.declaration();
    w.open_with_attrs("ListMultipartUploadsResult", &[("xmlns", S3_XMLNS)]);
    w.element("Bucket", bucket);
    w.element("KeyMarker", &key_marker);
    w.element("UploadIdMarker", &upload_id_marker);
    if let Some(next) = &page.next_key_marker {
        w.element("NextKeyMarker", next);
    }
    if let Some(next) = &page.next_upload_id_marker {
        w.element("NextUploadIdMarker", next);
    }
    if !prefix.is_empty() {
        w.element("Prefix", &prefix);
    }
    w.element("MaxUploads", &max_uploads.to_string());
    w.element("IsTruncated", if page.is_truncated { "true" } else { "false" });
    for upload in &page.uploads {
        w.open("Upload");
        w.element("Key", &upload.key);
        w.element("UploadId", &upload.upload_id);
        w.open("Initiator");
        w.element("ID", &upload.owner_id);
        w.element("DisplayName", &upload.owner_display);
        w.close("Initiator");
        write_owner(&mut w, &upload.owner_id, &upload.owner_display);
        w.element("StorageClass", &upload.storage_class);
        w.element("Initiated", &upload.initiated);
        w.close("Upload");
    }
    w.close("ListMultipartUploadsResult");
    Ok(xml_response(w))
}
