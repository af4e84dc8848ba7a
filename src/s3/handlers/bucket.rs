//! Bucket-level S3 handlers: bucket lifecycle, listings, batch delete and
//! bucket ACLs.

use actix_web::HttpResponse;
use chrono::Utc;
use log::{info, warn};

use crate::errors::{S3Error, S3ErrorCode};
use crate::metadata::{BucketRecord, ListObjectsQuery};
use crate::s3::acl::{parse_access_control_policy, Acl};
use crate::s3::handlers::{
    check_content_md5, clamp_max_keys, encode_listing_value, require_bucket, resolve_request_acl,
    validate_bucket_name, write_owner, xml_response, S3Request, S3_XMLNS,
};
use crate::s3::iso8601_millis;
use crate::xml::{self, XmlWriter};

/// Buckets allowed per owner before `TooManyBuckets`.
const MAX_BUCKETS: u64 = 1000;

/// `GET /`: list every bucket.
pub async fn list_buckets(request: &S3Request<'_>) -> Result<HttpResponse, S3Error> {
    let buckets = request.state.metadata.list_buckets()?;
    let mut w = XmlWriter::new();
    w.declaration();
    w.open_with_attrs("ListAllMyBucketsResult", &[("xmlns", S3_XMLNS)]);
    write_owner(&mut w, &request.auth.owner_id, &request.auth.owner_display);
    w.open("Buckets");
    for bucket in &buckets {
        w.open("Bucket");
        w.element("Name", &bucket.name);
        w.element("CreationDate", &bucket.creation_date);
        w.close("Bucket");
    }
    w.close("Buckets");
    w.close("ListAllMyBucketsResult");
    Ok(xml_response(w))
}

/// `PUT /{bucket}`: create a bucket, idempotent for the same owner.
pub async fn create_bucket(request: &S3Request<'_>, bucket: &str) -> Result<HttpResponse, S3Error> {
    if !validate_bucket_name(bucket) {
        return Err(request.err(S3ErrorCode::InvalidBucketName));
    }
    if let Some(existing) = request.state.metadata.get_bucket(bucket)? {
        return Err(if existing.owner_id == request.auth.owner_id {
            request.err(S3ErrorCode::BucketAlreadyOwnedByYou)
        } else {
            request.err(S3ErrorCode::BucketAlreadyExists)
        });
    }
    if request.state.metadata.count_buckets()? >= MAX_BUCKETS {
        return Err(request.err(S3ErrorCode::TooManyBuckets));
    }

    let body = String::from_utf8_lossy(&request.body);
    let location = xml::parse_create_bucket_configuration(&body)?;
    let region = match location {
        None => request.state.config.server.region.clone(),
        Some(constraint) if constraint.is_empty() => "us-east-1".to_string(),
        Some(constraint) => constraint,
    };
    let acl = resolve_request_acl(request)?;

    request.state.storage.create_bucket(bucket).await?;
    request.state.metadata.create_bucket(&BucketRecord {
        name: bucket.to_string(),
        creation_date: iso8601_millis(Utc::now()),
        region,
        owner_id: request.auth.owner_id.clone(),
        owner_display: request.auth.owner_display.clone(),
        acl_json: acl.to_json(),
    })?;
    request.state.metrics.add_buckets(1);
    info!("created bucket {}", bucket);

    Ok(HttpResponse::Ok()
        .insert_header(("location", format!("/{}", bucket)))
        .finish())
}

/// `DELETE /{bucket}`: only succeeds once the bucket is empty.
pub async fn delete_bucket(request: &S3Request<'_>, bucket: &str) -> Result<HttpResponse, S3Error> {
    request.state.metadata.delete_bucket(bucket)?;
    // Orphaned backend bytes are never client-visible; a failure here only
    // leaks storage that the next create/delete pass can reclaim.
    if let Err(e) = request.state.storage.delete_bucket(bucket).await {
        warn!("backend cleanup of bucket {} failed: {}", bucket, e);
    }
    request.state.metrics.add_buckets(-1);
    info!("deleted bucket {}", bucket);
    Ok(HttpResponse::NoContent().finish())
}

/// `HEAD /{bucket}`: existence probe, headers only.
pub async fn head_bucket(request: &S3Request<'_>, bucket: &str) -> Result<HttpResponse, S3Error> {
    if !request.state.metadata.bucket_exists(bucket)? {
        return Err(request.err(S3ErrorCode::NoSuchBucket));
    }
    Ok(HttpResponse::Ok().finish())
}

/// `GET /{bucket}?location`.
pub async fn get_bucket_location(
    request: &S3Request<'_>,
    bucket: &str,
) -> Result<HttpResponse, S3Error> {
    let record = require_bucket(request, bucket)?;
    let mut w = XmlWriter::new();
    w.declaration();
    // us-east-1 is reported as the empty (self-closing) element.
    if record.region == "us-east-1" {
        w.empty_with_attrs("LocationConstraint", &[("xmlns", S3_XMLNS)]);
    } else {
        w.open_with_attrs("LocationConstraint", &[("xmlns", S3_XMLNS)]);
        w.raw(&xml::escape(&record.region));
        w.close("LocationConstraint");
    }
    Ok(xml_response(w))
}

/// `GET /{bucket}?acl`.
pub async fn get_bucket_acl(request: &S3Request<'_>, bucket: &str) -> Result<HttpResponse, S3Error> {
    let record = require_bucket(request, bucket)?;
    Ok(HttpResponse::Ok()
        .content_type("application/xml")
        .body(Acl::from_json(&record.acl_json).to_xml()))
}

/// `PUT /{bucket}?acl`: canned header or XML body, never both.
pub async fn put_bucket_acl(request: &S3Request<'_>, bucket: &str) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let acl = resolve_acl_write(request)?;
    request
        .state
        .metadata
        .update_bucket_acl(bucket, &acl.to_json())?;
    Ok(HttpResponse::Ok().finish())
}

/// Shared canned-vs-body ACL resolution for the two PutAcl handlers.
pub fn resolve_acl_write(request: &S3Request<'_>) -> Result<Acl, S3Error> {
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
    let canned = request.header("x-amz-acl");
    let has_body = !request.body.is_empty();
    match (canned, has_body) {
        (Some(_), true) => Err(S3Error::with_message(
            S3ErrorCode::InvalidArgument,
            "specify a canned ACL or an AccessControlPolicy body, not both",
        )),
        (Some(canned), false) => {
            Acl::from_canned(canned, &request.auth.owner_id, &request.auth.owner_display)
        }
        (None, true) => parse_access_control_policy(&String::from_utf8_lossy(&request.body)),
        (None, false) => Err(request.err(S3ErrorCode::MissingRequestBodyError)),
    }
}

/// `POST /{bucket}?delete`: batch delete, at most 1000 keys.
pub async fn delete_objects(request: &S3Request<'_>, bucket: &str) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    if request.body.is_empty() {
        return Err(request.err(S3ErrorCode::MissingRequestBodyError));
    }
    check_content_md5(request)?;
    let parsed = xml::parse_delete(&String::from_utf8_lossy(&request.body))?;
    if parsed.keys.len() > 1000 {
        return Err(request.err(S3ErrorCode::MalformedXML));
    }

    let removed = request
        .state
        .metadata
        .delete_objects(bucket, &parsed.keys)?;
    request.state.metrics.add_objects(-(removed.len() as i64));
    for key in &removed {
        if let Err(e) = request.state.storage.delete_object(bucket, key).await {
            warn!("backend delete of {}/{} failed: {}", bucket, key, e);
        }
    }

    let mut w = XmlWriter::new();
    w.declaration();
    w.open_with_attrs("DeleteResult", &[("xmlns", S3_XMLNS)]);
    if !parsed.quiet {
        // Deleting a missing key is a success, so every requested key is
        // reported deleted.
        for key in &parsed.keys {
            w.open("Deleted");
            w.element("Key", key);
            w.close("Deleted");
        }
    }
    w.close("DeleteResult");
    Ok(xml_response(w))
}

/// `GET /{bucket}`: ListObjects (V1).
pub async fn list_objects_v1(request: &S3Request<'_>, bucket: &str) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let prefix = request.query_value("prefix").unwrap_or("").to_string();
    let delimiter = request.query_value("delimiter").unwrap_or("").to_string();
    let marker = request.query_value("marker").unwrap_or("").to_string();
    let max_keys = clamp_max_keys(request.query_value("max-keys"))?;
    let url_encode = request.query_value("encoding-type") == Some("url");

    let page = request.state.metadata.list_objects(
        bucket,
        &ListObjectsQuery {
            prefix: prefix.clone(),
            delimiter: delimiter.clone(),
            start_after: marker.clone(),
            max_keys,
        },
    )?;

    let mut w = XmlWriter::new();
    w.declaration();
    w.open_with_attrs("ListBucketResult", &[("xmlns", S3_XMLNS)]);
    w.element("Name", bucket);
    w.element("Prefix", &encode_listing_value(&prefix, url_encode));
    w.element("Marker", &encode_listing_value(&marker, url_encode));
    w.element("MaxKeys", &max_keys.to_string());
    if !delimiter.is_empty() {
        w.element("Delimiter", &encode_listing_value(&delimiter, url_encode));
    }
    if url_encode {
        w.element("EncodingType", "url");
    }
    w.element("IsTruncated", if page.is_truncated { "true" } else { "false" });
    if page.is_truncated {
        if let Some(next) = &page.next_token {
            w.element("NextMarker", &encode_listing_value(next, url_encode));
        }
    }
    for object in &page.objects {
        w.open("Contents");
        w.element("Key", &encode_listing_value(&object.key, url_encode));
        w.element("LastModified", &object.last_modified);
        w.element("ETag", &object.etag);
        w.element("Size", &object.size.to_string());
        write_owner(&mut w, &request.auth.owner_id, &request.auth.owner_display);
        w.element("StorageClass", &object.storage_class);
        w.close("Contents");
    }
    for common_prefix in &page.common_prefixes {
        w.open("CommonPrefixes");
        w.element("Prefix", &encode_listing_value(common_prefix, url_encode));
        w.close("CommonPrefixes");
    }
    w.close("ListBucketResult");
    Ok(xml_response(w))
}

/// `GET /{bucket}?list-type=2`: ListObjectsV2.
pub async fn list_objects_v2(request: &S3Request<'_>, bucket: &str) -> Result<HttpResponse, S3Error> {
    require_bucket(request, bucket)?;
    let prefix = request.query_value("prefix").unwrap_or("").to_string();
    let delimiter = request.query_value("delimiter").unwrap_or("").to_string();
    let start_after = request.query_value("start-after").unwrap_or("").to_string();
    let continuation = request
        .query_value("continuation-token")
        .unwrap_or("")
        .to_string();
    let max_keys = clamp_max_keys(request.query_value("max-keys"))?;
    let fetch_owner = request.query_value("fetch-owner") == Some("true");
    let url_encode = request.query_value("encoding-type") == Some("url");

    // The scan starts after the greater of the two markers.
    let effective_start = if continuation.as_str() > start_after.as_str() {
        continuation.clone()
    } else {
        start_after.clone()
    };

    let page = request.state.metadata.list_objects(
        bucket,
        &ListObjectsQuery {
            prefix: prefix.clone(),
            delimiter: delimiter.clone(),
            start_after: effective_start,
            max_keys,
        },
    )?;
    let key_count = page.objects.len() + page.common_prefixes.len();

    let mut w = XmlWriter::new();
    w.declaration();
    w.open_with_attrs("ListBucketResult", &[("xmlns", S3_XMLNS)]);
    w.element("Name", bucket);
    w.element("Prefix", &encode_listing_value(&prefix, url_encode));
    if !start_after.is_empty() {
        w.element("StartAfter", &encode_listing_value(&start_after, url_encode));
    }
    if !continuation.is_empty() {
        w.element("ContinuationToken", &continuation);
    }
    w.element("KeyCount", &key_count.to_string());
    w.element("MaxKeys", &max_keys.to_string());
    if !delimiter.is_empty() {
        w.element("Delimiter", &encode_listing_value(&delimiter, url_encode));
    }
    if url_encode {
        w.element("EncodingType", "url");
    }
    w.element("IsTruncated", if page.is_truncated { "true" } else { "false" });
    if page.is_truncated {
        if let Some(next) = &page.next_token {
            w.element("NextContinuationToken", next);
        }
    }
    for object in &page.objects {
        w.open("Contents");
        w.element("Key", &encode_listing_value(&object.key, url_encode));
        w.element("LastModified", &object.last_modified);
        w.element("ETag", &object.etag);
        w.element("Size", &object.size.to_string());
        if fetch_owner {
            write_owner(&mut w, &request.auth.owner_id, &request.auth.owner_display);
        }
        w.element("StorageClass", &object.storage_class);
        w.close("Contents");
    }
    for common_prefix in &page.common_prefixes {
        w.open("CommonPrefixes");
        w.element("Prefix", &encode_listing_value(common_prefix, url_encode));
        w.close("CommonPrefixes");
    }
    w.close("ListBucketResult");
    Ok(xml_response(w))
}
