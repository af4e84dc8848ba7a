//! S3 error taxonomy.
//!
//! Every failure the service can surface to a client is one of the closed
//! set of [`S3ErrorCode`] kinds. Each kind carries its HTTP status, its wire
//! code string and a default message; the XML rendering is identical for all
//! of them. Components never pick their own HTTP status: they return an
//! [`S3Error`] and the response layer renders it.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use thiserror::Error;

use crate::xml::XmlWriter;

/// Closed set of S3 wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3ErrorCode {
    AccessDenied,
    SignatureDoesNotMatch,
    InvalidAccessKeyId,
    RequestTimeTooSkewed,
    NoSuchBucket,
    NoSuchKey,
    NoSuchUpload,
    BucketAlreadyExists,
    BucketAlreadyOwnedByYou,
    BucketNotEmpty,
    InvalidBucketName,
    InvalidArgument,
    InvalidRange,
    InvalidRequest,
    PreconditionFailed,
    BadDigest,
    InvalidDigest,
    EntityTooLarge,
    EntityTooSmall,
    InvalidPart,
    InvalidPartOrder,
    KeyTooLongError,
    MalformedXML,
    MalformedACLError,
    MethodNotAllowed,
    MissingContentLength,
    MissingRequestBodyError,
    TooManyBuckets,
    NotImplemented,
    InternalError,
    ServiceUnavailable,
}

impl S3ErrorCode {
    /// The code string as it appears in the error XML.
    pub fn as_str(self) -> &'static str {
        match self {
            S3ErrorCode::AccessDenied => "AccessDenied",
            S3ErrorCode::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            S3ErrorCode::InvalidAccessKeyId => "InvalidAccessKeyId",
            S3ErrorCode::RequestTimeTooSkewed => "RequestTimeTooSkewed",
            S3ErrorCode::NoSuchBucket => "NoSuchBucket",
            S3ErrorCode::NoSuchKey => "NoSuchKey",
            S3ErrorCode::NoSuchUpload => "NoSuchUpload",
            S3ErrorCode::BucketAlreadyExists => "BucketAlreadyExists",
            S3ErrorCode::BucketAlreadyOwnedByYou => "BucketAlreadyOwnedByYou",
            S3ErrorCode::BucketNotEmpty => "BucketNotEmpty",
            S3ErrorCode::InvalidBucketName => "InvalidBucketName",
            S3ErrorCode::InvalidArgument => "InvalidArgument",
            S3ErrorCode::InvalidRange => "InvalidRange",
            S3ErrorCode::InvalidRequest => "InvalidRequest",
            S3ErrorCode::PreconditionFailed => "PreconditionFailed",
            S3ErrorCode::BadDigest => "BadDigest",
            S3ErrorCode::InvalidDigest => "InvalidDigest",
            S3ErrorCode::EntityTooLarge => "EntityTooLarge",
            S3ErrorCode::EntityTooSmall => "EntityTooSmall",
            S3ErrorCode::InvalidPart => "InvalidPart",
            S3ErrorCode::InvalidPartOrder => "InvalidPartOrder",
            S3ErrorCode::KeyTooLongError => "KeyTooLongError",
            S3ErrorCode::MalformedXML => "MalformedXML",
            S3ErrorCode::MalformedACLError => "MalformedACLError",
            S3ErrorCode::MethodNotAllowed => "MethodNotAllowed",
            S3ErrorCode::MissingContentLength => "MissingContentLength",
            S3ErrorCode::MissingRequestBodyError => "MissingRequestBodyError",
            S3ErrorCode::TooManyBuckets => "TooManyBuckets",
            S3ErrorCode::NotImplemented => "NotImplemented",
            S3ErrorCode::InternalError => "InternalError",
            S3ErrorCode::ServiceUnavailable => "ServiceUnavailable",
        }
    }

    /// HTTP status the code maps to.
    pub fn status(self) -> StatusCode {
        match self {
            S3ErrorCode::AccessDenied
            | S3ErrorCode::SignatureDoesNotMatch
            | S3ErrorCode::InvalidAccessKeyId
            | S3ErrorCode::RequestTimeTooSkewed => StatusCode::FORBIDDEN,
            S3ErrorCode::NoSuchBucket | S3ErrorCode::NoSuchKey | S3ErrorCode::NoSuchUpload => {
                StatusCode::NOT_FOUND
            }
            S3ErrorCode::BucketAlreadyExists
            | S3ErrorCode::BucketAlreadyOwnedByYou
            | S3ErrorCode::BucketNotEmpty => StatusCode::CONFLICT,
            S3ErrorCode::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            S3ErrorCode::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            S3ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            S3ErrorCode::MissingContentLength => StatusCode::LENGTH_REQUIRED,
            S3ErrorCode::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            S3ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            S3ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Default human-readable message for the code.
    pub fn default_message(self) -> &'static str {
        match self {
            S3ErrorCode::AccessDenied => "Access Denied",
            S3ErrorCode::SignatureDoesNotMatch => {
                "The request signature we calculated does not match the signature you provided."
            }
            S3ErrorCode::InvalidAccessKeyId => {
                "The AWS Access Key Id you provided does not exist in our records."
            }
            S3ErrorCode::RequestTimeTooSkewed => {
                "The difference between the request time and the server's time is too large."
            }
            S3ErrorCode::NoSuchBucket => "The specified bucket does not exist",
            S3ErrorCode::NoSuchKey => "The specified key does not exist.",
            S3ErrorCode::NoSuchUpload => {
                "The specified multipart upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed."
            }
            S3ErrorCode::BucketAlreadyExists => {
                "The requested bucket name is not available. The bucket namespace is shared by all users of the system."
            }
            S3ErrorCode::BucketAlreadyOwnedByYou => {
                "Your previous request to create the named bucket succeeded and you already own it."
            }
            S3ErrorCode::BucketNotEmpty => "The bucket you tried to delete is not empty",
            S3ErrorCode::InvalidBucketName => "The specified bucket is not valid.",
            S3ErrorCode::InvalidArgument => "Invalid Argument",
            S3ErrorCode::InvalidRange => "The requested range is not satisfiable",
            S3ErrorCode::InvalidRequest => "Invalid Request",
            S3ErrorCode::PreconditionFailed => {
                "At least one of the pre-conditions you specified did not hold"
            }
            S3ErrorCode::BadDigest => {
                "The Content-MD5 you specified did not match what we received."
            }
            S3ErrorCode::InvalidDigest => {
                "The Content-MD5 you specified is not valid."
            }
            S3ErrorCode::EntityTooLarge => {
                "Your proposed upload exceeds the maximum allowed object size."
            }
            S3ErrorCode::EntityTooSmall => {
                "Your proposed upload is smaller than the minimum allowed object size."
            }
            S3ErrorCode::InvalidPart => {
                "One or more of the specified parts could not be found. The part may not have been uploaded, or the specified entity tag may not match the part's entity tag."
            }
            S3ErrorCode::InvalidPartOrder => {
                "The list of parts was not in ascending order. Parts must be ordered by part number."
            }
            S3ErrorCode::KeyTooLongError => "Your key is too long",
            S3ErrorCode::MalformedXML => {
                "The XML you provided was not well-formed or did not validate against our published schema"
            }
            S3ErrorCode::MalformedACLError => {
                "The XML you provided was not well-formed or did not validate against our published schema"
            }
            S3ErrorCode::MethodNotAllowed => {
                "The specified method is not allowed against this resource."
            }
            S3ErrorCode::MissingContentLength => "You must provide the Content-Length HTTP header.",
            S3ErrorCode::MissingRequestBodyError => "Request body is empty.",
            S3ErrorCode::TooManyBuckets => {
                "You have attempted to create more buckets than allowed"
            }
            S3ErrorCode::NotImplemented => {
                "A header you provided implies functionality that is not implemented"
            }
            S3ErrorCode::InternalError => {
                "We encountered an internal error. Please try again."
            }
            S3ErrorCode::ServiceUnavailable => "Please reduce your request rate.",
        }
    }
}

/// A concrete error instance: a code plus optional per-request context.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct S3Error {
    code: S3ErrorCode,
    message: String,
    resource: Option<String>,
}

impl S3Error {
    /// Build an error carrying the code's default message.
    pub fn new(code: S3ErrorCode) -> Self {
        S3Error {
            code,
            message: code.default_message().to_string(),
            resource: None,
        }
    }

    /// Build an error with an explicit message.
    pub fn with_message(code: S3ErrorCode, message: impl Into<String>) -> Self {
        S3Error {
            code,
            message: message.into(),
            resource: None,
        }
    }

    /// Attach the request resource (path) for the XML body.
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn code(&self) -> S3ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Render the error XML body (no namespace).
    pub fn to_xml(&self, request_id: &str) -> String {
        let mut w = XmlWriter::new();
        w.declaration();
        w.open("Error");
        w.element("Code", self.code.as_str());
        w.element("Message", self.message());
        w.element("Resource", self.resource.as_deref().unwrap_or(""));
        w.element("RequestId", request_id);
        w.close("Error");
        w.finish()
    }

    /// Render a full HTTP response for this error.
    ///
    /// The caller supplies the request id so the header and the XML body
    /// agree; the remaining common headers are stamped by the dispatch layer.
    pub fn to_response(&self, request_id: &str) -> HttpResponse {
        HttpResponse::build(self.code.status())
            .content_type("application/xml")
            .body(self.to_xml(request_id))
    }
}

impl From<S3ErrorCode> for S3Error {
    fn from(code: S3ErrorCode) -> Self {
        S3Error::new(code)
    }
}

impl From<rusqlite::Error> for S3Error {
    fn from(e: rusqlite::Error) -> Self {
        // Busy-timeout exhaustion is transient; everything else is on us.
        if let rusqlite::Error::SqliteFailure(ref err, _) = e {
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
            {
                return S3Error::with_message(
                    S3ErrorCode::ServiceUnavailable,
                    "Metadata store is busy",
                );
            }
        }
        log::error!("metadata store failure: {}", e);
        S3Error::new(S3ErrorCode::InternalError)
    }
}

impl From<std::io::Error> for S3Error {
    fn from(e: std::io::Error) -> Self {
        log::error!("storage I/O failure: {}", e);
        S3Error::new(S3ErrorCode::InternalError)
    }
}

impl From<serde_json::Error> for S3Error {
    fn from(e: serde_json::Error) -> Self {
        log::error!("metadata JSON failure: {}", e);
        S3Error::new(S3ErrorCode::InternalError)
    }
}

impl actix_web::ResponseError for S3Error {
    fn status_code(&self) -> StatusCode {
        self.code.status()
    }

    fn error_response(&self) -> HttpResponse {
        // Fallback path for errors that escape the dispatch layer; the
        // request id here will not match the x-amz-request-id header.
        self.to_response(&crate::s3::generate_request_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(S3ErrorCode::NoSuchKey.status(), StatusCode::NOT_FOUND);
        assert_eq!(S3ErrorCode::AccessDenied.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            S3ErrorCode::BucketNotEmpty.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            S3ErrorCode::InvalidRange.status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            S3ErrorCode::MissingContentLength.status(),
            StatusCode::LENGTH_REQUIRED
        );
        assert_eq!(
            S3ErrorCode::NotImplemented.status(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_error_xml_has_no_namespace() {
        let err = S3Error::new(S3ErrorCode::NoSuchKey).resource("/bucket/key");
        let xml = err.to_xml("0123456789ABCDEF");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<Error><Code>NoSuchKey</Code>"));
        assert!(xml.contains("<Resource>/bucket/key</Resource>"));
        assert!(xml.contains("<RequestId>0123456789ABCDEF</RequestId>"));
        assert!(!xml.contains("xmlns"));
    }

    #[test]
    fn test_custom_message_overrides_default() {
        let err = S3Error::with_message(S3ErrorCode::InvalidArgument, "partNumber must be >= 1");
        assert_eq!(err.message(), "partNumber must be >= 1");
        assert_eq!(
            S3Error::new(S3ErrorCode::InvalidArgument).message(),
            "Invalid Argument"
        );
    }
}
