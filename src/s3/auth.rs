//! AWS Signature Version 4 request authentication.
//!
//! Implements the header-signed and presigned-URL variants against the
//! credentials held in the metadata store. Canonicalization runs a
//! decode-then-reencode cycle over the path and query so requests that
//! arrive already percent-encoded canonicalize to the bytes the client
//! signed. See
//! <https://docs.aws.amazon.com/AmazonS3/latest/API/sig-v4-header-based-auth.html>.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::errors::{S3Error, S3ErrorCode};
use crate::metadata::MetadataStore;
use crate::s3::{parse_amz_date, uri_decode, uri_encode};

type HmacSha256 = Hmac<Sha256>;

/// Maximum tolerated difference between request time and server time.
const MAX_CLOCK_SKEW_SECONDS: i64 = 900;
/// Presigned URLs may be valid for at most seven days.
const MAX_PRESIGN_EXPIRES: u64 = 604_800;
/// Marker for requests signed without a payload hash.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
/// Chunked-signing marker; the streaming variant is not supported.
const STREAMING_PAYLOAD: &str = "STREAMING-AWS4-HMAC-SHA256-PAYLOAD";

const CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(60);
const SIGNING_KEY_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
const CACHE_CAPACITY: usize = 1000;

/// The raw request parts the authenticator needs.
pub struct RequestInfo<'a> {
    pub method: &'a str,
    /// Request-line path, percent-encoded as received.
    pub raw_path: &'a str,
    /// Raw query string, without the leading `?`.
    pub raw_query: &'a str,
    /// Ordered header multimap with lowercase names.
    pub headers: Vec<(String, String)>,
    /// Hex SHA-256 of the request body.
    pub body_sha256: &'a str,
}

/// The identity a request resolved to.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub access_key: String,
    pub owner_id: String,
    pub owner_display: String,
}

/// Derive the stable canonical owner id for an access key: the first 16 hex
/// characters of its SHA-256.
pub fn derive_owner_id(access_key: &str) -> String {
    let digest = Sha256::digest(access_key.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// A bounded map whose entries expire. Eviction is insertion-ordered.
struct TtlCache<K, V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<K, (Instant, V)>,
    order: VecDeque<K>,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    fn new(ttl: Duration, capacity: usize) -> Self {
        TtlCache {
            ttl,
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some((inserted, value)) if inserted.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, key: K, value: V) {
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        if self.entries.insert(key.clone(), (Instant::now(), value)).is_none() {
            self.order.push_back(key);
        }
    }
}

/// SigV4 verifier bound to the server region and credential source.
pub struct Authenticator {
    region: String,
    enabled: bool,
    default_access_key: String,
    credential_cache: Mutex<TtlCache<String, (String, String)>>,
    signing_key_cache: Mutex<TtlCache<(String, String, String), [u8; 32]>>,
}

impl Authenticator {
    pub fn new(region: &str, enabled: bool, default_access_key: &str) -> Self {
        Authenticator {
            region: region.to_string(),
            enabled,
            default_access_key: default_access_key.to_string(),
            credential_cache: Mutex::new(TtlCache::new(CREDENTIAL_CACHE_TTL, CACHE_CAPACITY)),
            signing_key_cache: Mutex::new(TtlCache::new(SIGNING_KEY_CACHE_TTL, CACHE_CAPACITY)),
        }
    }

    /// Verify the request signature and resolve the calling identity.
    pub fn authenticate(
        &self,
        store: &dyn MetadataStore,
        request: &RequestInfo<'_>,
        now: DateTime<Utc>,
    ) -> Result<AuthContext, S3Error> {
        if !self.enabled {
            return Ok(AuthContext {
                access_key: self.default_access_key.clone(),
                owner_id: derive_owner_id(&self.default_access_key),
                owner_display: self.default_access_key.clone(),
            });
        }

        let authorization = header_value(&request.headers, "authorization");
        if let Some(auth_header) = authorization {
            if auth_header.starts_with("AWS4-HMAC-SHA256") {
                return self.verify_header_signature(store, request, &auth_header, now);
            }
        }
        let query = parse_query(request.raw_query)?;
        if query_value(&query, "X-Amz-Algorithm").as_deref() == Some("AWS4-HMAC-SHA256") {
            return self.verify_presigned_signature(store, request, &query, now);
        }
        Err(S3Error::new(S3ErrorCode::AccessDenied))
    }

    fn verify_header_signature(
        &self,
        store: &dyn MetadataStore,
        request: &RequestInfo<'_>,
        auth_header: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthContext, S3Error> {
        let fields = parse_authorization_header(auth_header)?;
        let scope = parse_credential_scope(&fields.credential)?;

        let amz_date_str = header_value(&request.headers, "x-amz-date").ok_or_else(|| {
            S3Error::with_message(S3ErrorCode::AccessDenied, "missing x-amz-date header")
        })?;
        let amz_date = parse_amz_date(&amz_date_str).ok_or_else(|| {
            S3Error::with_message(S3ErrorCode::AccessDenied, "unparseable x-amz-date")
        })?;
        let skew = (now - amz_date).num_seconds().abs();
        if skew > MAX_CLOCK_SKEW_SECONDS {
            return Err(S3Error::new(S3ErrorCode::RequestTimeTooSkewed));
        }
        self.check_scope(&scope, &amz_date_str)?;

        let payload_hash = header_value(&request.headers, "x-amz-content-sha256")
            .unwrap_or_else(|| request.body_sha256.to_string());
        if payload_hash.starts_with(STREAMING_PAYLOAD) {
            return Err(S3Error::with_message(
                S3ErrorCode::NotImplemented,
                "streaming chunked signatures are not supported",
            ));
        }

        let canonical = canonical_request(
            request.method,
            &canonical_uri(request.raw_path)?,
            &canonical_query(request.raw_query, false)?,
            &request.headers,
            &fields.signed_headers,
            &payload_hash,
        )?;
        let sts = string_to_sign(&canonical, &amz_date_str, &scope_string(&scope));

        let secret = self.lookup_secret(store, &scope.access_key)?;
        let key = self.signing_key(&scope.access_key, &scope.date, &secret);
        verify_signature(&key, &sts, &fields.signature)?;

        Ok(self.context_for(&scope.access_key))
    }

    fn verify_presigned_signature(
        &self,
        store: &dyn MetadataStore,
        request: &RequestInfo<'_>,
        query: &[(String, String)],
        now: DateTime<Utc>,
    ) -> Result<AuthContext, S3Error> {
        let credential = query_value(query, "X-Amz-Credential").ok_or_else(|| {
            S3Error::with_message(S3ErrorCode::AccessDenied, "missing X-Amz-Credential")
        })?;
        let scope = parse_credential_scope(&credential)?;

        let amz_date_str = query_value(query, "X-Amz-Date").ok_or_else(|| {
            S3Error::with_message(S3ErrorCode::AccessDenied, "missing X-Amz-Date")
        })?;
        let amz_date = parse_amz_date(&amz_date_str).ok_or_else(|| {
            S3Error::with_message(S3ErrorCode::AccessDenied, "unparseable X-Amz-Date")
        })?;
        self.check_scope(&scope, &amz_date_str)?;

        let expires: u64 = query_value(query, "X-Amz-Expires")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                S3Error::with_message(S3ErrorCode::AccessDenied, "missing X-Amz-Expires")
            })?;
        if expires < 1 || expires > MAX_PRESIGN_EXPIRES {
            return Err(S3Error::with_message(
                S3ErrorCode::InvalidArgument,
                "X-Amz-Expires must be between 1 and 604800",
            ));
        }
        if amz_date + chrono::Duration::seconds(expires as i64) < now {
            return Err(S3Error::with_message(
                S3ErrorCode::AccessDenied,
                "Request has expired",
            ));
        }

        let signed_headers_str = query_value(query, "X-Amz-SignedHeaders").ok_or_else(|| {
            S3Error::with_message(S3ErrorCode::AccessDenied, "missing X-Amz-SignedHeaders")
        })?;
        let signed_headers: Vec<String> =
            signed_headers_str.split(';').map(|s| s.to_string()).collect();
        let signature = query_value(query, "X-Amz-Signature").ok_or_else(|| {
            S3Error::with_message(S3ErrorCode::AccessDenied, "missing X-Amz-Signature")
        })?;

        let canonical = canonical_request(
            request.method,
            &canonical_uri(request.raw_path)?,
            &canonical_query(request.raw_query, true)?,
            &request.headers,
            &signed_headers,
            UNSIGNED_PAYLOAD,
        )?;
        let sts = string_to_sign(&canonical, &amz_date_str, &scope_string(&scope));

        let secret = self.lookup_secret(store, &scope.access_key)?;
        let key = self.signing_key(&scope.access_key, &scope.date, &secret);
        verify_signature(&key, &sts, &signature)?;

        Ok(self.context_for(&scope.access_key))
    }

    fn check_scope(&self, scope: &CredentialScope, amz_date: &str) -> Result<(), S3Error> {
        if !amz_date.starts_with(&scope.date) {
            return Err(S3Error::with_message(
                S3ErrorCode::SignatureDoesNotMatch,
                "credential date does not match request date",
            ));
        }
        if scope.region != self.region {
            return Err(S3Error::with_message(
                S3ErrorCode::SignatureDoesNotMatch,
                format!("credential region must be {}", self.region),
            ));
        }
        if scope.service != "s3" || scope.terminator != "aws4_request" {
            return Err(S3Error::with_message(
                S3ErrorCode::SignatureDoesNotMatch,
                "credential scope must end with /s3/aws4_request",
            ));
        }
        Ok(())
    }

    fn lookup_secret(
        &self,
        store: &dyn MetadataStore,
        access_key: &str,
    ) -> Result<String, S3Error> {
        if let Some((secret, _owner)) = self
            .credential_cache
            .lock()
            .unwrap()
            .get(&access_key.to_string())
        {
            return Ok(secret);
        }
        let record = store
            .get_credential(access_key)?
            .ok_or_else(|| S3Error::new(S3ErrorCode::InvalidAccessKeyId))?;
        self.credential_cache.lock().unwrap().insert(
            access_key.to_string(),
            (record.secret_key.clone(), record.owner_id),
        );
        Ok(record.secret_key)
    }

    fn signing_key(&self, access_key: &str, date: &str, secret: &str) -> [u8; 32] {
        let cache_key = (
            access_key.to_string(),
            date.to_string(),
            self.region.clone(),
        );
        if let Some(key) = self.signing_key_cache.lock().unwrap().get(&cache_key) {
            return key;
        }
        let key = derive_signing_key(secret, date, &self.region);
        self.signing_key_cache.lock().unwrap().insert(cache_key, key);
        key
    }

    fn context_for(&self, access_key: &str) -> AuthContext {
        AuthContext {
            access_key: access_key.to_string(),
            owner_id: derive_owner_id(access_key),
            owner_display: access_key.to_string(),
        }
    }
}

// -- Canonicalization --------------------------------------------------------

struct AuthorizationFields {
    credential: String,
    signed_headers: Vec<String>,
    signature: String,
}

struct CredentialScope {
    access_key: String,
    date: String,
    region: String,
    service: String,
    terminator: String,
}

fn scope_string(scope: &CredentialScope) -> String {
    format!(
        "{}/{}/{}/{}",
        scope.date, scope.region, scope.service, scope.terminator
    )
}

fn parse_authorization_header(header: &str) -> Result<AuthorizationFields, S3Error> {
    let rest = header
        .strip_prefix("AWS4-HMAC-SHA256")
        .unwrap_or(header)
        .trim();
    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;
    for field in rest.split(',') {
        let field = field.trim();
        if let Some(value) = field.strip_prefix("Credential=") {
            credential = Some(value.to_string());
        } else if let Some(value) = field.strip_prefix("SignedHeaders=") {
            signed_headers = Some(value.split(';').map(|s| s.to_string()).collect());
        } else if let Some(value) = field.strip_prefix("Signature=") {
            signature = Some(value.to_string());
        }
    }
    match (credential, signed_headers, signature) {
        (Some(credential), Some(signed_headers), Some(signature)) => Ok(AuthorizationFields {
            credential,
            signed_headers,
            signature,
        }),
        _ => Err(S3Error::with_message(
            S3ErrorCode::AccessDenied,
            "malformed Authorization header",
        )),
    }
}

fn parse_credential_scope(credential: &str) -> Result<CredentialScope, S3Error> {
    let parts: Vec<&str> = credential.split('/').collect();
    if parts.len() != 5 || parts[0].is_empty() {
        return Err(S3Error::with_message(
            S3ErrorCode::AccessDenied,
            "malformed credential scope",
        ));
    }
    Ok(CredentialScope {
        access_key: parts[0].to_string(),
        date: parts[1].to_string(),
        region: parts[2].to_string(),
        service: parts[3].to_string(),
        terminator: parts[4].to_string(),
    })
}

/// Canonical URI: decode once, re-encode with `/` preserved.
fn canonical_uri(raw_path: &str) -> Result<String, S3Error> {
    let decoded = uri_decode(raw_path).ok_or_else(|| {
        S3Error::with_message(S3ErrorCode::AccessDenied, "unparseable request path")
    })?;
    Ok(uri_encode(&decoded, false))
}

/// Split a raw query string into decoded pairs. `+` decodes as space.
pub fn parse_query_pairs(raw_query: &str) -> Result<Vec<(String, String)>, S3Error> {
    parse_query(raw_query)
}

fn parse_query(raw_query: &str) -> Result<Vec<(String, String)>, S3Error> {
    let mut pairs = Vec::new();
    for segment in raw_query.split('&') {
        if segment.is_empty() {
            continue;
        }
        let (name, value) = segment.split_once('=').unwrap_or((segment, ""));
        let decode = |s: &str| {
            uri_decode(&s.replace('+', " ")).ok_or_else(|| {
                S3Error::with_message(S3ErrorCode::AccessDenied, "unparseable query string")
            })
        };
        pairs.push((decode(name)?, decode(value)?));
    }
    Ok(pairs)
}

/// Canonical query string: decoded pairs re-encoded, sorted by encoded name
/// then encoded value. Presigned verification drops `X-Amz-Signature`.
fn canonical_query(raw_query: &str, drop_signature: bool) -> Result<String, S3Error> {
    let mut encoded: Vec<(String, String)> = parse_query(raw_query)?
        .into_iter()
        .filter(|(name, _)| !(drop_signature && name == "X-Amz-Signature"))
        .map(|(name, value)| (uri_encode(&name, true), uri_encode(&value, true)))
        .collect();
    encoded.sort();
    Ok(encoded
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("&"))
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

fn query_value(query: &[(String, String)], name: &str) -> Option<String> {
    query
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

/// Canonical headers block for the names listed in SignedHeaders: values
/// trimmed with internal whitespace runs collapsed, repeated headers joined
/// with commas.
fn canonical_headers(
    headers: &[(String, String)],
    signed: &[String],
) -> Result<String, S3Error> {
    let mut block = String::new();
    for name in signed {
        let name = name.to_lowercase();
        let values: Vec<String> = headers
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect();
        if values.is_empty() {
            return Err(S3Error::with_message(
                S3ErrorCode::SignatureDoesNotMatch,
                format!("signed header {} missing from request", name),
            ));
        }
        block.push_str(&name);
        block.push(':');
        block.push_str(&values.join(","));
        block.push('\n');
    }
    Ok(block)
}

fn canonical_request(
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    headers: &[(String, String)],
    signed_headers: &[String],
    payload_hash: &str,
) -> Result<String, S3Error> {
    let headers_block = canonical_headers(headers, signed_headers)?;
    Ok(format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_uri,
        canonical_query,
        headers_block,
        signed_headers.join(";"),
        payload_hash
    ))
}

fn string_to_sign(canonical_request: &str, amz_date: &str, scope: &str) -> String {
    format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// `k4` of the SigV4 key derivation chain.
fn derive_signing_key(secret: &str, date: &str, region: &str) -> [u8; 32] {
    let k0 = format!("AWS4{}", secret);
    let k1 = hmac_sha256(k0.as_bytes(), date.as_bytes());
    let k2 = hmac_sha256(&k1, region.as_bytes());
    let k3 = hmac_sha256(&k2, b"s3");
    hmac_sha256(&k3, b"aws4_request")
}

/// Constant-time signature comparison via HMAC verification.
fn verify_signature(key: &[u8; 32], string_to_sign: &str, provided_hex: &str) -> Result<(), S3Error> {
    let provided = hex::decode(provided_hex)
        .map_err(|_| S3Error::new(S3ErrorCode::SignatureDoesNotMatch))?;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(string_to_sign.as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| S3Error::new(S3ErrorCode::SignatureDoesNotMatch))
}

/// Compute a request signature; shared by the verifier tests and presign
/// tooling.
pub fn compute_signature(secret: &str, date: &str, region: &str, string_to_sign: &str) -> String {
    let key = derive_signing_key(secret, date, region);
    hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::sqlite_store::SqliteMetadataStore;
    use crate::metadata::CredentialRecord;
    use chrono::TimeZone;

    const EXAMPLE_SECRET: &str = "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY";

    // The worked GET example from the AWS SigV4 documentation.
    #[test]
    fn test_aws_documentation_vector() {
        let headers = vec![
            ("host".to_string(), "examplebucket.s3.amazonaws.com".to_string()),
            ("range".to_string(), "bytes=0-9".to_string()),
            (
                "x-amz-content-sha256".to_string(),
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string(),
            ),
            ("x-amz-date".to_string(), "20130524T000000Z".to_string()),
        ];
        let signed: Vec<String> = ["host", "range", "x-amz-content-sha256", "x-amz-date"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let canonical = canonical_request(
            "GET",
            &canonical_uri("/test.txt").unwrap(),
            &canonical_query("", false).unwrap(),
            &headers,
            &signed,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .unwrap();
        assert_eq!(
            canonical,
            "GET\n/test.txt\n\n\
             host:examplebucket.s3.amazonaws.com\n\
             range:bytes=0-9\n\
             x-amz-content-sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\n\
             x-amz-date:20130524T000000Z\n\n\
             host;range;x-amz-content-sha256;x-amz-date\n\
             e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        let sts = string_to_sign(&canonical, "20130524T000000Z", "20130524/us-east-1/s3/aws4_request");
        assert_eq!(
            sts,
            "AWS4-HMAC-SHA256\n20130524T000000Z\n20130524/us-east-1/s3/aws4_request\n\
             7344ae5b7ee6c3e7e6b0fe0640412a37625d1fbfff95c48bbb2dc43964946972"
        );

        let signature = compute_signature(EXAMPLE_SECRET, "20130524", "us-east-1", &sts);
        assert_eq!(
            signature,
            "f0e8bdb87c964420e857bd35b5d6ed310bd44f0170aba48dd91039c6036bdb41"
        );
    }

    #[test]
    fn test_canonical_query_sorting_and_encoding() {
        let q = canonical_query("b=2&a=1&a=0&key=a%2Fb", false).unwrap();
        assert_eq!(q, "a=0&a=1&b=2&key=a%2Fb");
        // Presigned mode drops the signature parameter only.
        let q = canonical_query("X-Amz-Signature=abc&X-Amz-Expires=900", true).unwrap();
        assert_eq!(q, "X-Amz-Expires=900");
    }

    #[test]
    fn test_canonical_headers_collapse_whitespace() {
        let headers = vec![
            ("host".to_string(), "example.com".to_string()),
            ("x-amz-meta-note".to_string(), "  a   b\t c ".to_string()),
        ];
        let signed: Vec<String> = vec!["host".to_string(), "x-amz-meta-note".to_string()];
        let block = canonical_headers(&headers, &signed).unwrap();
        assert_eq!(block, "host:example.com\nx-amz-meta-note:a b c\n");
    }

    fn seeded_store(access_key: &str, secret: &str) -> SqliteMetadataStore {
        let store = SqliteMetadataStore::from_connection(
            rusqlite::Connection::open_in_memory().unwrap(),
        )
        .unwrap();
        store
            .seed_credential(&CredentialRecord {
                access_key_id: access_key.to_string(),
                secret_key: secret.to_string(),
                owner_id: derive_owner_id(access_key),
                active: true,
            })
            .unwrap();
        store
    }

    /// Sign a minimal GET the way a client SDK would, then verify it.
    #[test]
    fn test_header_signature_round_trip() {
        let store = seeded_store("AKIDEXAMPLE", EXAMPLE_SECRET);
        let auth = Authenticator::new("us-east-1", true, "AKIDEXAMPLE");
        let now = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        let amz_date = "20260222T120000Z";

        let headers = vec![
            ("host".to_string(), "localhost:9000".to_string()),
            ("x-amz-content-sha256".to_string(), UNSIGNED_PAYLOAD.to_string()),
            ("x-amz-date".to_string(), amz_date.to_string()),
        ];
        let signed: Vec<String> = ["host", "x-amz-content-sha256", "x-amz-date"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let canonical = canonical_request(
            "GET",
            "/bucket/key",
            "",
            &headers,
            &signed,
            UNSIGNED_PAYLOAD,
        )
        .unwrap();
        let sts = string_to_sign(
            &canonical,
            amz_date,
            "20260222/us-east-1/s3/aws4_request",
        );
        let signature = compute_signature(EXAMPLE_SECRET, "20260222", "us-east-1", &sts);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260222/us-east-1/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature={}",
            signature
        );
        let mut request_headers = headers.clone();
        request_headers.push(("authorization".to_string(), authorization));

        let request = RequestInfo {
            method: "GET",
            raw_path: "/bucket/key",
            raw_query: "",
            headers: request_headers.clone(),
            body_sha256: UNSIGNED_PAYLOAD,
        };
        let context = auth.authenticate(&store, &request, now).unwrap();
        assert_eq!(context.access_key, "AKIDEXAMPLE");
        assert_eq!(context.owner_id, derive_owner_id("AKIDEXAMPLE"));

        // A flipped signature byte fails.
        let mut bad_headers = headers;
        bad_headers.push((
            "authorization".to_string(),
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260222/us-east-1/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature=0000000000000000000000000000000000000000000000000000000000000000"
                .to_string(),
        ));
        let bad = RequestInfo {
            method: "GET",
            raw_path: "/bucket/key",
            raw_query: "",
            headers: bad_headers,
            body_sha256: UNSIGNED_PAYLOAD,
        };
        let err = auth.authenticate(&store, &bad, now).unwrap_err();
        assert_eq!(err.code(), S3ErrorCode::SignatureDoesNotMatch);
    }

    #[test]
    fn test_clock_skew_boundaries() {
        let store = seeded_store("AKIDEXAMPLE", EXAMPLE_SECRET);
        let auth = Authenticator::new("us-east-1", true, "AKIDEXAMPLE");
        let request_time = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();

        let build = |now: DateTime<Utc>| {
            let headers = vec![
                ("host".to_string(), "localhost:9000".to_string()),
                ("x-amz-date".to_string(), "20260222T120000Z".to_string()),
            ];
            let signed: Vec<String> = vec!["host".to_string(), "x-amz-date".to_string()];
            let canonical = canonical_request(
                "GET", "/b/k", "", &headers, &signed, UNSIGNED_PAYLOAD,
            )
            .unwrap();
            let sts = string_to_sign(
                &canonical,
                "20260222T120000Z",
                "20260222/us-east-1/s3/aws4_request",
            );
            let signature = compute_signature(EXAMPLE_SECRET, "20260222", "us-east-1", &sts);
            let mut request_headers = headers;
            request_headers.push((
                "authorization".to_string(),
                format!(
                    "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260222/us-east-1/s3/aws4_request, \
                     SignedHeaders=host;x-amz-date, Signature={}",
                    signature
                ),
            ));
            (request_headers, now)
        };

        // Exactly 900 seconds of skew is accepted.
        let (headers, now) = build(request_time + chrono::Duration::seconds(900));
        let request = RequestInfo {
            method: "GET",
            raw_path: "/b/k",
            raw_query: "",
            headers,
            body_sha256: UNSIGNED_PAYLOAD,
        };
        assert!(auth.authenticate(&store, &request, now).is_ok());

        // 901 seconds is rejected.
        let (headers, now) = build(request_time + chrono::Duration::seconds(901));
        let request = RequestInfo {
            method: "GET",
            raw_path: "/b/k",
            raw_query: "",
            headers,
            body_sha256: UNSIGNED_PAYLOAD,
        };
        let err = auth.authenticate(&store, &request, now).unwrap_err();
        assert_eq!(err.code(), S3ErrorCode::RequestTimeTooSkewed);
    }

    #[test]
    fn test_presigned_expiry() {
        let store = seeded_store("AKIDEXAMPLE", EXAMPLE_SECRET);
        let auth = Authenticator::new("us-east-1", true, "AKIDEXAMPLE");
        let signed_at = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();

        let query_base = "X-Amz-Algorithm=AWS4-HMAC-SHA256\
            &X-Amz-Credential=AKIDEXAMPLE%2F20260222%2Fus-east-1%2Fs3%2Faws4_request\
            &X-Amz-Date=20260222T120000Z&X-Amz-Expires=900&X-Amz-SignedHeaders=host";
        let headers = vec![("host".to_string(), "localhost:9000".to_string())];
        let signed: Vec<String> = vec!["host".to_string()];
        let canonical = canonical_request(
            "GET",
            "/b/k",
            &canonical_query(query_base, true).unwrap(),
            &headers,
            &signed,
            UNSIGNED_PAYLOAD,
        )
        .unwrap();
        let sts = string_to_sign(
            &canonical,
            "20260222T120000Z",
            "20260222/us-east-1/s3/aws4_request",
        );
        let signature = compute_signature(EXAMPLE_SECRET, "20260222", "us-east-1", &sts);
        let raw_query = format!("{}&X-Amz-Signature={}", query_base, signature);

        // Within the window.
        let request = RequestInfo {
            method: "GET",
            raw_path: "/b/k",
            raw_query: &raw_query,
            headers: headers.clone(),
            body_sha256: UNSIGNED_PAYLOAD,
        };
        let now = signed_at + chrono::Duration::seconds(800);
        assert!(auth.authenticate(&store, &request, now).is_ok());

        // Past X-Amz-Date + X-Amz-Expires.
        let now = signed_at + chrono::Duration::seconds(1000);
        let err = auth.authenticate(&store, &request, now).unwrap_err();
        assert_eq!(err.code(), S3ErrorCode::AccessDenied);
    }

    #[test]
    fn test_unknown_access_key() {
        let store = seeded_store("AKIDEXAMPLE", EXAMPLE_SECRET);
        let auth = Authenticator::new("us-east-1", true, "AKIDEXAMPLE");
        let headers = vec![
            ("host".to_string(), "localhost:9000".to_string()),
            ("x-amz-date".to_string(), "20260222T120000Z".to_string()),
            (
                "authorization".to_string(),
                "AWS4-HMAC-SHA256 Credential=AKIDGHOST/20260222/us-east-1/s3/aws4_request, \
                 SignedHeaders=host;x-amz-date, Signature=deadbeef"
                    .to_string(),
            ),
        ];
        let request = RequestInfo {
            method: "GET",
            raw_path: "/b/k",
            raw_query: "",
            headers,
            body_sha256: UNSIGNED_PAYLOAD,
        };
        let now = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        let err = auth.authenticate(&store, &request, now).unwrap_err();
        assert_eq!(err.code(), S3ErrorCode::InvalidAccessKeyId);
    }

    #[test]
    fn test_unauthenticated_request_is_denied_unless_disabled() {
        let store = seeded_store("AKIDEXAMPLE", EXAMPLE_SECRET);
        let now = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        let request = RequestInfo {
            method: "GET",
            raw_path: "/b/k",
            raw_query: "",
            headers: vec![("host".to_string(), "localhost:9000".to_string())],
            body_sha256: UNSIGNED_PAYLOAD,
        };

        let strict = Authenticator::new("us-east-1", true, "AKIDEXAMPLE");
        let err = strict.authenticate(&store, &request, now).unwrap_err();
        assert_eq!(err.code(), S3ErrorCode::AccessDenied);

        let open = Authenticator::new("us-east-1", false, "AKIDEXAMPLE");
        let context = open.authenticate(&store, &request, now).unwrap();
        assert_eq!(context.access_key, "AKIDEXAMPLE");
    }

    #[test]
    fn test_ttl_cache_eviction() {
        let mut cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(3, 30);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));

        let mut expiring: TtlCache<u32, u32> = TtlCache::new(Duration::from_millis(0), 2);
        expiring.insert(1, 10);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(expiring.get(&1), None);
    }
}
