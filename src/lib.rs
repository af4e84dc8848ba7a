//! BleepStore: an S3-compatible object storage server.
//!
//! The crate splits along two pluggable seams: a [`metadata::MetadataStore`]
//! holding the authoritative index and a [`storage::StorageBackend`] holding
//! raw bytes. The `s3` module implements the REST dialect on top: SigV4
//! authentication, the dispatch grammar and the per-operation handlers.

pub mod app_state;
pub mod config;
pub mod errors;
pub mod metadata;
pub mod metrics;
pub mod s3;
pub mod storage;
pub mod xml;
