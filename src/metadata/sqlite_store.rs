//! SQLite implementation of the [`MetadataStore`] trait.
//!
//! One connection behind a mutex; WAL journaling with `synchronous=NORMAL`
//! so commits are durable on the WAL page. Schema is created `IF NOT
//! EXISTS` on open, which doubles as the crash-recovery path.

use std::path::Path;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use log::{info, warn};
use rusqlite::{params, Connection, Row, TransactionBehavior};

use crate::errors::{S3Error, S3ErrorCode};
use crate::metadata::{
    BucketRecord, CredentialRecord, ListObjectsPage, ListObjectsQuery, ListPartsPage,
    ListUploadsPage, MetadataStore, ObjectRecord, PartRecord, UploadRecord,
};
use crate::s3::iso8601_millis;

/// Current schema version recorded in the `schema_version` table.
const SCHEMA_VERSION: i64 = 1;

/// SQLite limits bound parameters; stay well under the historic 999 cap.
const DELETE_CHUNK: usize = 500;

const OBJECT_COLS: &str = "bucket, key, size, etag, content_type, last_modified, storage_class, \
     acl_json, user_metadata_json, content_encoding, content_language, content_disposition, \
     cache_control, expires";

const UPLOAD_COLS: &str = "upload_id, bucket, key, initiated, content_type, user_metadata_json, \
     acl_json, owner_id, owner_display, storage_class, content_encoding, content_language, \
     content_disposition, cache_control, expires";

/// SQLite-backed metadata store.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, S3Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Wrap an already-open connection (used by tests).
    pub fn from_connection(conn: Connection) -> Result<Self, S3Error> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::create_schema(&conn)?;
        let version: i64 = conn.query_row(
            "SELECT MAX(version) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if version != SCHEMA_VERSION {
            // No migration path exists; refusing to run beats corrupting.
            return Err(S3Error::with_message(
                S3ErrorCode::InternalError,
                format!("metadata schema version {} is not supported", version),
            ));
        }
        info!("metadata store ready, schema version {}", SCHEMA_VERSION);
        Ok(SqliteMetadataStore {
            conn: Mutex::new(conn),
        })
    }

    fn create_schema(conn: &Connection) -> Result<(), S3Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS buckets (
                name TEXT PRIMARY KEY,
                creation_date TEXT NOT NULL,
                region TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                owner_display TEXT NOT NULL,
                acl_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS objects (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                size INTEGER NOT NULL,
                etag TEXT NOT NULL,
                content_type TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                storage_class TEXT NOT NULL DEFAULT 'STANDARD',
                acl_json TEXT NOT NULL,
                user_metadata_json TEXT NOT NULL DEFAULT '{}',
                content_encoding TEXT,
                content_language TEXT,
                content_disposition TEXT,
                cache_control TEXT,
                expires TEXT,
                PRIMARY KEY (bucket, key)
            );
            CREATE INDEX IF NOT EXISTS idx_objects_bucket_key ON objects(bucket, key);
            CREATE TABLE IF NOT EXISTS multipart_uploads (
                upload_id TEXT PRIMARY KEY,
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                initiated TEXT NOT NULL,
                content_type TEXT NOT NULL,
                user_metadata_json TEXT NOT NULL DEFAULT '{}',
                acl_json TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                owner_display TEXT NOT NULL,
                storage_class TEXT NOT NULL DEFAULT 'STANDARD',
                content_encoding TEXT,
                content_language TEXT,
                content_disposition TEXT,
                cache_control TEXT,
                expires TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_uploads_bucket_key
                ON multipart_uploads(bucket, key);
            CREATE TABLE IF NOT EXISTS multipart_parts (
                upload_id TEXT NOT NULL
                    REFERENCES multipart_uploads(upload_id) ON DELETE CASCADE,
                part_number INTEGER NOT NULL,
                size INTEGER NOT NULL,
                etag TEXT NOT NULL,
                stored_at TEXT NOT NULL,
                PRIMARY KEY (upload_id, part_number)
            );
            CREATE TABLE IF NOT EXISTS credentials (
                access_key_id TEXT PRIMARY KEY,
                secret_key TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }
}

fn row_to_bucket(row: &Row<'_>) -> rusqlite::Result<BucketRecord> {
    Ok(BucketRecord {
        name: row.get(0)?,
        creation_date: row.get(1)?,
        region: row.get(2)?,
        owner_id: row.get(3)?,
        owner_display: row.get(4)?,
        acl_json: row.get(5)?,
    })
}

fn row_to_object(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    let size: i64 = row.get(2)?;
    let user_metadata_json: String = row.get(8)?;
    Ok(ObjectRecord {
        bucket: row.get(0)?,
        key: row.get(1)?,
        size: size as u64,
        etag: row.get(3)?,
        content_type: row.get(4)?,
        last_modified: row.get(5)?,
        storage_class: row.get(6)?,
        acl_json: row.get(7)?,
        user_metadata: serde_json::from_str(&user_metadata_json).unwrap_or_default(),
        content_encoding: row.get(9)?,
        content_language: row.get(10)?,
        content_disposition: row.get(11)?,
        cache_control: row.get(12)?,
        expires: row.get(13)?,
    })
}

fn row_to_upload(row: &Row<'_>) -> rusqlite::Result<UploadRecord> {
    let user_metadata_json: String = row.get(5)?;
    Ok(UploadRecord {
        upload_id: row.get(0)?,
        bucket: row.get(1)?,
        key: row.get(2)?,
        initiated: row.get(3)?,
        content_type: row.get(4)?,
        user_metadata: serde_json::from_str(&user_metadata_json).unwrap_or_default(),
        acl_json: row.get(6)?,
        owner_id: row.get(7)?,
        owner_display: row.get(8)?,
        storage_class: row.get(9)?,
        content_encoding: row.get(10)?,
        content_language: row.get(11)?,
        content_disposition: row.get(12)?,
        cache_control: row.get(13)?,
        expires: row.get(14)?,
    })
}

fn row_to_part(row: &Row<'_>) -> rusqlite::Result<PartRecord> {
    let part_number: i64 = row.get(0)?;
    let size: i64 = row.get(1)?;
    Ok(PartRecord {
        part_number: part_number as u32,
        size: size as u64,
        etag: row.get(2)?,
        stored_at: row.get(3)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Insert or replace an object row using the given executor. Shared by the
/// plain upsert and the multipart completion transaction.
fn upsert_object(conn: &Connection, record: &ObjectRecord) -> Result<(), S3Error> {
    let user_metadata_json = serde_json::to_string(&record.user_metadata)?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO objects ({}) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            OBJECT_COLS
        ),
        params![
            record.bucket,
            record.key,
            record.size as i64,
            record.etag,
            record.content_type,
            record.last_modified,
            record.storage_class,
            record.acl_json,
            user_metadata_json,
            record.content_encoding,
            record.content_language,
            record.content_disposition,
            record.cache_control,
            record.expires,
        ],
    )?;
    Ok(())
}

impl MetadataStore for SqliteMetadataStore {
    fn create_bucket(&self, record: &BucketRecord) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO buckets (name, creation_date, region, owner_id, owner_display, acl_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.name,
                record.creation_date,
                record.region,
                record.owner_id,
                record.owner_display,
                record.acl_json,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(S3Error::new(S3ErrorCode::BucketAlreadyExists))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete_bucket(&self, name: &str) -> Result<(), S3Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let objects: i64 = tx.query_row(
            "SELECT COUNT(*) FROM objects WHERE bucket = ?1",
            params![name],
            |row| row.get(0),
        )?;
        if objects > 0 {
            return Err(S3Error::new(S3ErrorCode::BucketNotEmpty).resource(format!("/{}", name)));
        }
        let removed = tx.execute("DELETE FROM buckets WHERE name = ?1", params![name])?;
        if removed == 0 {
            return Err(S3Error::new(S3ErrorCode::NoSuchBucket).resource(format!("/{}", name)));
        }
        tx.commit()?;
        Ok(())
    }

    fn get_bucket(&self, name: &str) -> Result<Option<BucketRecord>, S3Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, creation_date, region, owner_id, owner_display, acl_json \
             FROM buckets WHERE name = ?1",
        )?;
        match stmt.query_row(params![name], row_to_bucket) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn bucket_exists(&self, name: &str) -> Result<bool, S3Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM buckets WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn list_buckets(&self) -> Result<Vec<BucketRecord>, S3Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, creation_date, region, owner_id, owner_display, acl_json \
             FROM buckets ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_bucket)?;
        let mut buckets = Vec::new();
        for row in rows {
            buckets.push(row?);
        }
        Ok(buckets)
    }

    fn update_bucket_acl(&self, name: &str, acl_json: &str) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE buckets SET acl_json = ?1 WHERE name = ?2",
            params![acl_json, name],
        )?;
        if updated == 0 {
            return Err(S3Error::new(S3ErrorCode::NoSuchBucket).resource(format!("/{}", name)));
        }
        Ok(())
    }

    fn put_object(&self, record: &ObjectRecord) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        upsert_object(&conn, record)
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectRecord>, S3Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM objects WHERE bucket = ?1 AND key = ?2",
            OBJECT_COLS
        ))?;
        match stmt.query_row(params![bucket, key], row_to_object) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, S3Error> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM objects WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        Ok(removed > 0)
    }

    fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<String>, S3Error> {
        let mut deleted = Vec::new();
        let mut conn = self.conn.lock().unwrap();
        for chunk in keys.chunks(DELETE_CHUNK) {
            let placeholders: Vec<String> =
                (0..chunk.len()).map(|i| format!("?{}", i + 2)).collect();
            let in_list = placeholders.join(",");
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut present_stmt = tx.prepare(&format!(
                    "SELECT key FROM objects WHERE bucket = ?1 AND key IN ({})",
                    in_list
                ))?;
                let mut delete_stmt = tx.prepare(&format!(
                    "DELETE FROM objects WHERE bucket = ?1 AND key IN ({})",
                    in_list
                ))?;
                let mut sql_params: Vec<&dyn rusqlite::ToSql> = vec![&bucket];
                for key in chunk {
                    sql_params.push(key);
                }
                let rows = present_stmt.query_map(sql_params.as_slice(), |row| {
                    row.get::<_, String>(0)
                })?;
                for row in rows {
                    deleted.push(row?);
                }
                delete_stmt.execute(sql_params.as_slice())?;
            }
            tx.commit()?;
        }
        Ok(deleted)
    }

    fn list_objects(
        &self,
        bucket: &str,
        query: &ListObjectsQuery,
    ) -> Result<ListObjectsPage, S3Error> {
        let mut page = ListObjectsPage::default();
        if query.max_keys == 0 {
            return Ok(page);
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM objects \
             WHERE bucket = ?1 AND key >= ?2 AND key > ?3 ORDER BY key",
            OBJECT_COLS
        ))?;
        let mut rows = stmt.query(params![bucket, query.prefix, query.start_after])?;

        let mut count = 0u32;
        let mut last_emitted: Option<String> = None;
        let mut last_prefix: Option<String> = None;
        while let Some(row) = rows.next()? {
            let key: String = row.get(1)?;
            // Keys sharing the prefix are contiguous under the ordered scan.
            if !key.starts_with(&query.prefix) {
                break;
            }
            if !query.delimiter.is_empty() {
                let rest = &key[query.prefix.len()..];
                if let Some(idx) = rest.find(&query.delimiter) {
                    let group = format!(
                        "{}{}",
                        query.prefix,
                        &rest[..idx + query.delimiter.len()]
                    );
                    if group.as_str() <= query.start_after.as_str() {
                        continue;
                    }
                    if last_prefix.as_deref() == Some(group.as_str()) {
                        continue;
                    }
                    if count == query.max_keys {
                        page.is_truncated = true;
                        page.next_token = last_emitted;
                        return Ok(page);
                    }
                    last_prefix = Some(group.clone());
                    last_emitted = Some(group.clone());
                    page.common_prefixes.push(group);
                    count += 1;
                    continue;
                }
            }
            if count == query.max_keys {
                page.is_truncated = true;
                page.next_token = last_emitted;
                return Ok(page);
            }
            let record = row_to_object(row)?;
            last_emitted = Some(record.key.clone());
            page.objects.push(record);
            count += 1;
        }
        Ok(page)
    }

    fn update_object_acl(&self, bucket: &str, key: &str, acl_json: &str) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE objects SET acl_json = ?1 WHERE bucket = ?2 AND key = ?3",
            params![acl_json, bucket, key],
        )?;
        if updated == 0 {
            return Err(
                S3Error::new(S3ErrorCode::NoSuchKey).resource(format!("/{}/{}", bucket, key))
            );
        }
        Ok(())
    }

    fn create_upload(&self, record: &UploadRecord) -> Result<(), S3Error> {
        let user_metadata_json = serde_json::to_string(&record.user_metadata)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO multipart_uploads ({}) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                UPLOAD_COLS
            ),
            params![
                record.upload_id,
                record.bucket,
                record.key,
                record.initiated,
                record.content_type,
                user_metadata_json,
                record.acl_json,
                record.owner_id,
                record.owner_display,
                record.storage_class,
                record.content_encoding,
                record.content_language,
                record.content_disposition,
                record.cache_control,
                record.expires,
            ],
        )?;
        Ok(())
    }

    fn get_upload(&self, upload_id: &str) -> Result<Option<UploadRecord>, S3Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM multipart_uploads WHERE upload_id = ?1",
            UPLOAD_COLS
        ))?;
        match stmt.query_row(params![upload_id], row_to_upload) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn abort_upload(&self, upload_id: &str) -> Result<(), S3Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM multipart_parts WHERE upload_id = ?1",
            params![upload_id],
        )?;
        let removed = tx.execute(
            "DELETE FROM multipart_uploads WHERE upload_id = ?1",
            params![upload_id],
        )?;
        if removed == 0 {
            return Err(S3Error::new(S3ErrorCode::NoSuchUpload));
        }
        tx.commit()?;
        Ok(())
    }

    fn put_part(&self, upload_id: &str, part: &PartRecord) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO multipart_parts \
             (upload_id, part_number, size, etag, stored_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                upload_id,
                part.part_number,
                part.size as i64,
                part.etag,
                part.stored_at,
            ],
        )?;
        Ok(())
    }

    fn list_parts(
        &self,
        upload_id: &str,
        part_number_marker: u32,
        max_parts: u32,
    ) -> Result<ListPartsPage, S3Error> {
        let mut page = ListPartsPage::default();
        if max_parts == 0 {
            return Ok(page);
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT part_number, size, etag, stored_at FROM multipart_parts \
             WHERE upload_id = ?1 AND part_number > ?2 ORDER BY part_number LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![upload_id, part_number_marker, max_parts + 1],
            row_to_part,
        )?;
        for row in rows {
            page.parts.push(row?);
        }
        if page.parts.len() as u32 > max_parts {
            page.parts.truncate(max_parts as usize);
            page.is_truncated = true;
            page.next_part_number_marker = page.parts.last().map(|p| p.part_number);
        }
        Ok(page)
    }

    fn get_parts_for_completion(&self, upload_id: &str) -> Result<Vec<PartRecord>, S3Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT part_number, size, etag, stored_at FROM multipart_parts \
             WHERE upload_id = ?1 ORDER BY part_number",
        )?;
        let rows = stmt.query_map(params![upload_id], row_to_part)?;
        let mut parts = Vec::new();
        for row in rows {
            parts.push(row?);
        }
        Ok(parts)
    }

    fn complete_upload(
        &self,
        upload_id: &str,
        final_object: &ObjectRecord,
    ) -> Result<(), S3Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM multipart_uploads WHERE upload_id = ?1",
            params![upload_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(S3Error::new(S3ErrorCode::NoSuchUpload));
        }
        upsert_object(&tx, final_object)?;
        tx.execute(
            "DELETE FROM multipart_parts WHERE upload_id = ?1",
            params![upload_id],
        )?;
        tx.execute(
            "DELETE FROM multipart_uploads WHERE upload_id = ?1",
            params![upload_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: &str,
        upload_id_marker: &str,
        max_uploads: u32,
    ) -> Result<ListUploadsPage, S3Error> {
        let mut page = ListUploadsPage::default();
        if max_uploads == 0 {
            return Ok(page);
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM multipart_uploads \
             WHERE bucket = ?1 AND (?2 = '' OR key > ?2 OR (key = ?2 AND ?3 != '' AND upload_id > ?3)) \
             ORDER BY key, upload_id",
            UPLOAD_COLS
        ))?;
        let rows = stmt.query_map(
            params![bucket, key_marker, upload_id_marker],
            row_to_upload,
        )?;
        // Prefix filtering happens here, so the page fill count must too.
        for row in rows {
            let record = row?;
            if !record.key.starts_with(prefix) {
                continue;
            }
            page.uploads.push(record);
            if page.uploads.len() as u32 > max_uploads {
                break;
            }
        }
        if page.uploads.len() as u32 > max_uploads {
            page.uploads.truncate(max_uploads as usize);
            page.is_truncated = true;
            if let Some(last) = page.uploads.last() {
                page.next_key_marker = Some(last.key.clone());
                page.next_upload_id_marker = Some(last.upload_id.clone());
            }
        }
        Ok(page)
    }

    fn reap_expired_uploads(&self, max_age_seconds: u64) -> Result<Vec<UploadRecord>, S3Error> {
        let cutoff = iso8601_millis(Utc::now() - Duration::seconds(max_age_seconds as i64));
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut expired = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM multipart_uploads WHERE initiated < ?1",
                UPLOAD_COLS
            ))?;
            let rows = stmt.query_map(params![cutoff], row_to_upload)?;
            for row in rows {
                expired.push(row?);
            }
        }
        for upload in &expired {
            tx.execute(
                "DELETE FROM multipart_parts WHERE upload_id = ?1",
                params![upload.upload_id],
            )?;
            tx.execute(
                "DELETE FROM multipart_uploads WHERE upload_id = ?1",
                params![upload.upload_id],
            )?;
        }
        tx.commit()?;
        if !expired.is_empty() {
            warn!("reaped {} expired multipart uploads", expired.len());
        }
        Ok(expired)
    }

    fn get_credential(&self, access_key_id: &str) -> Result<Option<CredentialRecord>, S3Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT access_key_id, secret_key, owner_id, active FROM credentials \
             WHERE access_key_id = ?1 AND active = 1",
        )?;
        let result = stmt.query_row(params![access_key_id], |row| {
            let active: i64 = row.get(3)?;
            Ok(CredentialRecord {
                access_key_id: row.get(0)?,
                secret_key: row.get(1)?,
                owner_id: row.get(2)?,
                active: active != 0,
            })
        });
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put_credential(&self, record: &CredentialRecord) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO credentials (access_key_id, secret_key, owner_id, active) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.access_key_id,
                record.secret_key,
                record.owner_id,
                record.active as i64,
            ],
        )?;
        Ok(())
    }

    fn seed_credential(&self, record: &CredentialRecord) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO credentials (access_key_id, secret_key, owner_id, active) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.access_key_id,
                record.secret_key,
                record.owner_id,
                record.active as i64,
            ],
        )?;
        Ok(())
    }

    fn count_buckets(&self) -> Result<u64, S3Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM buckets", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn count_objects(&self) -> Result<u64, S3Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::S3ErrorCode;
    use std::collections::HashMap;

    fn test_store() -> SqliteMetadataStore {
        SqliteMetadataStore::from_connection(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn bucket(name: &str) -> BucketRecord {
        BucketRecord {
            name: name.to_string(),
            creation_date: "2026-01-01T00:00:00.000Z".to_string(),
            region: "us-east-1".to_string(),
            owner_id: "owner1".to_string(),
            owner_display: "owner1".to_string(),
            acl_json: "{}".to_string(),
        }
    }

    fn object(bucket: &str, key: &str, size: u64) -> ObjectRecord {
        ObjectRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
            etag: "\"d41d8cd98f00b204e9800998ecf8427e\"".to_string(),
            content_type: "application/octet-stream".to_string(),
            last_modified: "2026-01-01T00:00:00.000Z".to_string(),
            storage_class: "STANDARD".to_string(),
            acl_json: "{}".to_string(),
            user_metadata: HashMap::new(),
            content_encoding: None,
            content_language: None,
            content_disposition: None,
            cache_control: None,
            expires: None,
        }
    }

    fn upload(id: &str, bucket: &str, key: &str) -> UploadRecord {
        UploadRecord {
            upload_id: id.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            initiated: "2026-01-01T00:00:00.000Z".to_string(),
            content_type: "application/octet-stream".to_string(),
            user_metadata: HashMap::new(),
            acl_json: "{}".to_string(),
            owner_id: "owner1".to_string(),
            owner_display: "owner1".to_string(),
            storage_class: "STANDARD".to_string(),
            content_encoding: None,
            content_language: None,
            content_disposition: None,
            cache_control: None,
            expires: None,
        }
    }

    #[test]
    fn test_bucket_lifecycle() {
        let store = test_store();
        store.create_bucket(&bucket("alpha")).unwrap();
        assert!(store.bucket_exists("alpha").unwrap());
        assert_eq!(store.count_buckets().unwrap(), 1);

        let dup = store.create_bucket(&bucket("alpha")).unwrap_err();
        assert_eq!(dup.code(), S3ErrorCode::BucketAlreadyExists);

        store.put_object(&object("alpha", "k", 1)).unwrap();
        let not_empty = store.delete_bucket("alpha").unwrap_err();
        assert_eq!(not_empty.code(), S3ErrorCode::BucketNotEmpty);

        store.delete_object("alpha", "k").unwrap();
        store.delete_bucket("alpha").unwrap();
        assert!(!store.bucket_exists("alpha").unwrap());

        let missing = store.delete_bucket("alpha").unwrap_err();
        assert_eq!(missing.code(), S3ErrorCode::NoSuchBucket);
    }

    #[test]
    fn test_object_upsert_and_idempotent_delete() {
        let store = test_store();
        store.create_bucket(&bucket("b")).unwrap();

        let mut first = object("b", "k", 5);
        first.etag = "\"aaaa\"".to_string();
        store.put_object(&first).unwrap();

        let mut second = object("b", "k", 9);
        second.etag = "\"bbbb\"".to_string();
        store.put_object(&second).unwrap();

        let fetched = store.get_object("b", "k").unwrap().unwrap();
        assert_eq!(fetched.size, 9);
        assert_eq!(fetched.etag, "\"bbbb\"");
        assert_eq!(store.count_objects().unwrap(), 1);

        assert!(store.delete_object("b", "k").unwrap());
        assert!(!store.delete_object("b", "k").unwrap());
        assert!(store.get_object("b", "k").unwrap().is_none());
    }

    #[test]
    fn test_delete_objects_reports_present_keys() {
        let store = test_store();
        store.create_bucket(&bucket("b")).unwrap();
        store.put_object(&object("b", "one", 1)).unwrap();
        store.put_object(&object("b", "two", 1)).unwrap();

        let deleted = store
            .delete_objects(
                "b",
                &["one".to_string(), "ghost".to_string(), "two".to_string()],
            )
            .unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(deleted.contains(&"one".to_string()));
        assert!(deleted.contains(&"two".to_string()));
        assert_eq!(store.count_objects().unwrap(), 0);
    }

    #[test]
    fn test_list_objects_prefix_and_delimiter() {
        let store = test_store();
        store.create_bucket(&bucket("b")).unwrap();
        for key in [
            "photos/2024/a.jpg",
            "photos/2024/b.jpg",
            "photos/2025/c.jpg",
            "photos/readme.txt",
            "video.mp4",
        ] {
            store.put_object(&object("b", key, 1)).unwrap();
        }

        let page = store
            .list_objects(
                "b",
                &ListObjectsQuery {
                    prefix: "photos/".to_string(),
                    delimiter: "/".to_string(),
                    start_after: String::new(),
                    max_keys: 1000,
                },
            )
            .unwrap();
        assert_eq!(
            page.common_prefixes,
            vec!["photos/2024/".to_string(), "photos/2025/".to_string()]
        );
        let keys: Vec<&str> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["photos/readme.txt"]);
        assert!(!page.is_truncated);
    }

    #[test]
    fn test_list_objects_pagination() {
        let store = test_store();
        store.create_bucket(&bucket("b")).unwrap();
        for key in ["a", "b", "c", "d"] {
            store.put_object(&object("b", key, 1)).unwrap();
        }

        let first = store
            .list_objects(
                "b",
                &ListObjectsQuery {
                    max_keys: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(first.is_truncated);
        assert_eq!(first.next_token.as_deref(), Some("b"));

        let second = store
            .list_objects(
                "b",
                &ListObjectsQuery {
                    start_after: "b".to_string(),
                    max_keys: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        let keys: Vec<&str> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "d"]);
        assert!(!second.is_truncated);

        let empty = store
            .list_objects(
                "b",
                &ListObjectsQuery {
                    max_keys: 0,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(empty.objects.is_empty());
        assert!(!empty.is_truncated);
    }

    #[test]
    fn test_multipart_complete_is_atomic() {
        let store = test_store();
        store.create_bucket(&bucket("b")).unwrap();
        store.create_upload(&upload("u1", "b", "big")).unwrap();
        for n in 1..=3u32 {
            store
                .put_part(
                    "u1",
                    &PartRecord {
                        part_number: n,
                        size: 5,
                        etag: format!("\"etag{}\"", n),
                        stored_at: "2026-01-01T00:00:00.000Z".to_string(),
                    },
                )
                .unwrap();
        }
        assert_eq!(store.get_parts_for_completion("u1").unwrap().len(), 3);

        store
            .complete_upload("u1", &object("b", "big", 15))
            .unwrap();
        assert!(store.get_object("b", "big").unwrap().is_some());
        assert!(store.get_upload("u1").unwrap().is_none());
        assert!(store.get_parts_for_completion("u1").unwrap().is_empty());

        let gone = store
            .complete_upload("u1", &object("b", "big", 15))
            .unwrap_err();
        assert_eq!(gone.code(), S3ErrorCode::NoSuchUpload);
    }

    #[test]
    fn test_part_upsert_replaces() {
        let store = test_store();
        store.create_bucket(&bucket("b")).unwrap();
        store.create_upload(&upload("u1", "b", "k")).unwrap();
        for etag in ["\"old\"", "\"new\""] {
            store
                .put_part(
                    "u1",
                    &PartRecord {
                        part_number: 1,
                        size: 5,
                        etag: etag.to_string(),
                        stored_at: "2026-01-01T00:00:00.000Z".to_string(),
                    },
                )
                .unwrap();
        }
        let parts = store.get_parts_for_completion("u1").unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].etag, "\"new\"");
    }

    #[test]
    fn test_abort_upload_cascades() {
        let store = test_store();
        store.create_bucket(&bucket("b")).unwrap();
        store.create_upload(&upload("u1", "b", "k")).unwrap();
        store
            .put_part(
                "u1",
                &PartRecord {
                    part_number: 1,
                    size: 5,
                    etag: "\"e\"".to_string(),
                    stored_at: "2026-01-01T00:00:00.000Z".to_string(),
                },
            )
            .unwrap();
        store.abort_upload("u1").unwrap();
        assert!(store.get_upload("u1").unwrap().is_none());
        assert!(store.get_parts_for_completion("u1").unwrap().is_empty());

        let gone = store.abort_upload("u1").unwrap_err();
        assert_eq!(gone.code(), S3ErrorCode::NoSuchUpload);
    }

    #[test]
    fn test_reap_expired_uploads() {
        let store = test_store();
        store.create_bucket(&bucket("b")).unwrap();
        let mut old = upload("old", "b", "k1");
        old.initiated = "2020-01-01T00:00:00.000Z".to_string();
        store.create_upload(&old).unwrap();
        let mut fresh = upload("fresh", "b", "k2");
        fresh.initiated = iso8601_millis(Utc::now());
        store.create_upload(&fresh).unwrap();

        let reaped = store.reap_expired_uploads(7 * 24 * 3600).unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].upload_id, "old");
        assert!(store.get_upload("old").unwrap().is_none());
        assert!(store.get_upload("fresh").unwrap().is_some());
    }

    #[test]
    fn test_credential_seed_is_idempotent() {
        let store = test_store();
        let record = CredentialRecord {
            access_key_id: "AKIA1".to_string(),
            secret_key: "secret1".to_string(),
            owner_id: "owner1".to_string(),
            active: true,
        };
        store.seed_credential(&record).unwrap();

        let mut changed = record.clone();
        changed.secret_key = "secret2".to_string();
        store.seed_credential(&changed).unwrap();

        let fetched = store.get_credential("AKIA1").unwrap().unwrap();
        assert_eq!(fetched.secret_key, "secret1");

        store.put_credential(&changed).unwrap();
        let fetched = store.get_credential("AKIA1").unwrap().unwrap();
        assert_eq!(fetched.secret_key, "secret2");

        let mut inactive = changed.clone();
        inactive.active = false;
        store.put_credential(&inactive).unwrap();
        assert!(store.get_credential("AKIA1").unwrap().is_none());
    }
}
