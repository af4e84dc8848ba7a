//! SQLite blob-table storage backend.
//!
//! Keeps object bytes in a second SQLite database so a deployment can live
//! in two files (metadata + data). Durability rides on the same WAL
//! discipline as the metadata engine.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection};

use crate::errors::{S3Error, S3ErrorCode};
use crate::storage::{composite_etag, etag_of, AssemblePart, StorageBackend};

pub struct SqliteStorageBackend {
    conn: Mutex<Connection>,
}

impl SqliteStorageBackend {
    pub fn open(path: &Path) -> Result<Self, S3Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, S3Error> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blobs (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            );
            CREATE TABLE IF NOT EXISTS part_blobs (
                upload_id TEXT NOT NULL,
                part_number INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (upload_id, part_number)
            );",
        )?;
        Ok(SqliteStorageBackend {
            conn: Mutex::new(conn),
        })
    }

    fn read_blob(&self, bucket: &str, key: &str) -> Result<Vec<u8>, S3Error> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT data FROM blobs WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
            |row| row.get::<_, Vec<u8>>(0),
        );
        match result {
            Ok(data) => Ok(data),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(S3Error::new(S3ErrorCode::NoSuchKey)),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageBackend for SqliteStorageBackend {
    async fn create_bucket(&self, _bucket: &str) -> Result<(), S3Error> {
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM blobs WHERE bucket = ?1", params![bucket])?;
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
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO blobs (bucket, key, data) VALUES (?1, ?2, ?3)",
            params![bucket, key, data.as_ref()],
        )?;
        Ok((size, etag))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, S3Error> {
        self.read_blob(bucket, key).map(Bytes::from)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, S3Error> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT LENGTH(data) FROM blobs WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(len) => Ok(len as u64),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(S3Error::new(S3ErrorCode::NoSuchKey)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM blobs WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        Ok(())
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<String, S3Error> {
        let data = self.read_blob(src_bucket, src_key)?;
        let etag = etag_of(&data);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO blobs (bucket, key, data) VALUES (?1, ?2, ?3)",
            params![dst_bucket, dst_key, data],
        )?;
        Ok(etag)
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
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO part_blobs (upload_id, part_number, data) \
             VALUES (?1, ?2, ?3)",
            params![upload_id, part_number, data.as_ref()],
        )?;
        Ok(etag)
    }

    async fn assemble_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[AssemblePart],
    ) -> Result<String, S3Error> {
        let mut assembled = Vec::new();
        let mut part_etags = Vec::with_capacity(parts.len());
        {
            let conn = self.conn.lock().unwrap();
            for part in parts {
                let result = conn.query_row(
                    "SELECT data FROM part_blobs WHERE upload_id = ?1 AND part_number = ?2",
                    params![upload_id, part.part_number],
                    |row| row.get::<_, Vec<u8>>(0),
                );
                let data = match result {
                    Ok(data) => data,
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        return Err(S3Error::new(S3ErrorCode::InvalidPart))
                    }
                    Err(e) => return Err(e.into()),
                };
                part_etags.push(part.etag.clone());
                assembled.extend_from_slice(&data);
            }
        }
        self.put_object(bucket, key, Bytes::from(assembled)).await?;
        self.delete_parts(bucket, key, upload_id).await?;
        composite_etag(&part_etags)
    }

    async fn delete_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM part_blobs WHERE upload_id = ?1",
            params![upload_id],
        )?;
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, S3Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blobs WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn health_check(&self) -> Result<(), S3Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(())).map_err(|_| {
            S3Error::with_message(S3ErrorCode::ServiceUnavailable, "storage database unavailable")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> SqliteStorageBackend {
        SqliteStorageBackend::from_connection(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[actix_web::test]
    async fn test_round_trip() {
        let backend = test_backend();
        let (size, etag) = backend
            .put_object("b", "k", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(size, 5);
        assert_eq!(etag, "\"5d41402abc4b2a76b9719d911017c592\"");
        assert_eq!(backend.head_object("b", "k").await.unwrap(), 5);

        let copied = backend.copy_object("b", "k", "b", "k2").await.unwrap();
        assert_eq!(copied, etag);

        backend.delete_object("b", "k").await.unwrap();
        assert!(!backend.exists("b", "k").await.unwrap());
        assert!(backend.exists("b", "k2").await.unwrap());
    }

    #[actix_web::test]
    async fn test_multipart_assembly() {
        let backend = test_backend();
        let e1 = backend
            .put_part("b", "k", "u", 1, Bytes::from_static(b"aa"))
            .await
            .unwrap();
        let e2 = backend
            .put_part("b", "k", "u", 2, Bytes::from_static(b"bb"))
            .await
            .unwrap();
        let spec = vec![
            AssemblePart {
                part_number: 1,
                etag: e1.clone(),
            },
            AssemblePart {
                part_number: 2,
                etag: e2.clone(),
            },
        ];
        let etag = backend.assemble_parts("b", "k", "u", &spec).await.unwrap();
        assert_eq!(etag, composite_etag(&[e1, e2]).unwrap());
        assert_eq!(
            backend.get_object("b", "k").await.unwrap(),
            Bytes::from_static(b"aabb")
        );
    }
}
