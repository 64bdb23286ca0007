use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use uuid::Uuid;

use crate::models::*;

fn parse_timestamp(raw: &str) -> Result<chrono::DateTime<Utc>> {
    Ok(chrono::DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

pub struct BucketRepository {
    pool: SqlitePool,
}

impl BucketRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &SqliteRow) -> Result<Bucket> {
        Ok(Bucket {
            id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            name: row.get("name"),
            region: row.get("region"),
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
        })
    }

    pub async fn create(&self, req: CreateBucketRequest) -> Result<Bucket> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO buckets (id, name, region, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&req.name)
        .bind(&req.region)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Bucket {
            id,
            name: req.name,
            region: req.region,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Bucket>> {
        let row = sqlx::query(
            "SELECT id, name, region, created_at, updated_at FROM buckets WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Bucket>> {
        let rows = sqlx::query(
            "SELECT id, name, region, created_at, updated_at FROM buckets ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::from_row).collect()
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

pub struct ObjectRepository {
    pool: SqlitePool,
}

impl ObjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &SqliteRow) -> Result<Object> {
        Ok(Object {
            id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            bucket_id: Uuid::parse_str(&row.get::<String, _>("bucket_id"))?,
            key: row.get("key"),
            etag: row.get("etag"),
            size: row.get("size"),
            crc32c: row.get::<Option<i64>, _>("crc32c").map(|v| v as u32),
            content_type: row.get("content_type"),
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
        })
    }

    /// Records a finished upload. Re-uploading a key replaces its record.
    pub async fn upsert(&self, record: PutObjectRecord) -> Result<Object> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO objects (id, bucket_id, key, etag, size, crc32c, content_type, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (bucket_id, key) DO UPDATE SET
                etag = excluded.etag,
                size = excluded.size,
                crc32c = excluded.crc32c,
                content_type = excluded.content_type,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id.to_string())
        .bind(record.bucket_id.to_string())
        .bind(&record.key)
        .bind(&record.etag)
        .bind(record.size)
        .bind(record.crc32c.map(|v| v as i64))
        .bind(&record.content_type)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        // The insert may have been folded into an update; re-read the row so
        // the caller sees the surviving id and created_at.
        self.find_by_bucket_and_key(record.bucket_id, &record.key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("object vanished during upsert"))
    }

    pub async fn find_by_bucket_and_key(&self, bucket_id: Uuid, key: &str) -> Result<Option<Object>> {
        let row = sqlx::query(
            r#"
            SELECT id, bucket_id, key, etag, size, crc32c, content_type, created_at, updated_at
            FROM objects
            WHERE bucket_id = ? AND key = ?
            "#,
        )
        .bind(bucket_id.to_string())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    pub async fn list_by_bucket(
        &self,
        bucket_id: Uuid,
        prefix: Option<&str>,
        limit: Option<i32>,
    ) -> Result<Vec<Object>> {
        let limit = limit.unwrap_or(1000).min(1000);
        let like_pattern = format!("{}%", prefix.unwrap_or(""));

        let rows = sqlx::query(
            r#"
            SELECT id, bucket_id, key, etag, size, crc32c, content_type, created_at, updated_at
            FROM objects
            WHERE bucket_id = ? AND key LIKE ?
            ORDER BY key
            LIMIT ?
            "#,
        )
        .bind(bucket_id.to_string())
        .bind(&like_pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::from_row).collect()
    }

    pub async fn delete(&self, bucket_id: Uuid, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE bucket_id = ? AND key = ?")
            .bind(bucket_id.to_string())
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
