use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub id: Uuid,
    pub name: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A finished object's durable record. Bytes live in the store; this is the
/// metadata the API serves for GET/HEAD/listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub key: String,
    pub etag: String,
    pub size: i64,
    pub crc32c: Option<u32>,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBucketRequest {
    pub name: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct PutObjectRecord {
    pub bucket_id: Uuid,
    pub key: String,
    pub etag: String,
    pub size: i64,
    pub crc32c: Option<u32>,
    pub content_type: String,
}
