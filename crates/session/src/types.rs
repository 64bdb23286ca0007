use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadKind {
    /// Chunked stream with offsets, resumable via status queries.
    Stream,
    /// Numbered parts uploaded in any order, assembled at complete.
    Multipart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    Open,
    Finalizing,
    Complete,
    Aborted,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Aborted)
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UploadStatus::Open => "open",
            UploadStatus::Finalizing => "finalizing",
            UploadStatus::Complete => "complete",
            UploadStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One uploaded part of a multipart session. The etag is assigned when the
/// part's bytes land and never changes; re-uploading the part number installs
/// a whole new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartRecord {
    pub part_number: i32,
    pub etag: String,
    pub size: u64,
    pub crc32c: Option<u32>,
    pub last_modified: DateTime<Utc>,
}

/// A `(part_number, etag)` reference in a complete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Declared whole-object expectations, verified once at finalize.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectChecksums {
    pub crc32c: Option<u32>,
    pub md5_hash: Option<Vec<u8>>,
}

impl ObjectChecksums {
    pub fn is_empty(&self) -> bool {
        self.crc32c.is_none() && self.md5_hash.is_none()
    }
}

/// Metadata of an object produced by a completed upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedObject {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub crc32c: Option<u32>,
    pub finished_at: DateTime<Utc>,
}

/// Result of a status query. Exactly one side exists: either the upload is
/// still accumulating bytes or it has become an object.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    Persisted { size: u64 },
    Resource(FinalizedObject),
}

/// One in-progress or completed upload. Owned by the registry; callers get
/// snapshots.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub kind: UploadKind,
    pub status: UploadStatus,
    pub persisted_size: u64,
    pub parts: Vec<PartRecord>,
    pub resource: Option<FinalizedObject>,
    pub created_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn part(&self, part_number: i32) -> Option<&PartRecord> {
        self.parts.iter().find(|p| p.part_number == part_number)
    }
}
