use std::sync::Arc;

use chrono::Utc;
use md5::{Digest, Md5};

use driftbay_checksum as checksum;
use driftbay_session::{
    CompletedPart, FinalizedObject, PartRecord, Result, SessionRegistry, UploadError, UploadKind,
    UploadSession, UploadStatus,
};

use crate::store::{ByteStream, LocalStore};

pub const MIN_PART_NUMBER: i32 = 1;
pub const MAX_PART_NUMBER: i32 = 10_000;

/// One page of parts, ascending by part number.
#[derive(Debug, Clone)]
pub struct PartListing {
    pub parts: Vec<PartRecord>,
    pub max_parts: i32,
    pub part_number_marker: Option<i32>,
    pub next_part_number_marker: Option<i32>,
    pub is_truncated: bool,
}

/// One page of in-progress uploads for a bucket.
#[derive(Debug, Clone)]
pub struct UploadListing {
    pub uploads: Vec<UploadSession>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListUploadsParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub key_marker: Option<String>,
    pub upload_id_marker: Option<String>,
    pub max_uploads: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct CompleteResult {
    pub location: String,
    pub bucket: String,
    pub key: String,
    pub etag: String,
}

/// The multipart pipeline: numbered parts land in any order, each getting a
/// content-derived etag; complete assembles the referenced parts into the
/// object and the composite etag.
pub struct MultipartEngine {
    registry: Arc<SessionRegistry>,
    store: LocalStore,
}

impl MultipartEngine {
    pub fn new(registry: Arc<SessionRegistry>, store: LocalStore) -> Self {
        Self { registry, store }
    }

    /// Initiates an upload. The id is always server-issued.
    pub async fn create(&self, bucket: &str, key: &str) -> Result<UploadSession> {
        let session = self.registry.create(bucket, key, UploadKind::Multipart);
        self.store.create_upload_dir(&session.upload_id).await?;
        tracing::debug!(upload_id = %session.upload_id, bucket, key, "multipart upload created");
        Ok(session)
    }

    /// Accepts one part. Re-uploading a part number replaces the prior bytes
    /// and record; a checksum failure leaves whatever was there before.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: i32,
        data: ByteStream,
        expected_crc32c: Option<u32>,
    ) -> Result<PartRecord> {
        let session = self.multipart_session(upload_id)?;
        if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(UploadError::invalid_argument(
                upload_id,
                format!(
                    "part number {part_number} outside {MIN_PART_NUMBER}..={MAX_PART_NUMBER}"
                ),
            ));
        }
        if session.status != UploadStatus::Open {
            return Err(UploadError::failed_precondition(
                upload_id,
                session.status,
                format!("cannot accept part {part_number}"),
            ));
        }

        let staged = self.store.stage_part(upload_id, data).await?;
        if let Err(mismatch) = checksum::verify_crc32c(expected_crc32c, staged.crc32c) {
            self.store.discard_staged(staged).await?;
            return Err(mismatch.into());
        }

        let record = PartRecord {
            part_number,
            etag: staged.etag.clone(),
            size: staged.size,
            crc32c: Some(staged.crc32c),
            last_modified: Utc::now(),
        };
        self.store.install_part(upload_id, part_number, staged).await?;

        // The session may have aborted while the bytes were in flight; the
        // registry rejects the record and the bytes are dropped, not revived.
        if let Err(e) = self.registry.add_part(upload_id, record.clone()) {
            let _ = self.store.remove_part(upload_id, part_number).await;
            return Err(e);
        }
        Ok(record)
    }

    /// Parts uploaded so far, ascending, paged by part-number cursor.
    pub fn list_parts(
        &self,
        upload_id: &str,
        max_parts: Option<i32>,
        part_number_marker: Option<i32>,
    ) -> Result<PartListing> {
        let session = self.multipart_session(upload_id)?;
        let max = max_parts.unwrap_or(1000).clamp(1, 1000);

        let mut parts = session.parts;
        parts.sort_by_key(|p| p.part_number);
        if let Some(marker) = part_number_marker {
            parts.retain(|p| p.part_number > marker);
        }
        let is_truncated = parts.len() > max as usize;
        parts.truncate(max as usize);

        Ok(PartListing {
            next_part_number_marker: is_truncated
                .then(|| parts.last().map(|p| p.part_number))
                .flatten(),
            parts,
            max_parts: max,
            part_number_marker,
            is_truncated,
        })
    }

    /// Assembles the referenced parts into the final object. The completed
    /// list must be non-empty, ordered by part number, and reference only
    /// `(part_number, etag)` pairs exactly as uploaded.
    pub async fn complete(
        &self,
        upload_id: &str,
        completed: &[CompletedPart],
    ) -> Result<CompleteResult> {
        let session = self.multipart_session(upload_id)?;
        if completed.is_empty() {
            return Err(UploadError::invalid_argument(
                upload_id,
                "completed parts list is empty",
            ));
        }
        for pair in completed.windows(2) {
            if pair[1].part_number <= pair[0].part_number {
                return Err(UploadError::invalid_argument(
                    upload_id,
                    format!(
                        "completed parts must be ordered by part number ({} then {})",
                        pair[0].part_number, pair[1].part_number
                    ),
                ));
            }
        }

        self.registry.begin_finalize(upload_id, Some(completed))?;

        let numbers: Vec<i32> = completed.iter().map(|c| c.part_number).collect();
        let (size, crc) = self
            .store
            .assemble_object(upload_id, &numbers, &session.bucket, &session.key)
            .await?;

        // Composite etag: md5 over the part etags, dash, part count.
        let mut hasher = Md5::new();
        for part in completed {
            hasher.update(part.etag.as_bytes());
        }
        let etag = format!("{:x}-{}", hasher.finalize(), completed.len());

        self.registry.commit_finalize(
            upload_id,
            FinalizedObject {
                bucket: session.bucket.clone(),
                key: session.key.clone(),
                size,
                etag: etag.clone(),
                crc32c: Some(crc),
                finished_at: Utc::now(),
            },
        )?;

        if let Err(e) = self.store.remove_upload_dir(upload_id).await {
            tracing::warn!(upload_id, error = %e, "leaving multipart scratch behind");
        }
        tracing::info!(upload_id, size, parts = completed.len(), "multipart upload complete");

        Ok(CompleteResult {
            location: format!("/{}/{}", session.bucket, session.key),
            bucket: session.bucket,
            key: session.key,
            etag,
        })
    }

    /// Aborts the upload and releases every part's bytes. Safe to repeat.
    pub async fn abort(&self, upload_id: &str) -> Result<UploadSession> {
        let session = self.multipart_session(upload_id)?;
        let session = self.registry.abort(&session.upload_id)?;
        self.store.remove_upload_dir(upload_id).await?;
        Ok(session)
    }

    /// In-progress uploads for a bucket, lexicographic by `(key, upload_id)`,
    /// with delimiter grouping into de-duplicated common prefixes.
    pub fn list_uploads(&self, bucket: &str, params: &ListUploadsParams) -> UploadListing {
        let max = params.max_uploads.unwrap_or(1000).clamp(1, 1000) as usize;
        let prefix = params.prefix.as_deref().unwrap_or("");
        let sessions = self
            .registry
            .list_open_for_bucket(bucket, UploadKind::Multipart);

        let after_marker = |s: &UploadSession| match (&params.key_marker, &params.upload_id_marker) {
            (None, _) => true,
            (Some(km), None) => s.key.as_str() > km.as_str(),
            (Some(km), Some(um)) => {
                s.key.as_str() > km.as_str()
                    || (s.key == *km && s.upload_id.as_str() > um.as_str())
            }
        };

        let mut uploads = Vec::new();
        let mut common_prefixes: Vec<String> = Vec::new();
        let mut emitted = 0usize;
        let mut is_truncated = false;
        let mut next_key_marker = None;
        let mut next_upload_id_marker = None;

        for session in sessions
            .iter()
            .filter(|s| s.key.starts_with(prefix))
            .filter(|s| after_marker(s))
        {
            let group = params.delimiter.as_deref().filter(|d| !d.is_empty()).and_then(|d| {
                session.key[prefix.len()..]
                    .find(d)
                    .map(|i| session.key[..prefix.len() + i + d.len()].to_string())
            });
            match group {
                Some(p) => {
                    // Keys are sorted, so entries under one prefix are
                    // adjacent; repeats collapse into the last emitted entry.
                    if common_prefixes.last() != Some(&p) {
                        if emitted == max {
                            is_truncated = true;
                            break;
                        }
                        common_prefixes.push(p);
                        emitted += 1;
                    }
                }
                None => {
                    if emitted == max {
                        is_truncated = true;
                        break;
                    }
                    uploads.push(session.clone());
                    emitted += 1;
                }
            }
            next_key_marker = Some(session.key.clone());
            next_upload_id_marker = Some(session.upload_id.clone());
        }

        if !is_truncated {
            next_key_marker = None;
            next_upload_id_marker = None;
        }
        UploadListing {
            uploads,
            common_prefixes,
            is_truncated,
            next_key_marker,
            next_upload_id_marker,
        }
    }

    fn multipart_session(&self, upload_id: &str) -> Result<UploadSession> {
        let session = self.registry.get(upload_id)?;
        if session.kind != UploadKind::Multipart {
            return Err(UploadError::invalid_argument(
                upload_id,
                "not a multipart upload",
            ));
        }
        Ok(session)
    }
}
