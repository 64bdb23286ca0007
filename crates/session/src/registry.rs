use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::error::{Result, UploadError};
use crate::types::{
    CompletedPart, FinalizedObject, PartRecord, UploadKind, UploadSession, UploadStatus,
};

/// The one shared-mutable-state component. Each session sits behind its own
/// lock, so state transitions are exclusive per session while unrelated
/// sessions proceed concurrently. A finalize/abort race resolves to whichever
/// call takes the session lock first; the loser observes the winner's terminal
/// state as `FailedPrecondition`.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session with a server-issued id.
    pub fn create(&self, bucket: &str, key: &str, kind: UploadKind) -> UploadSession {
        let prefix = match kind {
            UploadKind::Stream => "upl",
            UploadKind::Multipart => "mpu",
        };
        let upload_id = format!("{}_{}", prefix, Uuid::new_v4());
        // Fresh v4 ids do not collide in practice; insert unconditionally.
        self.insert(upload_id, bucket, key, kind)
    }

    /// Registers a session under a client-chosen id (resumable stream tokens).
    pub fn create_with_id(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        kind: UploadKind,
    ) -> Result<UploadSession> {
        if read(&self.sessions).contains_key(upload_id) {
            return Err(UploadError::AlreadyExists {
                upload_id: upload_id.to_string(),
            });
        }
        // Re-check under the write lock; two racing creates must not both win.
        let mut sessions = write(&self.sessions);
        if sessions.contains_key(upload_id) {
            return Err(UploadError::AlreadyExists {
                upload_id: upload_id.to_string(),
            });
        }
        let session = Self::new_session(upload_id.to_string(), bucket, key, kind);
        sessions.insert(upload_id.to_string(), Arc::new(Mutex::new(session.clone())));
        tracing::debug!(upload_id, bucket, key, "registered upload session");
        Ok(session)
    }

    fn insert(&self, upload_id: String, bucket: &str, key: &str, kind: UploadKind) -> UploadSession {
        let session = Self::new_session(upload_id.clone(), bucket, key, kind);
        write(&self.sessions).insert(upload_id.clone(), Arc::new(Mutex::new(session.clone())));
        tracing::debug!(%upload_id, bucket, key, "registered upload session");
        session
    }

    fn new_session(upload_id: String, bucket: &str, key: &str, kind: UploadKind) -> UploadSession {
        let now = Utc::now();
        UploadSession {
            upload_id,
            bucket: bucket.to_string(),
            key: key.to_string(),
            kind,
            status: UploadStatus::Open,
            persisted_size: 0,
            parts: Vec::new(),
            resource: None,
            created_at: now,
            state_changed_at: now,
        }
    }

    fn entry(&self, upload_id: &str) -> Result<Arc<Mutex<UploadSession>>> {
        read(&self.sessions)
            .get(upload_id)
            .cloned()
            .ok_or_else(|| UploadError::not_found(upload_id))
    }

    /// Snapshot of the current session state.
    pub fn get(&self, upload_id: &str) -> Result<UploadSession> {
        let entry = self.entry(upload_id)?;
        let session = lock(&entry);
        Ok(session.clone())
    }

    /// Moves the durable high-water mark forward. Equal is a no-op; going
    /// backwards is a caller bug.
    pub fn advance(&self, upload_id: &str, new_persisted_size: u64) -> Result<u64> {
        let entry = self.entry(upload_id)?;
        let mut session = lock(&entry);
        if session.status != UploadStatus::Open {
            return Err(UploadError::failed_precondition(
                upload_id,
                session.status,
                "cannot accept bytes",
            ));
        }
        if new_persisted_size < session.persisted_size {
            return Err(UploadError::invalid_argument(
                upload_id,
                format!(
                    "persisted size may not regress: {} -> {}",
                    session.persisted_size, new_persisted_size
                ),
            ));
        }
        session.persisted_size = new_persisted_size;
        Ok(session.persisted_size)
    }

    /// Installs a part record. Part numbers need not arrive in order, but each
    /// is unique within the session; a duplicate replaces the prior record.
    pub fn add_part(&self, upload_id: &str, part: PartRecord) -> Result<()> {
        let entry = self.entry(upload_id)?;
        let mut session = lock(&entry);
        if session.status != UploadStatus::Open {
            return Err(UploadError::failed_precondition(
                upload_id,
                session.status,
                format!("cannot accept part {}", part.part_number),
            ));
        }
        match session
            .parts
            .iter_mut()
            .find(|p| p.part_number == part.part_number)
        {
            Some(existing) => *existing = part,
            None => session.parts.push(part),
        }
        Ok(())
    }

    /// First half of completion: validates and enters `Finalizing`, so racing
    /// writes and parts fail fast while the byte store assembles the object.
    ///
    /// With a completed-parts list, every `(part_number, etag)` pair must match
    /// a registered part exactly; a stale etag from a superseded part upload is
    /// rejected and the session stays open.
    pub fn begin_finalize(
        &self,
        upload_id: &str,
        completed: Option<&[CompletedPart]>,
    ) -> Result<UploadSession> {
        let entry = self.entry(upload_id)?;
        let mut session = lock(&entry);
        if session.status != UploadStatus::Open {
            return Err(UploadError::failed_precondition(
                upload_id,
                session.status,
                "cannot finalize",
            ));
        }
        if let Some(completed) = completed {
            for candidate in completed {
                let known = session
                    .part(candidate.part_number)
                    .is_some_and(|p| p.etag == candidate.etag);
                if !known {
                    return Err(UploadError::invalid_argument(
                        upload_id,
                        format!(
                            "part {} with etag {:?} was never uploaded",
                            candidate.part_number, candidate.etag
                        ),
                    ));
                }
            }
        }
        session.status = UploadStatus::Finalizing;
        session.state_changed_at = Utc::now();
        Ok(session.clone())
    }

    /// Second half of completion: records the finalized object.
    pub fn commit_finalize(
        &self,
        upload_id: &str,
        resource: FinalizedObject,
    ) -> Result<UploadSession> {
        let entry = self.entry(upload_id)?;
        let mut session = lock(&entry);
        if session.status != UploadStatus::Finalizing {
            return Err(UploadError::failed_precondition(
                upload_id,
                session.status,
                "finalize was not begun or was lost to an abort",
            ));
        }
        session.status = UploadStatus::Complete;
        session.resource = Some(resource);
        session.state_changed_at = Utc::now();
        tracing::info!(upload_id, size = session.persisted_size, "upload complete");
        Ok(session.clone())
    }

    /// Aborts from `Open` or `Finalizing`. Aborting an aborted session is a
    /// no-op; aborting a completed one is an error.
    pub fn abort(&self, upload_id: &str) -> Result<UploadSession> {
        let entry = self.entry(upload_id)?;
        let mut session = lock(&entry);
        match session.status {
            UploadStatus::Aborted => Ok(session.clone()),
            UploadStatus::Complete => Err(UploadError::failed_precondition(
                upload_id,
                session.status,
                "cannot abort a completed upload",
            )),
            UploadStatus::Open | UploadStatus::Finalizing => {
                session.status = UploadStatus::Aborted;
                session.state_changed_at = Utc::now();
                tracing::info!(upload_id, "upload aborted");
                Ok(session.clone())
            }
        }
    }

    /// Open sessions for a bucket, for listing in-progress uploads.
    pub fn list_open_for_bucket(&self, bucket: &str, kind: UploadKind) -> Vec<UploadSession> {
        let sessions = read(&self.sessions);
        let mut open: Vec<UploadSession> = sessions
            .values()
            .map(|entry| lock(entry).clone())
            .filter(|s| s.bucket == bucket && s.kind == kind && s.status == UploadStatus::Open)
            .collect();
        open.sort_by(|a, b| (&a.key, &a.upload_id).cmp(&(&b.key, &b.upload_id)));
        open
    }

    /// Drops terminal sessions whose last transition is older than the
    /// retention window. Returns the ids removed so storage scratch can go too.
    pub fn purge_terminal(&self, retention: Duration) -> Vec<String> {
        let cutoff = Utc::now() - retention;
        let mut sessions = write(&self.sessions);
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| {
                let session = lock(entry);
                session.status.is_terminal() && session.state_changed_at < cutoff
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "purged terminal upload sessions");
        }
        expired
    }
}
