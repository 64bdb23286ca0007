use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use md5::{Digest, Md5};

use driftbay_checksum as checksum;
use driftbay_session::{
    FinalizedObject, ObjectChecksums, Result, SessionRegistry, UploadError, UploadKind,
    UploadSession, UploadStatus, WriteStatus,
};

use crate::store::LocalStore;

/// One unit of a chunked stream write.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Must equal the session's persisted size when the chunk arrives.
    pub write_offset: u64,
    pub content: Bytes,
    /// Expected CRC32C of `content`; absent means unchecked.
    pub crc32c: Option<u32>,
    /// Marks the last chunk of the object. Nothing may follow it.
    pub finish_write: bool,
}

/// Advisory routing state returned by a transport redirect. Echoed on the
/// next attempt against the same upload; never affects offsets or checksums.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingState {
    pub write_handle: Option<String>,
    pub routing_token: Option<String>,
}

/// Rolling per-stream state. Lives only in memory; `resume` rebuilds it from
/// the spool after a process restart.
struct StreamState {
    rolling_crc32c: u32,
    md5: Md5,
    declared: Option<ObjectChecksums>,
    finished: bool,
}

impl StreamState {
    fn fresh() -> Self {
        Self {
            rolling_crc32c: 0,
            md5: Md5::new(),
            declared: None,
            finished: false,
        }
    }
}

struct StreamSlot {
    state: Arc<tokio::sync::Mutex<StreamState>>,
    routing: Option<RoutingState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The chunked stream pipeline: validates offsets and checksums before any
/// byte is persisted, keeps the registry's persisted size as the single
/// source of truth for resumption, and promotes the spool to an object on a
/// clean finishing chunk.
pub struct ResumableWriter {
    registry: Arc<SessionRegistry>,
    store: LocalStore,
    streams: Mutex<HashMap<String, StreamSlot>>,
}

impl ResumableWriter {
    pub fn new(registry: Arc<SessionRegistry>, store: LocalStore) -> Self {
        Self {
            registry,
            store,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a new stream upload with a server-issued id.
    pub async fn open(&self, bucket: &str, key: &str) -> Result<UploadSession> {
        let session = self.registry.create(bucket, key, UploadKind::Stream);
        self.store.create_spool(&session.upload_id).await?;
        self.install_slot(&session.upload_id, StreamState::fresh());
        Ok(session)
    }

    /// Starts a new stream upload under a caller-chosen resumable token.
    pub async fn open_with_token(
        &self,
        token: &str,
        bucket: &str,
        key: &str,
    ) -> Result<UploadSession> {
        let session = self
            .registry
            .create_with_id(token, bucket, key, UploadKind::Stream)?;
        self.store.create_spool(&session.upload_id).await?;
        self.install_slot(&session.upload_id, StreamState::fresh());
        Ok(session)
    }

    /// Re-attaches to an open stream, rebuilding rolling checksum state from
    /// the spool when this process has none. The caller's next chunk must
    /// start at the returned `persisted_size`.
    pub async fn resume(&self, upload_id: &str) -> Result<UploadSession> {
        let session = self.stream_session(upload_id)?;
        if session.status != UploadStatus::Open {
            return Err(UploadError::failed_precondition(
                upload_id,
                session.status,
                "cannot resume",
            ));
        }
        if lock(&self.streams).contains_key(upload_id) {
            return Ok(session);
        }

        let spool_len = self.store.spool_len(upload_id).await?;
        if spool_len != session.persisted_size {
            return Err(UploadError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "spool for {upload_id} holds {spool_len} bytes, session persisted {}",
                    session.persisted_size
                ),
            )));
        }

        let mut state = StreamState::fresh();
        let mut spool = self.store.read_spool(upload_id).await?;
        while let Some(buf) = spool.try_next().await? {
            state.rolling_crc32c = checksum::crc32c_extend(state.rolling_crc32c, &buf);
            state.md5.update(&buf);
        }
        tracing::debug!(upload_id, persisted = spool_len, "rebuilt stream state");

        // A racing resume may have installed a slot meanwhile; theirs is
        // equivalent, keep it.
        lock(&self.streams).entry(upload_id.to_string()).or_insert(StreamSlot {
            state: Arc::new(tokio::sync::Mutex::new(state)),
            routing: None,
        });
        Ok(session)
    }

    /// Accepts one chunk. Chunks are strictly ordered by offset; anything out
    /// of order is rejected without touching session state. Declared
    /// whole-object checksums (allowed on any chunk, last declaration wins)
    /// gate the finishing chunk: on mismatch nothing is persisted and the
    /// session stays open for a corrected retry.
    pub async fn write(
        &self,
        upload_id: &str,
        chunk: Chunk,
        declared: Option<ObjectChecksums>,
    ) -> Result<WriteStatus> {
        let session = self.stream_session(upload_id)?;
        match session.status {
            UploadStatus::Open => {}
            UploadStatus::Complete => {
                return Err(UploadError::invalid_argument(
                    upload_id,
                    "stream already finished; no chunk may follow finish_write",
                ));
            }
            status => {
                return Err(UploadError::failed_precondition(
                    upload_id,
                    status,
                    "cannot accept chunks",
                ));
            }
        }

        let state_arc = {
            let streams = lock(&self.streams);
            match streams.get(upload_id) {
                Some(slot) => Arc::clone(&slot.state),
                None => {
                    return Err(UploadError::invalid_argument(
                        upload_id,
                        "no stream state in this process; resume the upload first",
                    ));
                }
            }
        };
        let mut state = state_arc.lock().await;

        if state.finished {
            return Err(UploadError::invalid_argument(
                upload_id,
                "no chunk may follow finish_write",
            ));
        }

        // Fresh snapshot under the stream lock; the pre-lock one may be stale.
        let session = self.registry.get(upload_id)?;
        if chunk.write_offset != session.persisted_size {
            return Err(UploadError::invalid_argument(
                upload_id,
                format!(
                    "offset mismatch: expected {}, got {}",
                    session.persisted_size, chunk.write_offset
                ),
            ));
        }

        if let Some(decl) = declared {
            if !decl.is_empty() {
                state.declared = Some(decl);
            }
        }

        let content_crc = checksum::crc32c(&chunk.content);
        checksum::verify_crc32c(chunk.crc32c, content_crc)?;

        let next_crc = checksum::crc32c_extend(state.rolling_crc32c, &chunk.content);
        let mut next_md5 = state.md5.clone();
        next_md5.update(&chunk.content);

        if chunk.finish_write {
            if let Some(decl) = &state.declared {
                checksum::verify_crc32c(decl.crc32c, next_crc)?;
                let digest: [u8; 16] = next_md5.clone().finalize().into();
                checksum::verify_md5(decl.md5_hash.as_deref(), &digest)?;
            }
        }

        // Every check passed; the chunk is now durable.
        self.store.append_spool(upload_id, &chunk.content).await?;
        state.rolling_crc32c = next_crc;
        state.md5 = next_md5;
        let new_size = self
            .registry
            .advance(upload_id, session.persisted_size + chunk.content.len() as u64)?;

        if !chunk.finish_write {
            return Ok(WriteStatus::Persisted { size: new_size });
        }

        state.finished = true;
        self.registry.begin_finalize(upload_id, None)?;
        self.store
            .promote_spool(upload_id, &session.bucket, &session.key)
            .await?;
        let resource = FinalizedObject {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            size: new_size,
            etag: format!("{:x}", state.md5.clone().finalize()),
            crc32c: Some(state.rolling_crc32c),
            finished_at: Utc::now(),
        };
        self.registry.commit_finalize(upload_id, resource.clone())?;
        drop(state);
        lock(&self.streams).remove(upload_id);
        tracing::info!(upload_id, size = new_size, "stream upload finished");
        Ok(WriteStatus::Resource(resource))
    }

    /// Where the upload stands: bytes durably accepted, or the finished
    /// object. This is what a caller consults to resume after a disconnect.
    pub fn query_status(&self, upload_id: &str) -> Result<WriteStatus> {
        let session = self.stream_session(upload_id)?;
        match session.status {
            UploadStatus::Open | UploadStatus::Finalizing => Ok(WriteStatus::Persisted {
                size: session.persisted_size,
            }),
            UploadStatus::Complete => Ok(session
                .resource
                .map(WriteStatus::Resource)
                .unwrap_or(WriteStatus::Persisted {
                    size: session.persisted_size,
                })),
            status => Err(UploadError::failed_precondition(
                upload_id,
                status,
                "no status for an aborted upload",
            )),
        }
    }

    /// Captures routing state from a transport redirect for echo on retry.
    pub fn note_redirect(
        &self,
        upload_id: &str,
        write_handle: Option<String>,
        routing_token: Option<String>,
    ) -> Result<()> {
        self.stream_session(upload_id)?;
        let mut streams = lock(&self.streams);
        match streams.get_mut(upload_id) {
            Some(slot) => {
                slot.routing = Some(RoutingState {
                    write_handle,
                    routing_token,
                });
                Ok(())
            }
            None => Err(UploadError::invalid_argument(
                upload_id,
                "no stream state in this process; resume the upload first",
            )),
        }
    }

    pub fn routing(&self, upload_id: &str) -> Result<Option<RoutingState>> {
        self.stream_session(upload_id)?;
        Ok(lock(&self.streams)
            .get(upload_id)
            .and_then(|slot| slot.routing.clone()))
    }

    /// Aborts the stream and releases its spool.
    pub async fn abort(&self, upload_id: &str) -> Result<UploadSession> {
        let session = self.stream_session(upload_id)?;
        let session = self.registry.abort(&session.upload_id)?;
        lock(&self.streams).remove(upload_id);
        self.store.remove_spool(upload_id).await?;
        Ok(session)
    }

    fn stream_session(&self, upload_id: &str) -> Result<UploadSession> {
        let session = self.registry.get(upload_id)?;
        if session.kind != UploadKind::Stream {
            return Err(UploadError::invalid_argument(
                upload_id,
                "not a stream upload",
            ));
        }
        Ok(session)
    }

    fn install_slot(&self, upload_id: &str, state: StreamState) {
        lock(&self.streams).insert(
            upload_id.to_string(),
            StreamSlot {
                state: Arc::new(tokio::sync::Mutex::new(state)),
                routing: None,
            },
        );
    }
}
