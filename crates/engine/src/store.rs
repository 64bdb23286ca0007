use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use md5::{Digest, Md5};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::StoreConfig;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// A part's bytes written to a staging file, not yet installed under its part
/// number. Staging keeps a failed re-upload from clobbering the part it was
/// meant to replace.
#[derive(Debug)]
pub struct StagedPart {
    staging_path: PathBuf,
    pub size: u64,
    pub etag: String,
    pub crc32c: u32,
}

/// An object opened for reading.
pub struct ObjectRead {
    pub stream: ByteStream,
    pub content_length: u64,
    pub total_size: u64,
}

/// Filesystem layout: finished objects under `data_dir/bucket/key`, upload
/// scratch under `scratch_dir` — one append-only spool file per stream
/// session, one directory of numbered part files per multipart session.
/// Objects always appear via rename, never in a half-written state.
#[derive(Debug, Clone)]
pub struct LocalStore {
    config: StoreConfig,
}

impl LocalStore {
    pub fn new(config: StoreConfig) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.scratch_dir)?;
        Ok(Self { config })
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.config.data_dir.join(bucket).join(key)
    }

    fn spool_path(&self, upload_id: &str) -> PathBuf {
        self.config.scratch_dir.join(format!("{upload_id}.spool"))
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.config.scratch_dir.join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: i32) -> PathBuf {
        self.upload_dir(upload_id).join(format!("part_{part_number:05}"))
    }

    fn staging_path(&self, upload_id: &str) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!("staging_{}", Uuid::new_v4()))
    }

    // Stream spools

    pub async fn create_spool(&self, upload_id: &str) -> io::Result<()> {
        fs::File::create(self.spool_path(upload_id)).await?;
        Ok(())
    }

    pub async fn append_spool(&self, upload_id: &str, data: &[u8]) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.spool_path(upload_id))
            .await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }

    pub async fn spool_len(&self, upload_id: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.spool_path(upload_id)).await?.len())
    }

    pub async fn read_spool(&self, upload_id: &str) -> io::Result<ByteStream> {
        let file = fs::File::open(self.spool_path(upload_id)).await?;
        Ok(Box::pin(ReaderStream::new(tokio::io::BufReader::new(file))))
    }

    /// Moves a finished spool into place as the object.
    pub async fn promote_spool(&self, upload_id: &str, bucket: &str, key: &str) -> io::Result<()> {
        let object_path = self.object_path(bucket, key);
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.spool_path(upload_id), &object_path).await?;
        Ok(())
    }

    pub async fn remove_spool(&self, upload_id: &str) -> io::Result<()> {
        match fs::remove_file(self.spool_path(upload_id)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    // Multipart scratch

    pub async fn create_upload_dir(&self, upload_id: &str) -> io::Result<()> {
        fs::create_dir_all(self.upload_dir(upload_id)).await?;
        Ok(())
    }

    /// Writes incoming part bytes to a staging file, hashing as they land.
    pub async fn stage_part(&self, upload_id: &str, mut data: ByteStream) -> io::Result<StagedPart> {
        let staging_path = self.staging_path(upload_id);
        let mut file = fs::File::create(&staging_path).await?;

        let mut hasher = Md5::new();
        let mut crc = 0u32;
        let mut size = 0u64;
        while let Some(chunk) = data.try_next().await? {
            hasher.update(&chunk);
            crc = driftbay_checksum::crc32c_extend(crc, &chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        Ok(StagedPart {
            staging_path,
            size,
            etag: format!("{:x}", hasher.finalize()),
            crc32c: crc,
        })
    }

    /// Installs a staged part under its part number, replacing any prior bytes
    /// for that number.
    pub async fn install_part(
        &self,
        upload_id: &str,
        part_number: i32,
        staged: StagedPart,
    ) -> io::Result<()> {
        fs::rename(&staged.staging_path, self.part_path(upload_id, part_number)).await
    }

    pub async fn discard_staged(&self, staged: StagedPart) -> io::Result<()> {
        match fs::remove_file(&staged.staging_path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub async fn remove_part(&self, upload_id: &str, part_number: i32) -> io::Result<()> {
        match fs::remove_file(self.part_path(upload_id, part_number)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Concatenates the given parts, in the order given, into the final
    /// object. Returns the object's size and whole-object CRC32C.
    pub async fn assemble_object(
        &self,
        upload_id: &str,
        part_numbers: &[i32],
        bucket: &str,
        key: &str,
    ) -> io::Result<(u64, u32)> {
        let object_path = self.object_path(bucket, key);
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let assembly_path = self
            .upload_dir(upload_id)
            .join(format!("assembly_{}", Uuid::new_v4()));
        let mut out = fs::File::create(&assembly_path).await?;
        let mut crc = 0u32;
        let mut size = 0u64;
        for &part_number in part_numbers {
            let part = fs::read(self.part_path(upload_id, part_number)).await?;
            crc = driftbay_checksum::crc32c_extend(crc, &part);
            size += part.len() as u64;
            out.write_all(&part).await?;
        }
        out.sync_all().await?;
        drop(out);

        fs::rename(&assembly_path, &object_path).await?;
        Ok((size, crc))
    }

    pub async fn remove_upload_dir(&self, upload_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.upload_dir(upload_id)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    // Finished objects

    pub async fn read_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<(u64, Option<u64>)>,
    ) -> io::Result<Option<ObjectRead>> {
        let object_path = self.object_path(bucket, key);
        let total_size = match fs::metadata(&object_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut file = fs::File::open(&object_path).await?;
        let (start, content_length) = match range {
            None => (0, total_size),
            Some((start, end)) => {
                if total_size == 0 || start >= total_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("range start {start} beyond object size {total_size}"),
                    ));
                }
                let end = end.unwrap_or(total_size - 1).min(total_size - 1);
                if start > end {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid range {start}-{end}"),
                    ));
                }
                (start, end - start + 1)
            }
        };

        file.seek(SeekFrom::Start(start)).await?;
        let reader = tokio::io::BufReader::new(file).take(content_length);
        Ok(Some(ObjectRead {
            stream: Box::pin(ReaderStream::new(reader)),
            content_length,
            total_size,
        }))
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> io::Result<bool> {
        match fs::remove_file(self.object_path(bucket, key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Upload ids that still have scratch state on disk.
    pub async fn scratch_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.config.scratch_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match name.strip_suffix(".spool") {
                Some(id) => ids.push(id.to_string()),
                None => ids.push(name.to_string()),
            }
        }
        Ok(ids)
    }

    /// Removes all scratch state for an upload, whichever pipeline owned it.
    pub async fn remove_scratch(&self, upload_id: &str) -> io::Result<()> {
        self.remove_spool(upload_id).await?;
        self.remove_upload_dir(upload_id).await
    }
}
