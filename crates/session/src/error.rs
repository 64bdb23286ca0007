use thiserror::Error;

use crate::types::UploadStatus;

pub use driftbay_checksum::ChecksumMismatch;

/// The failure taxonomy shared by both upload pipelines. Every variant carries
/// the identifiers a caller needs to branch on without string matching.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid argument for upload {upload_id}: {message}")]
    InvalidArgument { upload_id: String, message: String },

    #[error("upload {upload_id} is {status}: {message}")]
    FailedPrecondition {
        upload_id: String,
        status: UploadStatus,
        message: String,
    },

    #[error("no such upload: {upload_id}")]
    NotFound { upload_id: String },

    #[error("upload already exists: {upload_id}")]
    AlreadyExists { upload_id: String },

    /// Distinct from `InvalidArgument`: retrying the same bytes is pointless,
    /// the data must be resent.
    #[error(transparent)]
    Checksum(#[from] ChecksumMismatch),

    #[error("malformed response: {0}")]
    Parse(String),

    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn invalid_argument(upload_id: impl Into<String>, message: impl Into<String>) -> Self {
        UploadError::InvalidArgument {
            upload_id: upload_id.into(),
            message: message.into(),
        }
    }

    pub fn failed_precondition(
        upload_id: impl Into<String>,
        status: UploadStatus,
        message: impl Into<String>,
    ) -> Self {
        UploadError::FailedPrecondition {
            upload_id: upload_id.into(),
            status,
            message: message.into(),
        }
    }

    pub fn not_found(upload_id: impl Into<String>) -> Self {
        UploadError::NotFound {
            upload_id: upload_id.into(),
        }
    }

    /// Whether retrying the identical call can succeed. Checksum failures need
    /// different bytes, state errors need a different session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;
