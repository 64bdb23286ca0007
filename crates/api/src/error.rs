use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use driftbay_session::UploadError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Bucket already exists: {0}")]
    BucketAlreadyExists(String),

    #[error("Invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            ApiError::BucketNotFound(_) => (StatusCode::NOT_FOUND, "NoSuchBucket", self.to_string()),
            ApiError::ObjectNotFound(_) => (StatusCode::NOT_FOUND, "NoSuchKey", self.to_string()),
            ApiError::BucketAlreadyExists(_) => {
                (StatusCode::CONFLICT, "BucketAlreadyExists", self.to_string())
            }
            ApiError::InvalidBucketName(_) => {
                (StatusCode::BAD_REQUEST, "InvalidBucketName", self.to_string())
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest", self.to_string()),
            ApiError::Upload(upload) => {
                let (status, code) = match upload {
                    UploadError::InvalidArgument { .. } => {
                        (StatusCode::BAD_REQUEST, "InvalidArgument")
                    }
                    UploadError::Checksum(_) => (StatusCode::BAD_REQUEST, "BadDigest"),
                    UploadError::NotFound { .. } => (StatusCode::NOT_FOUND, "NoSuchUpload"),
                    UploadError::AlreadyExists { .. } => {
                        (StatusCode::CONFLICT, "UploadAlreadyExists")
                    }
                    UploadError::FailedPrecondition { .. } => {
                        (StatusCode::CONFLICT, "InvalidUploadState")
                    }
                    UploadError::Parse(_) => (StatusCode::BAD_REQUEST, "MalformedXML"),
                    UploadError::Io(_) => {
                        tracing::error!("Storage error: {}", upload);
                        (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
                    }
                };
                (status, code, upload.to_string())
            }
            ApiError::Internal(_) | ApiError::Database(_) => {
                tracing::error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "Code": error_code,
            "Message": message,
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
