use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;

use driftbay_catalog::{BucketRepository, CreateBucketRequest, ObjectRepository, PutObjectRecord};
use driftbay_engine::{Chunk, ListUploadsParams};
use driftbay_session::{FinalizedObject, WriteStatus};

use crate::{
    AppState, assembler,
    error::{ApiError, ApiResult},
    extractors::{self, BucketQuery, KeyQuery},
    responses::*,
    storage_class::StorageClass,
};

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";
const DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";

fn xml_response<T: Serialize>(value: &T) -> ApiResult<Response> {
    let body = quick_xml::se::to_string(value).map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/xml")
        .body(Body::from(format!("{XML_DECLARATION}{body}")))
        .unwrap())
}

fn single_chunk_stream(body: Bytes) -> driftbay_engine::ByteStream {
    Box::pin(futures::stream::once(async move {
        Ok::<Bytes, std::io::Error>(body)
    }))
}

// Buckets

pub async fn list_buckets(State(state): State<AppState>) -> ApiResult<Json<ListBucketsResponse>> {
    let repo = BucketRepository::new(state.catalog.pool().clone());
    let buckets = repo.list().await?;

    let bucket_infos: Vec<BucketInfo> = buckets
        .into_iter()
        .map(|bucket| BucketInfo {
            name: bucket.name,
            creation_date: bucket.created_at,
        })
        .collect();

    Ok(Json(ListBucketsResponse {
        owner: Owner::service(),
        buckets: Buckets {
            bucket: bucket_infos,
        },
    }))
}

pub async fn create_bucket(
    Path(bucket_name): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    validate_bucket_name(&bucket_name)?;

    let repo = BucketRepository::new(state.catalog.pool().clone());
    if repo.find_by_name(&bucket_name).await?.is_some() {
        return Err(ApiError::BucketAlreadyExists(bucket_name));
    }

    repo.create(CreateBucketRequest {
        name: bucket_name.clone(),
        region: "us-east-1".to_string(),
    })
    .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Location", format!("/{}", bucket_name))
        .body(Body::empty())
        .unwrap())
}

pub async fn delete_bucket(
    Path(bucket_name): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let repo = BucketRepository::new(state.catalog.pool().clone());
    if !repo.delete(&bucket_name).await? {
        return Err(ApiError::BucketNotFound(bucket_name));
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /{bucket}` — object listing, or with `?uploads` the in-progress
/// multipart uploads.
pub async fn get_bucket(
    Path(bucket_name): Path<String>,
    Query(query): Query<BucketQuery>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let bucket_repo = BucketRepository::new(state.catalog.pool().clone());
    let bucket = bucket_repo
        .find_by_name(&bucket_name)
        .await?
        .ok_or_else(|| ApiError::BucketNotFound(bucket_name.clone()))?;

    if query.uploads.is_some() {
        return list_multipart_uploads(&state, &bucket_name, &query);
    }

    let object_repo = ObjectRepository::new(state.catalog.pool().clone());
    let objects = object_repo
        .list_by_bucket(bucket.id, query.prefix.as_deref(), query.max_keys)
        .await?;

    let contents: Vec<ObjectInfo> = objects
        .into_iter()
        .map(|obj| ObjectInfo {
            key: obj.key,
            last_modified: obj.updated_at,
            etag: obj.etag,
            size: obj.size as u64,
            storage_class: StorageClass::Standard.to_string(),
            owner: Owner::service(),
        })
        .collect();

    let response = ListObjectsResponse {
        name: bucket_name,
        prefix: query.prefix,
        key_count: contents.len() as u32,
        max_keys: query.max_keys.unwrap_or(1000) as u32,
        is_truncated: false,
        contents,
    };
    Ok(Json(response).into_response())
}

fn list_multipart_uploads(
    state: &AppState,
    bucket_name: &str,
    query: &BucketQuery,
) -> ApiResult<Response> {
    let params = ListUploadsParams {
        prefix: query.prefix.clone(),
        delimiter: query.delimiter.clone(),
        key_marker: query.key_marker.clone(),
        upload_id_marker: query.upload_id_marker.clone(),
        max_uploads: query.max_uploads,
    };
    let listing = state.multipart.list_uploads(bucket_name, &params);

    let response = ListMultipartUploadsResult {
        bucket: bucket_name.to_string(),
        key_marker: query.key_marker.clone(),
        upload_id_marker: query.upload_id_marker.clone(),
        next_key_marker: listing.next_key_marker,
        next_upload_id_marker: listing.next_upload_id_marker,
        delimiter: query.delimiter.clone(),
        prefix: query.prefix.clone(),
        encoding_type: query.encoding_type.clone(),
        max_uploads: query.max_uploads.unwrap_or(1000).clamp(1, 1000),
        is_truncated: listing.is_truncated,
        uploads: listing
            .uploads
            .into_iter()
            .map(|session| UploadEntry {
                key: session.key,
                upload_id: session.upload_id,
                storage_class: StorageClass::Standard.to_string(),
                initiated: session.created_at,
            })
            .collect(),
        common_prefixes: listing
            .common_prefixes
            .into_iter()
            .map(|prefix| CommonPrefix { prefix })
            .collect(),
    };
    xml_response(&response)
}

// Objects and parts

/// `PUT /{bucket}/{key}` — an object, or with `partNumber` and `uploadId`
/// one part of a multipart upload.
pub async fn put_object_or_part(
    Path((bucket_name, key)): Path<(String, String)>,
    Query(query): Query<KeyQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if let Some(upload_id) = &query.upload_id {
        let part_number = query
            .part_number
            .ok_or_else(|| ApiError::BadRequest("partNumber is required".to_string()))?;
        let expected_crc32c = extractors::parse_expected_part_crc32c(&headers)?;

        let record = state
            .multipart
            .upload_part(upload_id, part_number, single_chunk_stream(body), expected_crc32c)
            .await?;

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header("ETag", format!("\"{}\"", record.etag));
        if let Some(crc) = record.crc32c {
            response = response.header(
                extractors::OBJECT_HASH_HEADER,
                format!("crc32c={}", driftbay_checksum::encode_crc32c(crc)),
            );
        }
        return Ok(response.body(Body::empty()).unwrap());
    }

    put_object(state, bucket_name, key, headers, body).await
}

async fn put_object(
    state: AppState,
    bucket_name: String,
    key: String,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let bucket_repo = BucketRepository::new(state.catalog.pool().clone());
    let bucket = bucket_repo
        .find_by_name(&bucket_name)
        .await?
        .ok_or_else(|| ApiError::BucketNotFound(bucket_name.clone()))?;

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let declared = extractors::parse_object_checksums(&headers)?;

    // A single-shot put is one finishing chunk through the stream pipeline.
    let session = state.writer.open(&bucket_name, &key).await?;
    let upload_id = session.upload_id;
    let chunk = Chunk {
        write_offset: 0,
        content: body,
        crc32c: None,
        finish_write: true,
    };
    let resource = match state.writer.write(&upload_id, chunk, declared).await {
        Ok(WriteStatus::Resource(resource)) => resource,
        Ok(WriteStatus::Persisted { .. }) => {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "finishing chunk did not finalize"
            )));
        }
        Err(e) => {
            // The one-chunk session has no future; don't leave it dangling.
            let _ = state.writer.abort(&upload_id).await;
            return Err(e.into());
        }
    };

    let object_repo = ObjectRepository::new(state.catalog.pool().clone());
    object_repo
        .upsert(PutObjectRecord {
            bucket_id: bucket.id,
            key,
            etag: resource.etag.clone(),
            size: resource.size as i64,
            crc32c: resource.crc32c,
            content_type,
        })
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("ETag", format!("\"{}\"", resource.etag))
        .body(Body::empty())
        .unwrap())
}

/// `POST /{bucket}/{key}` — `?uploads` initiates a multipart upload,
/// `?resumable` opens a stream upload, `?uploadId=` completes a multipart
/// upload with the XML part manifest in the body.
pub async fn post_object(
    Path((bucket_name, key)): Path<(String, String)>,
    Query(query): Query<KeyQuery>,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Response> {
    if query.uploads.is_some() {
        return initiate_multipart(state, bucket_name, key).await;
    }
    if query.resumable.is_some() {
        return open_resumable(state, bucket_name, key, query.token).await;
    }
    if let Some(upload_id) = query.upload_id {
        return complete_multipart(state, upload_id, body).await;
    }
    Err(ApiError::BadRequest(
        "expected uploads, resumable, or uploadId".to_string(),
    ))
}

async fn initiate_multipart(state: AppState, bucket_name: String, key: String) -> ApiResult<Response> {
    let bucket_repo = BucketRepository::new(state.catalog.pool().clone());
    bucket_repo
        .find_by_name(&bucket_name)
        .await?
        .ok_or_else(|| ApiError::BucketNotFound(bucket_name.clone()))?;

    let session = state.multipart.create(&bucket_name, &key).await?;
    xml_response(&InitiateMultipartUploadResult {
        bucket: bucket_name,
        key,
        upload_id: session.upload_id,
    })
}

async fn open_resumable(
    state: AppState,
    bucket_name: String,
    key: String,
    token: Option<String>,
) -> ApiResult<Response> {
    let bucket_repo = BucketRepository::new(state.catalog.pool().clone());
    bucket_repo
        .find_by_name(&bucket_name)
        .await?
        .ok_or_else(|| ApiError::BucketNotFound(bucket_name.clone()))?;

    let session = match token {
        Some(token) => state.writer.open_with_token(&token, &bucket_name, &key).await?,
        None => state.writer.open(&bucket_name, &key).await?,
    };
    Ok(Json(json!({ "uploadId": session.upload_id })).into_response())
}

async fn complete_multipart(state: AppState, upload_id: String, body: Bytes) -> ApiResult<Response> {
    let xml = std::str::from_utf8(&body)
        .map_err(|_| ApiError::BadRequest("complete request body is not UTF-8".to_string()))?;
    let completed = assembler::parse_complete_request(xml)?;

    let result = state.multipart.complete(&upload_id, &completed).await?;
    record_finalized(&state, state.registry.get(&upload_id)?.resource.as_ref()).await?;

    xml_response(&CompleteMultipartUploadResult {
        location: result.location,
        bucket: result.bucket,
        key: result.key,
        etag: result.etag,
    })
}

/// Writes the durable catalog record for a finished upload.
async fn record_finalized(state: &AppState, resource: Option<&FinalizedObject>) -> ApiResult<()> {
    let Some(resource) = resource else {
        return Ok(());
    };
    let bucket_repo = BucketRepository::new(state.catalog.pool().clone());
    let Some(bucket) = bucket_repo.find_by_name(&resource.bucket).await? else {
        // The bucket went away mid-upload; the object bytes will be swept.
        tracing::warn!(bucket = %resource.bucket, key = %resource.key, "finished upload has no bucket");
        return Ok(());
    };
    ObjectRepository::new(state.catalog.pool().clone())
        .upsert(PutObjectRecord {
            bucket_id: bucket.id,
            key: resource.key.clone(),
            etag: resource.etag.clone(),
            size: resource.size as i64,
            crc32c: resource.crc32c,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        })
        .await?;
    Ok(())
}

/// `GET /{bucket}/{key}` — the object's bytes, or with `?uploadId=` the
/// upload's part listing.
pub async fn get_object_or_parts(
    Path((bucket_name, key)): Path<(String, String)>,
    Query(query): Query<KeyQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if let Some(upload_id) = &query.upload_id {
        return list_parts(&state, upload_id, &query);
    }

    let bucket_repo = BucketRepository::new(state.catalog.pool().clone());
    let bucket = bucket_repo
        .find_by_name(&bucket_name)
        .await?
        .ok_or_else(|| ApiError::BucketNotFound(bucket_name.clone()))?;

    let object_repo = ObjectRepository::new(state.catalog.pool().clone());
    let object = object_repo
        .find_by_bucket_and_key(bucket.id, &key)
        .await?
        .ok_or_else(|| ApiError::ObjectNotFound(key.clone()))?;

    let range = headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let read = state
        .store
        .read_object(&bucket_name, &key, range)
        .await
        .map_err(|e| ApiError::Upload(e.into()))?
        .ok_or_else(|| ApiError::ObjectNotFound(key))?;

    let mut response = Response::builder()
        .status(if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header("Content-Type", object.content_type)
        .header("Content-Length", read.content_length.to_string())
        .header("ETag", format!("\"{}\"", object.etag))
        .header(
            "Last-Modified",
            object.updated_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
    if let Some((start, _)) = range {
        let end = start + read.content_length - 1;
        response = response.header(
            "Content-Range",
            format!("bytes {start}-{end}/{}", read.total_size),
        );
    }
    if let Some(crc) = object.crc32c {
        response = response.header(
            extractors::OBJECT_HASH_HEADER,
            format!("crc32c={}", driftbay_checksum::encode_crc32c(crc)),
        );
    }

    Ok(response.body(Body::from_stream(read.stream)).unwrap())
}

fn list_parts(state: &AppState, upload_id: &str, query: &KeyQuery) -> ApiResult<Response> {
    let session = state.registry.get(upload_id)?;
    let listing = state
        .multipart
        .list_parts(upload_id, query.max_parts, query.part_number_marker)?;

    xml_response(&ListPartsResult {
        bucket: session.bucket,
        key: session.key,
        upload_id: upload_id.to_string(),
        part_number_marker: listing.part_number_marker,
        next_part_number_marker: listing.next_part_number_marker,
        max_parts: listing.max_parts,
        is_truncated: listing.is_truncated,
        owner: Owner::service(),
        storage_class: StorageClass::Standard.to_string(),
        parts: listing
            .parts
            .into_iter()
            .map(|part| ListedPart {
                part_number: part.part_number,
                etag: part.etag,
                size: part.size,
                last_modified: part.last_modified,
            })
            .collect(),
    })
}

pub async fn head_object(
    Path((bucket_name, key)): Path<(String, String)>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let bucket_repo = BucketRepository::new(state.catalog.pool().clone());
    let bucket = bucket_repo
        .find_by_name(&bucket_name)
        .await?
        .ok_or_else(|| ApiError::BucketNotFound(bucket_name.clone()))?;

    let object_repo = ObjectRepository::new(state.catalog.pool().clone());
    let object = object_repo
        .find_by_bucket_and_key(bucket.id, &key)
        .await?
        .ok_or_else(|| ApiError::ObjectNotFound(key))?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", object.content_type)
        .header("Content-Length", object.size.to_string())
        .header("ETag", format!("\"{}\"", object.etag))
        .header(
            "Last-Modified",
            object.updated_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        )
        .body(Body::empty())
        .unwrap())
}

/// `DELETE /{bucket}/{key}` — the object, or with `?uploadId=` an abort of
/// that multipart upload.
pub async fn delete_object_or_abort(
    Path((bucket_name, key)): Path<(String, String)>,
    Query(query): Query<KeyQuery>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    if let Some(upload_id) = &query.upload_id {
        state.multipart.abort(upload_id).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let bucket_repo = BucketRepository::new(state.catalog.pool().clone());
    let bucket = bucket_repo
        .find_by_name(&bucket_name)
        .await?
        .ok_or_else(|| ApiError::BucketNotFound(bucket_name.clone()))?;

    let object_repo = ObjectRepository::new(state.catalog.pool().clone());
    object_repo.delete(bucket.id, &key).await?;
    state
        .store
        .delete_object(&bucket_name, &key)
        .await
        .map_err(|e| ApiError::Upload(e.into()))?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

// Resumable stream surface

/// `PUT /resumable/{upload_id}` — one chunk, offset and commands in headers.
pub async fn write_resumable_chunk(
    Path(upload_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let request = extractors::parse_chunk_request(&headers)?;
    if request.write_handle.is_some() || request.routing_token.is_some() {
        state
            .writer
            .note_redirect(&upload_id, request.write_handle.clone(), request.routing_token.clone())?;
    }

    let chunk = Chunk {
        write_offset: request.offset,
        content: body,
        crc32c: request.chunk_crc32c,
        finish_write: request.finalize,
    };
    let status = state.writer.write(&upload_id, chunk, request.declared).await?;

    let mut response = match &status {
        WriteStatus::Persisted { size } => Json(json!({ "persistedSize": size })).into_response(),
        WriteStatus::Resource(resource) => {
            record_finalized(&state, Some(resource)).await?;
            Json(json!({ "resource": resource })).into_response()
        }
    };
    if !matches!(status, WriteStatus::Resource(_)) {
        if let Some(routing) = state.writer.routing(&upload_id)? {
            if let Some(token) = routing.routing_token {
                if let Ok(value) = token.parse() {
                    response
                        .headers_mut()
                        .insert(extractors::ROUTING_TOKEN_HEADER, value);
                }
            }
        }
    }
    Ok(response)
}

/// `GET /resumable/{upload_id}` — persisted size while the upload is open,
/// the finished resource afterwards. Exactly one of the two.
pub async fn query_resumable_status(
    Path(upload_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let status = state.writer.query_status(&upload_id)?;
    let body = match status {
        WriteStatus::Persisted { size } => json!({ "persistedSize": size }),
        WriteStatus::Resource(resource) => json!({ "resource": resource }),
    };
    Ok(Json(body).into_response())
}

pub async fn abort_resumable(
    Path(upload_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    state.writer.abort(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn validate_bucket_name(name: &str) -> ApiResult<()> {
    if name.len() < 3 || name.len() > 63 {
        return Err(ApiError::InvalidBucketName(
            "Bucket name must be between 3 and 63 characters long".to_string(),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ApiError::InvalidBucketName(
            "Bucket name can only contain lowercase letters, numbers, and hyphens".to_string(),
        ));
    }

    Ok(())
}

fn parse_range_header(range: &str) -> Option<(u64, Option<u64>)> {
    let range = range.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;

    let start = start.parse::<u64>().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };

    Some((start, end))
}
