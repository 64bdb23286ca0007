use axum::http::HeaderMap;
use serde::Deserialize;

use driftbay_checksum::{decode_crc32c, decode_md5};
use driftbay_session::ObjectChecksums;

use crate::assembler::parse_hash_manifest;
use crate::error::{ApiError, ApiResult};

pub const UPLOAD_OFFSET_HEADER: &str = "x-goog-upload-offset";
pub const UPLOAD_COMMAND_HEADER: &str = "x-goog-upload-command";
pub const CHUNK_HASH_HEADER: &str = "x-goog-chunk-hash";
pub const OBJECT_HASH_HEADER: &str = "x-goog-hash";
pub const ROUTING_TOKEN_HEADER: &str = "x-goog-routing-token";
pub const WRITE_HANDLE_HEADER: &str = "x-goog-write-handle";

/// Query surface of `GET /{bucket}`: object listing, or with `?uploads` the
/// in-progress multipart uploads.
#[derive(Debug, Deserialize)]
pub struct BucketQuery {
    pub uploads: Option<String>,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "encoding-type")]
    pub encoding_type: Option<String>,
    #[serde(rename = "key-marker")]
    pub key_marker: Option<String>,
    #[serde(rename = "upload-id-marker")]
    pub upload_id_marker: Option<String>,
    #[serde(rename = "max-uploads")]
    pub max_uploads: Option<i32>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<i32>,
}

/// Query surface of `/{bucket}/{key...}`: which operation a PUT/POST/GET/
/// DELETE means is carried by these parameters.
#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub uploads: Option<String>,
    pub resumable: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<i32>,
    #[serde(rename = "max-parts")]
    pub max_parts: Option<i32>,
    #[serde(rename = "part-number-marker")]
    pub part_number_marker: Option<i32>,
}

/// Everything a resumable chunk PUT says in its headers.
#[derive(Debug, Clone, Default)]
pub struct ChunkRequest {
    pub offset: u64,
    pub finalize: bool,
    pub chunk_crc32c: Option<u32>,
    pub declared: Option<ObjectChecksums>,
    pub write_handle: Option<String>,
    pub routing_token: Option<String>,
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_values<'h>(headers: &'h HeaderMap, name: &str) -> Vec<&'h str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect()
}

pub fn parse_chunk_request(headers: &HeaderMap) -> ApiResult<ChunkRequest> {
    let offset = header_str(headers, UPLOAD_OFFSET_HEADER)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {UPLOAD_OFFSET_HEADER} header")))?
        .parse::<u64>()
        .map_err(|_| {
            ApiError::BadRequest(format!("{UPLOAD_OFFSET_HEADER} must be a byte offset"))
        })?;

    let finalize = header_str(headers, UPLOAD_COMMAND_HEADER)
        .map(|commands| {
            commands
                .split(',')
                .any(|c| c.trim().eq_ignore_ascii_case("finalize"))
        })
        .unwrap_or(false);

    let chunk_crc32c = parse_hash_manifest(header_values(headers, CHUNK_HASH_HEADER))
        .crc32c
        .map(|encoded| {
            decode_crc32c(&encoded).ok_or_else(|| {
                ApiError::BadRequest(format!("{CHUNK_HASH_HEADER} carries an invalid crc32c"))
            })
        })
        .transpose()?;

    let declared = parse_object_checksums(headers)?;

    Ok(ChunkRequest {
        offset,
        finalize,
        chunk_crc32c,
        declared,
        write_handle: header_str(headers, WRITE_HANDLE_HEADER).map(str::to_string),
        routing_token: header_str(headers, ROUTING_TOKEN_HEADER).map(str::to_string),
    })
}

/// Declared whole-object checksums from the hash-manifest header, in the
/// same format the original protocol puts on its finalize request.
pub fn parse_object_checksums(headers: &HeaderMap) -> ApiResult<Option<ObjectChecksums>> {
    let manifest = parse_hash_manifest(header_values(headers, OBJECT_HASH_HEADER));
    let crc32c = manifest
        .crc32c
        .map(|encoded| {
            decode_crc32c(&encoded).ok_or_else(|| {
                ApiError::BadRequest(format!("{OBJECT_HASH_HEADER} carries an invalid crc32c"))
            })
        })
        .transpose()?;
    let md5_hash = manifest
        .md5
        .map(|encoded| {
            decode_md5(&encoded).ok_or_else(|| {
                ApiError::BadRequest(format!("{OBJECT_HASH_HEADER} carries an invalid md5"))
            })
        })
        .transpose()?;
    Ok((crc32c.is_some() || md5_hash.is_some()).then_some(ObjectChecksums { crc32c, md5_hash }))
}

/// Expected part checksum on an UploadPart request, from the hash manifest.
pub fn parse_expected_part_crc32c(headers: &HeaderMap) -> ApiResult<Option<u32>> {
    Ok(parse_object_checksums(headers)?.and_then(|checksums| checksums.crc32c))
}
