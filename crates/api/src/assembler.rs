//! Wire responses in, domain results out. Every function here is a total
//! mapping: unrecognized extra fields never fail (newer peers stay readable),
//! only a missing required field or unparseable input does.

use serde::Deserialize;

use driftbay_engine::CompleteResult;
use driftbay_session::{CompletedPart, Result, UploadError};

/// Hashes extracted from a hash-manifest header: comma-separated
/// `name=base64value` tokens. Recognized names are `crc32c` and `md5`,
/// case-insensitive. Malformed tokens are dropped, unknown names ignored,
/// and on a duplicate name the first occurrence wins; repeated header values
/// merge under the same rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashManifest {
    pub crc32c: Option<String>,
    pub md5: Option<String>,
}

pub fn parse_hash_manifest<'a>(values: impl IntoIterator<Item = &'a str>) -> HashManifest {
    let mut manifest = HashManifest::default();
    for value in values {
        for token in value.split(',') {
            // Base64 values end in '='; only the first '=' separates the name.
            let Some((name, encoded)) = token.split_once('=') else {
                continue;
            };
            let encoded = encoded.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "crc32c" => {
                    if manifest.crc32c.is_none() {
                        manifest.crc32c = Some(encoded.to_string());
                    }
                }
                "md5" => {
                    if manifest.md5.is_none() {
                        manifest.md5 = Some(encoded.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    manifest
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPartResult {
    pub etag: String,
    pub crc32c: Option<String>,
    pub md5: Option<String>,
}

/// An upload-part response: the etag rides the `ETag` header, content hashes
/// ride the hash-manifest header (zero or more values).
pub fn assemble_upload_part<'a>(
    etag: Option<&str>,
    hash_headers: impl IntoIterator<Item = &'a str>,
) -> Result<UploadPartResult> {
    let etag = etag.ok_or_else(|| {
        UploadError::Parse("upload-part response carries no ETag header".to_string())
    })?;
    let hashes = parse_hash_manifest(hash_headers);
    Ok(UploadPartResult {
        etag: etag.to_string(),
        crc32c: hashes.crc32c,
        md5: hashes.md5,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMultipartUploadResult {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

fn parse_xml<'de, T: Deserialize<'de>>(xml: &'de str, what: &str) -> Result<T> {
    quick_xml::de::from_str(xml).map_err(|e| UploadError::Parse(format!("{what}: {e}")))
}

fn require<T>(field: Option<T>, what: &str, name: &str) -> Result<T> {
    field.ok_or_else(|| UploadError::Parse(format!("{what} is missing {name}")))
}

/// `InitiateMultipartUploadResult { Bucket, Key, UploadId }`.
pub fn assemble_initiate(xml: &str) -> Result<CreateMultipartUploadResult> {
    #[derive(Default, Deserialize)]
    #[serde(default, rename_all = "PascalCase")]
    struct Raw {
        bucket: Option<String>,
        key: Option<String>,
        upload_id: Option<String>,
    }

    let what = "initiate response";
    let raw: Raw = parse_xml(xml, what)?;
    Ok(CreateMultipartUploadResult {
        bucket: require(raw.bucket, what, "Bucket")?,
        key: require(raw.key, what, "Key")?,
        upload_id: require(raw.upload_id, what, "UploadId")?,
    })
}

/// `CompleteMultipartUploadResult { Location, Bucket, Key, ETag }`.
pub fn assemble_complete(xml: &str) -> Result<CompleteResult> {
    #[derive(Default, Deserialize)]
    #[serde(default, rename_all = "PascalCase")]
    struct Raw {
        location: Option<String>,
        bucket: Option<String>,
        key: Option<String>,
        #[serde(rename = "ETag")]
        etag: Option<String>,
    }

    let what = "complete response";
    let raw: Raw = parse_xml(xml, what)?;
    Ok(CompleteResult {
        location: require(raw.location, what, "Location")?,
        bucket: require(raw.bucket, what, "Bucket")?,
        key: require(raw.key, what, "Key")?,
        etag: require(raw.etag, what, "ETag")?,
    })
}

/// Complete request body: `CompleteMultipartUpload` with repeated bare
/// `Part { PartNumber, ETag }` elements.
pub fn parse_complete_request(xml: &str) -> Result<Vec<CompletedPart>> {
    #[derive(Default, Deserialize)]
    #[serde(default, rename_all = "PascalCase")]
    struct RawPart {
        part_number: Option<i32>,
        #[serde(rename = "ETag")]
        etag: Option<String>,
    }

    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct Raw {
        #[serde(rename = "Part")]
        parts: Vec<RawPart>,
    }

    let what = "complete request";
    let raw: Raw = parse_xml(xml, what)?;
    raw.parts
        .into_iter()
        .map(|p| {
            Ok(CompletedPart {
                part_number: require(p.part_number, what, "PartNumber")?,
                etag: require(p.etag, what, "ETag")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_both_hashes() {
        let m = parse_hash_manifest(["crc32c=AAAAAA==,md5=ZmFrZQ=="]);
        assert_eq!(m.crc32c.as_deref(), Some("AAAAAA=="));
        assert_eq!(m.md5.as_deref(), Some("ZmFrZQ=="));
    }

    #[test]
    fn manifest_drops_malformed_tokens() {
        let m = parse_hash_manifest(["crc32c=AAAAAA==, invalid"]);
        assert_eq!(m.crc32c.as_deref(), Some("AAAAAA=="));
        assert_eq!(m.md5, None);
    }

    #[test]
    fn manifest_ignores_unknown_names() {
        let m = parse_hash_manifest(["crc32c=AAAAAA==,sha256=ZmFrZQ=="]);
        assert_eq!(m.crc32c.as_deref(), Some("AAAAAA=="));
        assert_eq!(m.md5, None);
    }

    #[test]
    fn manifest_first_occurrence_wins() {
        let m = parse_hash_manifest(["crc32c=Zmlyc3Q=,crc32c=c2Vjb25k"]);
        assert_eq!(m.crc32c.as_deref(), Some("Zmlyc3Q="));
    }

    #[test]
    fn manifest_names_are_case_insensitive() {
        let m = parse_hash_manifest(["CRC32C=AAAAAA==,Md5=ZmFrZQ=="]);
        assert_eq!(m.crc32c.as_deref(), Some("AAAAAA=="));
        assert_eq!(m.md5.as_deref(), Some("ZmFrZQ=="));
    }

    #[test]
    fn manifest_merges_repeated_headers() {
        let m = parse_hash_manifest(["crc32c=AAAAAA==", "md5=ZmFrZQ==,extra=value"]);
        assert_eq!(m.crc32c.as_deref(), Some("AAAAAA=="));
        assert_eq!(m.md5.as_deref(), Some("ZmFrZQ=="));
    }

    #[test]
    fn manifest_of_nothing_is_empty() {
        assert_eq!(parse_hash_manifest([]), HashManifest::default());
        assert_eq!(parse_hash_manifest([""]), HashManifest::default());
    }

    #[test]
    fn upload_part_requires_an_etag() {
        let result = assemble_upload_part(Some("\"abc\""), ["crc32c=AAAAAA=="]).unwrap();
        assert_eq!(result.etag, "\"abc\"");
        assert_eq!(result.crc32c.as_deref(), Some("AAAAAA=="));

        assert!(matches!(
            assemble_upload_part(None, []),
            Err(UploadError::Parse(_))
        ));
    }

    #[test]
    fn initiate_parses_and_tolerates_extras() {
        let xml = r#"
            <InitiateMultipartUploadResult>
                <Bucket>b</Bucket>
                <Key>k</Key>
                <UploadId>mpu_1</UploadId>
                <FutureField>ignored</FutureField>
            </InitiateMultipartUploadResult>
        "#;
        let result = assemble_initiate(xml).unwrap();
        assert_eq!(result.bucket, "b");
        assert_eq!(result.key, "k");
        assert_eq!(result.upload_id, "mpu_1");
    }

    #[test]
    fn initiate_missing_field_is_a_parse_error() {
        let xml = "<InitiateMultipartUploadResult><Bucket>b</Bucket></InitiateMultipartUploadResult>";
        assert!(matches!(assemble_initiate(xml), Err(UploadError::Parse(_))));
    }

    #[test]
    fn complete_response_parses() {
        let xml = r#"
            <CompleteMultipartUploadResult>
                <Location>/b/k</Location>
                <Bucket>b</Bucket>
                <Key>k</Key>
                <ETag>composite-2</ETag>
            </CompleteMultipartUploadResult>
        "#;
        let result = assemble_complete(xml).unwrap();
        assert_eq!(result.location, "/b/k");
        assert_eq!(result.etag, "composite-2");
    }

    #[test]
    fn complete_request_parses_bare_repeated_parts() {
        let xml = r#"
            <CompleteMultipartUpload>
                <Part><PartNumber>1</PartNumber><ETag>e1</ETag></Part>
                <Part><PartNumber>2</PartNumber><ETag>e2</ETag></Part>
            </CompleteMultipartUpload>
        "#;
        let parts = parse_complete_request(xml).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[1].etag, "e2");
    }

    #[test]
    fn complete_request_with_garbage_is_a_parse_error() {
        assert!(matches!(
            parse_complete_request("<not-even-close"),
            Err(UploadError::Parse(_))
        ));
    }
}
