//! Content integrity primitives shared by both upload pipelines.
//!
//! CRC32C is composable over concatenation: extending a running value with the
//! next chunk gives the same result as hashing the concatenation in one pass,
//! so whole-object checksums cost O(chunk) per chunk.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use thiserror::Error;

/// CRC32C of `data` in one pass.
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Extends a running CRC32C with `data`.
pub fn crc32c_extend(state: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(state, data)
}

/// MD5 digest of `data`.
pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{algorithm} mismatch: expected {expected}, got {actual}")]
pub struct ChecksumMismatch {
    pub algorithm: &'static str,
    pub expected: String,
    pub actual: String,
}

/// Verifies a CRC32C when an expectation is present. No expectation, no check.
pub fn verify_crc32c(expected: Option<u32>, actual: u32) -> Result<(), ChecksumMismatch> {
    match expected {
        Some(want) if want != actual => Err(ChecksumMismatch {
            algorithm: "crc32c",
            expected: encode_crc32c(want),
            actual: encode_crc32c(actual),
        }),
        _ => Ok(()),
    }
}

/// Verifies an MD5 digest when an expectation is present.
pub fn verify_md5(expected: Option<&[u8]>, actual: &[u8; 16]) -> Result<(), ChecksumMismatch> {
    match expected {
        Some(want) if want != actual => Err(ChecksumMismatch {
            algorithm: "md5",
            expected: encode_md5(want),
            actual: encode_md5(actual),
        }),
        _ => Ok(()),
    }
}

/// Wire form of a CRC32C value: base64 of the big-endian u32.
pub fn encode_crc32c(value: u32) -> String {
    STANDARD.encode(value.to_be_bytes())
}

/// Parses the wire form back to a u32. Anything that is not base64 of exactly
/// four bytes is rejected.
pub fn decode_crc32c(value: &str) -> Option<u32> {
    let raw = STANDARD.decode(value).ok()?;
    let bytes: [u8; 4] = raw.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Wire form of an MD5 digest: plain base64.
pub fn encode_md5(digest: &[u8]) -> String {
    STANDARD.encode(digest)
}

/// Parses a base64 MD5 digest. Must decode to exactly 16 bytes.
pub fn decode_md5(value: &str) -> Option<Vec<u8>> {
    let raw = STANDARD.decode(value).ok()?;
    (raw.len() == 16).then_some(raw)
}

/// Hex MD5 of `data`, the etag form used for uploaded bytes.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_matches_one_pass() {
        let cases: &[(&[u8], &[u8])] = &[
            (b"hello, ", b"world"),
            (b"", b"nonempty"),
            (b"nonempty", b""),
            (&[0u8; 1024], &[0xffu8; 512]),
        ];
        for (a, b) in cases {
            let mut joined = a.to_vec();
            joined.extend_from_slice(b);
            let rolled = crc32c_extend(crc32c(a), b);
            assert_eq!(rolled, crc32c(&joined));
        }
    }

    #[test]
    fn absent_expectation_is_not_checked() {
        assert!(verify_crc32c(None, 0xdeadbeef).is_ok());
        assert!(verify_md5(None, &[0u8; 16]).is_ok());
    }

    #[test]
    fn mismatch_carries_both_values() {
        let err = verify_crc32c(Some(1), 2).unwrap_err();
        assert_eq!(err.algorithm, "crc32c");
        assert_eq!(err.expected, encode_crc32c(1));
        assert_eq!(err.actual, encode_crc32c(2));

        let actual = md5(b"abc");
        assert!(verify_md5(Some(&actual), &actual).is_ok());
        assert!(verify_md5(Some(&[0u8; 16]), &actual).is_err());
    }

    #[test]
    fn crc32c_codec_round_trip() {
        for value in [0u32, 1, 0xffff_ffff, crc32c(b"payload")] {
            assert_eq!(decode_crc32c(&encode_crc32c(value)), Some(value));
        }
        assert_eq!(decode_crc32c("not base64!"), None);
        // base64 of 3 bytes, wrong width
        assert_eq!(decode_crc32c("AAAA"), None);
    }

    #[test]
    fn md5_codec_round_trip() {
        let digest = md5(b"payload");
        assert_eq!(decode_md5(&encode_md5(&digest)), Some(digest.to_vec()));
        assert_eq!(decode_md5("AAAA"), None);
    }

    #[test]
    fn etag_is_hex_md5() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
