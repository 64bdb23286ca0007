use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown storage class: {0}")]
pub struct UnknownStorageClass(String);

/// Open string-backed storage class. Two ways in: `parse_strict` rejects
/// values this build does not know; the lenient `From<&str>` stores unknown
/// values verbatim so newer peers keep round-tripping through older code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageClass {
    Standard,
    Nearline,
    Coldline,
    Archive,
    Other(String),
}

impl StorageClass {
    pub fn as_str(&self) -> &str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::Nearline => "NEARLINE",
            StorageClass::Coldline => "COLDLINE",
            StorageClass::Archive => "ARCHIVE",
            StorageClass::Other(value) => value,
        }
    }

    pub fn parse_strict(value: &str) -> Result<Self, UnknownStorageClass> {
        match StorageClass::from(value) {
            StorageClass::Other(unknown) => Err(UnknownStorageClass(unknown)),
            known => Ok(known),
        }
    }
}

impl From<&str> for StorageClass {
    fn from(value: &str) -> Self {
        match value {
            "STANDARD" => StorageClass::Standard,
            "NEARLINE" => StorageClass::Nearline,
            "COLDLINE" => StorageClass::Coldline,
            "ARCHIVE" => StorageClass::Archive,
            other => StorageClass::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_rejects_what_lenient_keeps() {
        assert_eq!(StorageClass::parse_strict("STANDARD").unwrap(), StorageClass::Standard);
        assert!(StorageClass::parse_strict("GLACIER_DEEP").is_err());

        let lenient = StorageClass::from("GLACIER_DEEP");
        assert_eq!(lenient, StorageClass::Other("GLACIER_DEEP".to_string()));
        // Round-trips verbatim.
        assert_eq!(lenient.as_str(), "GLACIER_DEEP");
    }

    #[test]
    fn casing_is_significant() {
        assert!(StorageClass::parse_strict("standard").is_err());
        assert_eq!(StorageClass::from("standard").as_str(), "standard");
    }
}
