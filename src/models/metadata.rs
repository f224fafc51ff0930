//! User metadata attached to uploaded objects.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::task::ContentMode;

/// Base64 MD5 of the object as written to local storage.
pub const MD5_HASH: &str = "Md5Hash";
/// Whether the object body was filled with random bytes.
pub const RANDOMIZED: &str = "Randomized";
/// Sequence number of the file within its run.
pub const FILE_NUM: &str = "FileNum";
/// Object size in bytes.
pub const FILE_SIZE: &str = "FileSize";

/// Key-value metadata map stored alongside an object.
///
/// Keys are kept sorted so that backends persist them deterministically.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMetadata(BTreeMap<String, String>);

impl ObjectMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata describing one synthesized file.
    pub fn for_file(digest: &str, mode: ContentMode, file_num: usize, file_size: u64) -> Self {
        let mut metadata = Self::new();
        metadata.insert(MD5_HASH, digest);
        metadata.insert(RANDOMIZED, mode.is_randomized().to_string());
        metadata.insert(FILE_NUM, file_num.to_string());
        metadata.insert(FILE_SIZE, file_size.to_string());
        metadata
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for ObjectMetadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A single persisted metadata entry.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MetadataEntry {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Reference to the associated object.
    pub object_id: Uuid,

    /// Metadata key (e.g., "Md5Hash").
    pub key: String,

    /// Metadata value as plain text.
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_metadata_carries_all_keys() {
        let metadata = ObjectMetadata::for_file("abc=", ContentMode::Randomized, 7, 1024);
        assert_eq!(metadata.len(), 4);
        assert_eq!(metadata.get(MD5_HASH), Some("abc="));
        assert_eq!(metadata.get(RANDOMIZED), Some("true"));
        assert_eq!(metadata.get(FILE_NUM), Some("7"));
        assert_eq!(metadata.get(FILE_SIZE), Some("1024"));
    }
}
