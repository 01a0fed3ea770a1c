//! Value types shared by the client, cache, and transfer layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One object or synthetic "folder" (common prefix) within a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Display name, relative to the listing's prefix.
    pub name: String,
    /// Full object key (or raw prefix, for folders).
    pub key: String,
    pub is_prefix: bool,
    pub size: Option<i64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<String>,
    pub etag: Option<String>,
}

impl ObjectEntry {
    /// An entry for a synthetic folder derived from a common prefix.
    pub fn prefix(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            is_prefix: true,
            size: None,
            last_modified: None,
            storage_class: None,
            etag: None,
        }
    }
}

/// One durably stored part of an open multipart upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: i32,
    pub etag: String,
    pub size: i64,
}

/// An in-progress multipart upload, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipartUploadInfo {
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// Part number + ETag pair handed to the completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletePart {
    pub part_number: i32,
    pub etag: String,
}
