//! Object store access for Bucketeer.
//!
//! Transfer workers, the engine, and the listing layer talk to the backend
//! through the [`ObjectStore`] trait; [`S3ObjectStore`] is the aws-sdk-s3
//! implementation. Using a trait keeps transfer logic decoupled from the SDK
//! and testable with in-memory mocks.

mod error;
mod s3;
mod types;

pub use error::{ClientError, ErrorKind};
pub use s3::{S3Config, S3ObjectStore};
pub use types::{CompletePart, MultipartUploadInfo, ObjectEntry, PartInfo};

use async_trait::async_trait;
use bytes::Bytes;

/// Result alias for object store operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Operations the transfer and listing subsystems need from the backend.
///
/// Implementations are scoped to a single bucket. Every method translates
/// backend-native failures into a [`ClientError`]; callers never see SDK
/// error types.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists objects and common prefixes under `prefix`, paginating
    /// transparently.
    ///
    /// Common prefixes are surfaced both in the returned prefix list and as
    /// `is_prefix` entries in the listing. An object whose key equals the
    /// queried prefix is excluded (some backends return the prefix marker
    /// itself as an object).
    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: &str,
    ) -> Result<(Vec<ObjectEntry>, Vec<String>)>;

    /// Fetches metadata for a single object. Fails with
    /// [`ErrorKind::NotFound`] when the key is absent.
    async fn head_object(&self, key: &str) -> Result<ObjectEntry>;

    /// Downloads an object, or the inclusive byte range `[start, end]`.
    async fn get_object(&self, key: &str, range: Option<(u64, u64)>) -> Result<Bytes>;

    /// Uploads a whole object in a single request.
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()>;

    /// Deletes a single object.
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Best-effort batch delete. Returns the keys that failed; partial
    /// failure is data for the caller to reconcile, not an error.
    async fn delete_objects(&self, keys: &[String]) -> Result<Vec<String>>;

    /// Server-side copy within the bucket, metadata preserved.
    async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()>;

    /// Initiates a multipart upload and returns its upload id.
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;

    /// Uploads one part and returns its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String>;

    /// Completes a multipart upload from the full, ascending part list.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletePart],
    ) -> Result<()>;

    /// Aborts a multipart upload, discarding its parts on the backend.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Lists the parts the backend has durably stored for an open multipart
    /// upload, paginating transparently.
    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<PartInfo>>;

    /// Lists all in-progress multipart uploads in the bucket, paginating
    /// transparently.
    async fn list_multipart_uploads(&self) -> Result<Vec<MultipartUploadInfo>>;
}
