//! aws-sdk-s3 implementation of [`ObjectStore`].

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Builder, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier,
};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::{debug, warn};

use crate::error::{ClientError, ErrorKind, translate};
use crate::types::{CompletePart, MultipartUploadInfo, ObjectEntry, PartInfo};
use crate::{ObjectStore, Result};

/// Copy sources are URL-path encoded, but the key's own slashes stay.
const COPY_SOURCE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'/');

/// Connection settings for [`S3ObjectStore`].
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
    /// MinIO and most self-hosted endpoints need path-style addressing.
    pub force_path_style: bool,
}

/// S3 client scoped to a single bucket.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Builds a client from static credentials.
    pub fn connect(config: &S3Config) -> Result<Self> {
        if config.access_key_id.trim().is_empty() || config.secret_access_key.trim().is_empty() {
            return Err(ClientError::backend(
                "Access credentials are missing.",
                "connect: empty access key id or secret access key",
            ));
        }

        let region = match config.region.trim() {
            "" => "us-east-1",
            region => region,
        };

        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            config.session_token.clone(),
            None,
            "bucketeer",
        );

        let mut builder = Builder::new()
            .behavior_version_latest()
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials);

        if let Some(endpoint) = config
            .endpoint_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            builder = builder.endpoint_url(endpoint.to_string());
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        debug!(
            bucket = %config.bucket,
            region = %region,
            endpoint = ?config.endpoint_url,
            "S3 client created"
        );

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn to_utc(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    dt.to_millis()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: &str,
    ) -> Result<(Vec<ObjectEntry>, Vec<String>)> {
        debug!(bucket = %self.bucket, prefix = %prefix, "list_objects");
        let mut entries = Vec::new();
        let mut prefixes = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter(delimiter)
                .max_keys(1000);
            if let Some(token) = continuation_token.as_deref() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|err| translate("list_objects", err))?;

            for object in output.contents() {
                let key = object.key().unwrap_or_default();
                // Some backends return the prefix marker itself as an object.
                if key.is_empty() || key == prefix {
                    continue;
                }
                let name = key.strip_prefix(prefix).unwrap_or(key).to_string();
                entries.push(ObjectEntry {
                    name,
                    key: key.to_string(),
                    is_prefix: false,
                    size: object.size(),
                    last_modified: object.last_modified().and_then(to_utc),
                    storage_class: object.storage_class().map(|class| class.as_str().to_string()),
                    etag: object.e_tag().map(trim_etag),
                });
            }

            for common in output.common_prefixes() {
                let Some(raw) = common.prefix() else { continue };
                let name = raw
                    .strip_prefix(prefix)
                    .unwrap_or(raw)
                    .trim_end_matches('/')
                    .to_string();
                prefixes.push(raw.to_string());
                entries.push(ObjectEntry::prefix(name, raw));
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        debug!(
            bucket = %self.bucket,
            prefix = %prefix,
            entries = entries.len(),
            prefixes = prefixes.len(),
            "list_objects finished"
        );
        Ok((entries, prefixes))
    }

    async fn head_object(&self, key: &str) -> Result<ObjectEntry> {
        debug!(bucket = %self.bucket, key = %key, "head_object");
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    ClientError::new(
                        ErrorKind::NotFound,
                        "File not found. The file may have been deleted or moved by someone else.",
                        format!("head_object: no such key '{key}'"),
                    )
                } else {
                    translate("head_object", err)
                }
            })?;

        let name = key.rsplit('/').next().unwrap_or(key).to_string();
        Ok(ObjectEntry {
            name,
            key: key.to_string(),
            is_prefix: false,
            size: output.content_length(),
            last_modified: output.last_modified().and_then(to_utc),
            storage_class: output.storage_class().map(|class| class.as_str().to_string()),
            etag: output.e_tag().map(|etag| trim_etag(etag)),
        })
    }

    async fn get_object(&self, key: &str, range: Option<(u64, u64)>) -> Result<Bytes> {
        debug!(bucket = %self.bucket, key = %key, range = ?range, "get_object");
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some((start, end)) = range {
            request = request.range(format!("bytes={start}-{end}"));
        }

        let output = request
            .send()
            .await
            .map_err(|err| translate("get_object", err))?;

        let data = output.body.collect().await.map_err(|err| {
            ClientError::new(
                ErrorKind::Network,
                "The download stream was interrupted. Check your network connection.",
                format!("get_object: {err}"),
            )
        })?;
        Ok(data.into_bytes())
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        debug!(bucket = %self.bucket, key = %key, size = body.len(), "put_object");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| translate("put_object", err))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        debug!(bucket = %self.bucket, key = %key, "delete_object");
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| translate("delete_object", err))?;
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        debug!(bucket = %self.bucket, count = keys.len(), "delete_objects");

        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let object = ObjectIdentifier::builder().key(key).build().map_err(|err| {
                ClientError::backend(
                    "Invalid object key in batch delete.",
                    format!("delete_objects: {err}"),
                )
            })?;
            objects.push(object);
        }
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|err| {
                ClientError::backend(
                    "Invalid batch delete request.",
                    format!("delete_objects: {err}"),
                )
            })?;

        let output = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| translate("delete_objects", err))?;

        let failed: Vec<String> = output
            .errors()
            .iter()
            .filter_map(|err| err.key().map(str::to_string))
            .collect();
        if !failed.is_empty() {
            warn!(bucket = %self.bucket, failed = failed.len(), "batch delete partial failure");
        }
        Ok(failed)
    }

    async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()> {
        debug!(bucket = %self.bucket, src = %src_key, dst = %dst_key, "copy_object");
        let encoded_src = utf8_percent_encode(src_key, COPY_SOURCE_ENCODE_SET);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(dst_key)
            .copy_source(format!("{}/{}", self.bucket, encoded_src))
            .send()
            .await
            .map_err(|err| translate("copy_object", err))?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        debug!(bucket = %self.bucket, key = %key, "create_multipart_upload");
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| translate("create_multipart_upload", err))?;

        output.upload_id().map(str::to_string).ok_or_else(|| {
            ClientError::backend(
                "S3 did not return a multipart upload id.",
                format!("create_multipart_upload: missing upload id for '{key}'"),
            )
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String> {
        debug!(
            bucket = %self.bucket,
            key = %key,
            part = part_number,
            size = body.len(),
            "upload_part"
        );
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| translate("upload_part", err))?;

        output.e_tag().map(trim_etag).ok_or_else(|| {
            ClientError::backend(
                "S3 did not return an ETag for an uploaded part.",
                format!("upload_part: missing etag for '{key}' part {part_number}"),
            )
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletePart],
    ) -> Result<()> {
        debug!(
            bucket = %self.bucket,
            key = %key,
            parts = parts.len(),
            "complete_multipart_upload"
        );
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|err| translate("complete_multipart_upload", err))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        debug!(bucket = %self.bucket, key = %key, upload_id = %upload_id, "abort_multipart_upload");
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| translate("abort_multipart_upload", err))?;
        Ok(())
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<PartInfo>> {
        debug!(bucket = %self.bucket, key = %key, upload_id = %upload_id, "list_parts");
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id);
            if let Some(value) = marker.as_deref() {
                request = request.part_number_marker(value);
            }

            let output = request
                .send()
                .await
                .map_err(|err| translate("list_parts", err))?;

            for part in output.parts() {
                parts.push(PartInfo {
                    part_number: part.part_number().unwrap_or_default(),
                    etag: part.e_tag().map(|etag| trim_etag(etag)).unwrap_or_default(),
                    size: part.size().unwrap_or_default(),
                });
            }

            if output.is_truncated().unwrap_or(false) {
                marker = output.next_part_number_marker().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(parts)
    }

    async fn list_multipart_uploads(&self) -> Result<Vec<MultipartUploadInfo>> {
        debug!(bucket = %self.bucket, "list_multipart_uploads");
        let mut uploads = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        loop {
            let mut request = self.client.list_multipart_uploads().bucket(&self.bucket);
            if let Some(value) = key_marker.as_deref() {
                request = request.key_marker(value);
            }
            if let Some(value) = upload_id_marker.as_deref() {
                request = request.upload_id_marker(value);
            }

            let output = request
                .send()
                .await
                .map_err(|err| translate("list_multipart_uploads", err))?;

            for upload in output.uploads() {
                let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) else {
                    continue;
                };
                uploads.push(MultipartUploadInfo {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                    // A missing timestamp counts as "just started" so orphan
                    // cleanup leaves it alone.
                    initiated: upload.initiated().and_then(to_utc).unwrap_or_else(Utc::now),
                });
            }

            if output.is_truncated().unwrap_or(false) {
                key_marker = output.next_key_marker().map(str::to_string);
                upload_id_marker = output.next_upload_id_marker().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(uploads)
    }
}
