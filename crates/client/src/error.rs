//! Error type and backend error-code translation.

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

/// Failure category, for callers that care about "gone" vs "try again".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The key, bucket, or upload doesn't exist.
    NotFound,
    /// Could not reach the backend at all.
    Network,
    /// The backend answered with an error.
    Backend,
}

/// An object store failure with a plain-language message and raw detail.
///
/// `user_message` is suitable for direct display; `detail` is the raw
/// diagnostic string for logs or a "show details" expander.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{user_message}")]
pub struct ClientError {
    pub kind: ErrorKind,
    pub user_message: String,
    pub detail: String,
}

impl ClientError {
    pub fn new(kind: ErrorKind, user_message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            user_message: user_message.into(),
            detail: detail.into(),
        }
    }

    /// Shortcut for a generic backend error.
    pub fn backend(user_message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backend, user_message, detail)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

/// Well-known backend error codes mapped to (message, suggestion).
const ERROR_MESSAGES: &[(&str, &str, &str)] = &[
    (
        "InvalidAccessKeyId",
        "Invalid access key.",
        "Check that your Access Key ID is correct in Settings.",
    ),
    (
        "SignatureDoesNotMatch",
        "Invalid secret key.",
        "Check that your Secret Access Key is correct in Settings.",
    ),
    (
        "AccessDenied",
        "Access denied.",
        "Your credentials don't have permission for this action. Check your IAM policy.",
    ),
    (
        "NoSuchBucket",
        "Bucket not found.",
        "The bucket may have been deleted or you may have a typo in the name.",
    ),
    (
        "NoSuchKey",
        "File not found.",
        "The file may have been deleted or moved by someone else.",
    ),
    (
        "NoSuchUpload",
        "The multipart upload no longer exists.",
        "It may have been aborted or completed by another session.",
    ),
    ("BucketAlreadyOwnedByYou", "You already own this bucket.", ""),
    (
        "BucketNotEmpty",
        "Bucket is not empty.",
        "Delete all files in the bucket before deleting it.",
    ),
    (
        "EntityTooLarge",
        "File is too large for a single upload.",
        "This shouldn't happen — the app should use multipart upload. Please report this bug.",
    ),
    (
        "SlowDown",
        "S3 is asking us to slow down.",
        "Too many requests. The app will retry automatically.",
    ),
    (
        "ServiceUnavailable",
        "S3 is temporarily unavailable.",
        "Try again in a few moments.",
    ),
    (
        "InternalError",
        "S3 encountered an internal error.",
        "Try again in a few moments.",
    ),
    (
        "RequestTimeout",
        "The request timed out.",
        "Check your network connection and try again.",
    ),
    (
        "ExpiredToken",
        "Your credentials have expired.",
        "Update your credentials in Settings.",
    ),
    (
        "InvalidBucketName",
        "Invalid bucket name.",
        "Bucket names must be 3-63 characters, lowercase letters, numbers, and hyphens.",
    ),
    (
        "KeyTooLongError",
        "File name is too long.",
        "S3 keys can be at most 1024 bytes.",
    ),
];

/// Translates an SDK failure into a [`ClientError`], keeping the raw error
/// text as the diagnostic detail.
pub(crate) fn translate<E, R>(operation: &str, err: SdkError<E, R>) -> ClientError
where
    SdkError<E, R>: std::error::Error,
    E: ProvideErrorMetadata,
{
    let detail = format!("{operation}: {}", DisplayErrorContext(&err));

    let (kind, user_message) = match &err {
        SdkError::DispatchFailure(_) => (
            ErrorKind::Network,
            "Could not connect to S3. Check your network connection and try again.".to_string(),
        ),
        SdkError::TimeoutError(_) => (
            ErrorKind::Network,
            "The connection timed out. Check your network connection.".to_string(),
        ),
        _ => match err.code() {
            Some(code) => classify_code(code, err.message()),
            None => (
                ErrorKind::Backend,
                "An unexpected error occurred.".to_string(),
            ),
        },
    };

    ClientError {
        kind,
        user_message,
        detail,
    }
}

pub(crate) fn classify_code(code: &str, backend_message: Option<&str>) -> (ErrorKind, String) {
    for (known, message, suggestion) in ERROR_MESSAGES {
        if *known == code {
            let kind = match *known {
                "NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" => ErrorKind::NotFound,
                _ => ErrorKind::Backend,
            };
            let user_message = if suggestion.is_empty() {
                (*message).to_string()
            } else {
                format!("{message} {suggestion}")
            };
            return (kind, user_message);
        }
    }

    match backend_message {
        Some(msg) if !msg.is_empty() => (ErrorKind::Backend, format!("S3 error: {msg}")),
        _ => (ErrorKind::Backend, "An unexpected S3 error occurred.".to_string()),
    }
}
