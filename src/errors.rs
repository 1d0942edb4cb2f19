use thiserror::Error;

pub(crate) type ApiResult<T> = Result<T, ApiError>;

/// Every failure that can cross the API boundary. Each variant maps to one
/// HTTP status and one stable wire code; the `Display` string becomes the
/// `message` field of the error envelope.
#[derive(Debug, Error)]
pub(crate) enum ApiError {
    #[error("invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("missing required parameter: {0}")]
    MissingParam(String),

    #[error("metadata key is {len} bytes, limit is {max}")]
    MetadataKeyTooLong { len: usize, max: usize },

    #[error("metadata value is {len} bytes, limit is {max}")]
    MetadataValueTooLong { len: usize, max: usize },

    #[error("batch contains {count} operations, limit is {max}")]
    BatchTooManyOperations { count: usize, max: usize },

    /// A named topic does not exist (query / apply selection).
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    /// A mutating operation was refused because the topic failed
    /// verification. Carries the topic's recorded error.
    #[error("topic {topic} is unhealthy: {detail}")]
    TopicUnhealthy { topic: String, detail: String },

    /// An unhealthy topic was named in a query / apply selection.
    #[error("topic {0} is unhealthy and cannot be queried")]
    UnhealthyTopicSelected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown query preset: {0}")]
    PresetNotFound(String),

    #[error("blob is {size} bytes, segment limit is {max}")]
    BlobTooLarge { size: u64, max: u64 },

    #[error("disk usage {usage} bytes would exceed the {limit} byte limit")]
    DiskLimitExceeded { usage: u64, limit: u64 },

    #[error("invalid credentials")]
    LoginFailed,

    #[error("too many failed login attempts")]
    LoginLocked,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ApiError {
    pub(crate) fn internal(context: impl Into<String>) -> Self {
        Self::Internal(context.into())
    }

    pub(crate) fn status(&self) -> u16 {
        match self {
            Self::InvalidTopicName(_)
            | Self::InvalidRequest(_)
            | Self::MissingParam(_)
            | Self::MetadataKeyTooLong { .. }
            | Self::MetadataValueTooLong { .. }
            | Self::BatchTooManyOperations { .. }
            | Self::TopicNotFound(_)
            | Self::UnhealthyTopicSelected(_) => 400,
            Self::LoginFailed => 401,
            Self::NotFound(_) | Self::PresetNotFound(_) => 404,
            Self::BlobTooLarge { .. } => 413,
            Self::LoginLocked => 429,
            Self::TopicUnhealthy { .. } => 503,
            Self::DiskLimitExceeded { .. } => 507,
            Self::Internal(_) | Self::Io(_) | Self::Sql(_) | Self::Json(_) => 500,
        }
    }

    pub(crate) fn code(&self) -> &'static str {
        match self {
            Self::InvalidTopicName(_) => "INVALID_TOPIC_NAME",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::MissingParam(_) => "MISSING_PARAM",
            Self::MetadataKeyTooLong { .. } => "METADATA_KEY_TOO_LONG",
            Self::MetadataValueTooLong { .. } => "METADATA_VALUE_TOO_LONG",
            Self::BatchTooManyOperations { .. } => "BATCH_TOO_MANY_OPERATIONS",
            Self::TopicNotFound(_) => "TOPIC_NOT_FOUND",
            Self::TopicUnhealthy { .. } | Self::UnhealthyTopicSelected(_) => "TOPIC_UNHEALTHY",
            Self::NotFound(_) => "NOT_FOUND",
            Self::PresetNotFound(_) => "PRESET_NOT_FOUND",
            Self::BlobTooLarge { .. } => "BLOB_TOO_LARGE",
            Self::DiskLimitExceeded { .. } => "DISK_LIMIT_EXCEEDED",
            Self::LoginFailed => "INVALID_CREDENTIALS",
            Self::LoginLocked => "TOO_MANY_ATTEMPTS",
            Self::Internal(_) | Self::Io(_) | Self::Sql(_) | Self::Json(_) => "INTERNAL",
        }
    }

    /// The `{code, message}` envelope every error response carries.
    pub(crate) fn envelope(&self) -> serde_json::Value {
        serde_json::json!({ "code": self.code(), "message": self.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_code_mapping() {
        let e = ApiError::DiskLimitExceeded { usage: 10, limit: 1 };
        assert_eq!(e.status(), 507);
        assert_eq!(e.code(), "DISK_LIMIT_EXCEEDED");

        let e = ApiError::BatchTooManyOperations { count: 4, max: 3 };
        assert_eq!(e.status(), 400);
        assert_eq!(e.code(), "BATCH_TOO_MANY_OPERATIONS");

        let e = ApiError::TopicUnhealthy {
            topic: "t".into(),
            detail: "chain mismatch".into(),
        };
        assert_eq!(e.status(), 503);
        assert_eq!(e.code(), "TOPIC_UNHEALTHY");

        // Same wire code, query-selection context is a client error.
        let e = ApiError::UnhealthyTopicSelected("t".into());
        assert_eq!(e.status(), 400);
        assert_eq!(e.code(), "TOPIC_UNHEALTHY");
    }

    #[test]
    fn test_envelope_shape() {
        let e = ApiError::PresetNotFound("bogus".into());
        let v = e.envelope();
        assert_eq!(v["code"], "PRESET_NOT_FOUND");
        assert!(v["message"].as_str().unwrap().contains("bogus"));
    }
}
