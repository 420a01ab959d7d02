use thiserror::Error;

use crate::model::RecordKey;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("invalid record for key {key}: {reason}")]
    InvalidRecord { key: RecordKey, reason: String },

    #[error("schema configuration error: {0}")]
    Configuration(String),

    #[error("ambiguous order for key {key}: conflicting arrivals at timestamp {timestamp}")]
    AmbiguousOrder { key: RecordKey, timestamp: i64 },

    #[error("planning worker failed: {0}")]
    Worker(String),
}

impl PlanError {
    pub fn invalid(key: &RecordKey, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    /// The key group this error is scoped to, if any.
    pub fn key(&self) -> Option<&RecordKey> {
        match self {
            Self::InvalidRecord { key, .. } | Self::AmbiguousOrder { key, .. } => Some(key),
            Self::Configuration(_) | Self::Worker(_) => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("row for key {key} has a null key field or timestamp")]
    Unkeyed { key: RecordKey },

    #[error("update targets missing row for key {key} at {timestamp}")]
    MissingRow { key: RecordKey, timestamp: i64 },

    #[error("insert collides with stored row for key {key} at {timestamp}")]
    DuplicateRow { key: RecordKey, timestamp: i64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value {value:?} for property {property}")]
    Property { property: String, value: String },
}
