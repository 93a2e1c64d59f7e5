//! Error types for volseg operations

use std::collections::BTreeMap;
use thiserror::Error;

/// Main error type for pyramid building, archive and query operations
#[derive(Error, Debug)]
pub enum VolsegError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Contradictory size/threshold bounds or otherwise unusable settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Grid shapes disagree across channels, timeframes or data kinds
    #[error("Data shape error: {0}")]
    DataShape(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Mesh lookup miss; carries every queryable segment and its detail levels
    #[error(
        "Invalid segment_id={segment_id} or detail_lvl={detail_level} (available segment_ids and detail_lvls: {})",
        format_available(.available)
    )]
    MeshNotFound {
        segment_id: u32,
        detail_level: u32,
        available: BTreeMap<u32, Vec<u32>>,
    },

    /// Archive open/commit failure
    #[error("Storage error: {0}")]
    StorageIo(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

/// Specialized Result type for volseg operations
pub type Result<T> = std::result::Result<T, VolsegError>;

impl From<bincode::Error> for VolsegError {
    fn from(err: bincode::Error) -> Self {
        VolsegError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VolsegError {
    fn from(err: serde_json::Error) -> Self {
        VolsegError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for VolsegError {
    fn from(err: tokio::task::JoinError) -> Self {
        VolsegError::TaskFailed(err.to_string())
    }
}

fn format_available(available: &BTreeMap<u32, Vec<u32>>) -> String {
    let parts: Vec<String> = available
        .iter()
        .map(|(segment, levels)| format!("{}: {:?}", segment, levels))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_not_found_lists_available_levels() {
        let mut available = BTreeMap::new();
        available.insert(1, vec![1, 2, 3]);
        available.insert(7, vec![1]);
        let err = VolsegError::MeshNotFound {
            segment_id: 4,
            detail_level: 9,
            available,
        };
        let msg = err.to_string();
        assert!(msg.contains("segment_id=4"));
        assert!(msg.contains("detail_lvl=9"));
        assert!(msg.contains("1: [1, 2, 3], 7: [1]"));
    }

    #[test]
    fn test_serde_json_error_maps_to_serialization() {
        let err: VolsegError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, VolsegError::Serialization(_)));
    }
}
