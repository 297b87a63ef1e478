use nebula_common::NamespacedName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound {
        kind: &'static str,
        key: NamespacedName,
    },

    /// The record changed since it was read; re-fetch and retry.
    #[error("conflict writing {kind} {key}: the record has been modified")]
    Conflict {
        kind: &'static str,
        key: NamespacedName,
    },

    #[error("{kind} {key} already exists")]
    AlreadyExists {
        kind: &'static str,
        key: NamespacedName,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
