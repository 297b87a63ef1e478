use std::sync::Arc;

use chrono::Utc;
use nebula_common::{NamespacedName, Resource};

use crate::error::StoreError;
use crate::types::{KvEntry, MetaStore};

/// Result of a metadata/spec write.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome<R> {
    Updated(R),
    /// Deletion was pending and the last finalizer is gone, so the record was removed.
    Removed,
}

/// Typed desired-state records on top of a [`MetaStore`].
///
/// Records live under `/resources/{kind}/{namespace}/{name}`. The backend
/// revision doubles as the resource version: every write is a
/// compare-and-swap against the version the caller read, and a mismatch
/// surfaces as [`StoreError::Conflict`].
#[derive(Clone)]
pub struct ResourceStore {
    meta: Arc<dyn MetaStore>,
}

impl ResourceStore {
    pub fn new(meta: Arc<dyn MetaStore>) -> Self {
        Self { meta }
    }

    pub fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    pub fn key_for<R: Resource>(key: &NamespacedName) -> String {
        format!("/resources/{}/{}/{}", R::KIND, key.namespace, key.name)
    }

    pub fn prefix_for<R: Resource>(namespace: &str) -> String {
        format!("/resources/{}/{}/", R::KIND, namespace)
    }

    /// Decode a raw entry, e.g. one delivered by a prefix watch.
    pub fn decode<R: Resource>(entry: &KvEntry) -> Result<R, StoreError> {
        let mut record: R = serde_json::from_slice(&entry.value)?;
        record.meta_mut().resource_version = entry.revision;
        Ok(record)
    }

    fn not_found<R: Resource>(key: &NamespacedName) -> StoreError {
        StoreError::NotFound {
            kind: R::KIND,
            key: key.clone(),
        }
    }

    fn conflict<R: Resource>(key: &NamespacedName) -> StoreError {
        StoreError::Conflict {
            kind: R::KIND,
            key: key.clone(),
        }
    }

    pub async fn get<R: Resource>(&self, key: &NamespacedName) -> Result<R, StoreError> {
        match self.meta.get(&Self::key_for::<R>(key)).await? {
            Some(entry) => Self::decode(&entry),
            None => Err(Self::not_found::<R>(key)),
        }
    }

    /// All records of a kind in a namespace. Undecodable values are skipped.
    pub async fn list<R: Resource>(&self, namespace: &str) -> Result<Vec<R>, StoreError> {
        let entries = self.meta.list_prefix(&Self::prefix_for::<R>(namespace)).await?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            match Self::decode::<R>(entry) {
                Ok(r) => out.push(r),
                Err(e) => {
                    tracing::warn!(key=%entry.key, error=%e, kind = R::KIND, "skipping undecodable record");
                }
            }
        }
        Ok(out)
    }

    pub async fn create<R: Resource>(&self, mut record: R) -> Result<R, StoreError> {
        let key = record.key();
        {
            let meta = record.meta_mut();
            meta.generation = meta.generation.max(1);
            meta.deletion_timestamp = None;
        }
        let value = serde_json::to_vec(&record)?;
        let outcome = self
            .meta
            .compare_and_swap(&Self::key_for::<R>(&key), 0, value)
            .await?;
        if !outcome.succeeded {
            return Err(StoreError::AlreadyExists { kind: R::KIND, key });
        }
        record.meta_mut().resource_version = outcome.revision;
        Ok(record)
    }

    /// Write metadata and spec. Status in `record` is ignored.
    ///
    /// A spec change bumps the generation. The deletion marker cannot be set
    /// or cleared here; use [`ResourceStore::delete`].
    pub async fn update<R: Resource>(&self, record: R) -> Result<UpdateOutcome<R>, StoreError> {
        let key = record.key();
        let current: R = self.get(&key).await?;
        if current.meta().resource_version != record.meta().resource_version {
            return Err(Self::conflict::<R>(&key));
        }

        let mut next = record;
        *next.status_mut() = current.status().clone();
        let spec_changed = next.spec() != current.spec();
        {
            let meta = next.meta_mut();
            meta.generation = current.meta().generation + i64::from(spec_changed);
            meta.deletion_timestamp = current.meta().deletion_timestamp;
        }

        let store_key = Self::key_for::<R>(&key);
        let expected = current.meta().resource_version;

        if next.meta().is_deleting() && next.meta().finalizers.is_empty() {
            let outcome = self.meta.compare_and_delete(&store_key, expected).await?;
            if !outcome.succeeded {
                return Err(Self::conflict::<R>(&key));
            }
            tracing::debug!(kind = R::KIND, %key, "finalizers cleared, record removed");
            return Ok(UpdateOutcome::Removed);
        }

        let value = serde_json::to_vec(&next)?;
        let outcome = self.meta.compare_and_swap(&store_key, expected, value).await?;
        if !outcome.succeeded {
            return Err(Self::conflict::<R>(&key));
        }
        next.meta_mut().resource_version = outcome.revision;
        Ok(UpdateOutcome::Updated(next))
    }

    /// Write only the status of `record`, leaving metadata and spec untouched.
    pub async fn update_status<R: Resource>(&self, record: &R) -> Result<R, StoreError> {
        let key = record.key();
        let mut current: R = self.get(&key).await?;
        if current.meta().resource_version != record.meta().resource_version {
            return Err(Self::conflict::<R>(&key));
        }

        *current.status_mut() = record.status().clone();
        let value = serde_json::to_vec(&current)?;
        let outcome = self
            .meta
            .compare_and_swap(
                &Self::key_for::<R>(&key),
                current.meta().resource_version,
                value,
            )
            .await?;
        if !outcome.succeeded {
            return Err(Self::conflict::<R>(&key));
        }
        current.meta_mut().resource_version = outcome.revision;
        Ok(current)
    }

    /// Request deletion. Records without finalizers are removed immediately;
    /// otherwise the deletion marker is set and removal waits for the
    /// finalizers to be cleared through [`ResourceStore::update`].
    pub async fn delete<R: Resource>(&self, key: &NamespacedName) -> Result<(), StoreError> {
        let mut current: R = self.get(key).await?;
        let store_key = Self::key_for::<R>(key);
        let expected = current.meta().resource_version;

        if current.meta().finalizers.is_empty() {
            let outcome = self.meta.compare_and_delete(&store_key, expected).await?;
            if !outcome.succeeded {
                return Err(Self::conflict::<R>(key));
            }
            return Ok(());
        }

        if current.meta().is_deleting() {
            return Ok(());
        }

        current.meta_mut().deletion_timestamp = Some(Utc::now());
        let value = serde_json::to_vec(&current)?;
        let outcome = self.meta.compare_and_swap(&store_key, expected, value).await?;
        if !outcome.succeeded {
            return Err(Self::conflict::<R>(key));
        }
        Ok(())
    }
}
