use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::types::{CasOutcome, KvEntry, MetaStore, WatchEvent, WatchStream};

/// In-process backend with etcd-like revision semantics. TTLs are ignored.
#[derive(Debug, Clone)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn current_revision(&self, key: &str) -> u64 {
        self.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0)
    }

    fn write(&mut self, key: &str, value: Vec<u8>) -> WatchEvent {
        let rev = self.next_revision();
        self.kv.insert(key.to_string(), (value.clone(), rev));
        WatchEvent::Put(KvEntry {
            key: key.to_string(),
            value,
            revision: rev,
        })
    }

    fn remove(&mut self, key: &str) -> Option<WatchEvent> {
        self.kv.remove(key)?;
        let rev = self.next_revision();
        Some(WatchEvent::Delete {
            key: key.to_string(),
            revision: rev,
        })
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    /// Publish `event` to watchers. Callers hold the write lock so events
    /// go out in revision order.
    fn emit(&self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, _ttl_ms: Option<u64>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let event = inner.write(key, value);
        let rev = event.revision();
        self.emit(event);
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| KvEntry {
            key: key.to_string(),
            value: v.clone(),
            revision: *rev,
        }))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        if let Some(event) = inner.remove(key) {
            self.emit(event);
        }
        Ok(inner.revision)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| KvEntry {
                key: k.clone(),
                value: v.clone(),
                revision: *rev,
            })
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<CasOutcome> {
        let mut inner = self.inner.write().await;
        let current = inner.current_revision(key);
        if current != expected_revision {
            return Ok(CasOutcome {
                succeeded: false,
                revision: current,
            });
        }
        let event = inner.write(key, value);
        let rev = event.revision();
        self.emit(event);
        Ok(CasOutcome {
            succeeded: true,
            revision: rev,
        })
    }

    async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> Result<CasOutcome> {
        let mut inner = self.inner.write().await;
        let current = inner.current_revision(key);
        if current == 0 || current != expected_revision {
            return Ok(CasOutcome {
                succeeded: false,
                revision: current,
            });
        }
        let event = inner.remove(key);
        let rev = event.as_ref().map(|e| e.revision()).unwrap_or_default();
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(CasOutcome {
            succeeded: true,
            revision: rev,
        })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision_exclusive: Option<u64>) -> Result<WatchStream> {
        let prefix = prefix.to_string();
        let min_rev = start_revision_exclusive.unwrap_or(0);
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
            Ok(ev) if ev.revision() > min_rev && ev.key().starts_with(&prefix) => Some(ev),
            _ => None,
        });

        Ok(Box::pin(stream))
    }
}
