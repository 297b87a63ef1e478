//! In-process scheduler double for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nebula_common::{
    LoadPipelineRequest, PipelineStatusEvent, ServerNotifyRequest, ServerStatusEvent,
    SubscriptionRequest, UnloadPipelineRequest,
};
use nebula_meta::{
    CasOutcome, KvEntry, MemoryMetaStore, MetaEventRecorder, MetaStore, ResourceStore, WatchStream,
};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::connection::{ConnectionManager, Connector};
use crate::metrics::SyncMetrics;
use crate::retry::ConflictRetry;
use crate::scheduler::{PipelineStatusStream, SchedulerApi, SchedulerError, ServerStatusStream};
use crate::status::SyncContext;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Load(LoadPipelineRequest),
    Unload(UnloadPipelineRequest),
    Notify(ServerNotifyRequest),
    SubscribePipelines(String),
    SubscribeServers(String),
}

type PipelineTx = mpsc::UnboundedSender<Result<PipelineStatusEvent, SchedulerError>>;
type ServerTx = mpsc::UnboundedSender<Result<ServerStatusEvent, SchedulerError>>;

/// Records every command and serves subscriptions from test-controlled channels.
#[derive(Default)]
pub struct FakeScheduler {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<VecDeque<SchedulerError>>,
    pipeline_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<PipelineStatusEvent, SchedulerError>>>>,
    server_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<ServerStatusEvent, SchedulerError>>>>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<ServerNotifyRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Notify(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// The next command fails with `err`.
    pub fn fail_next(&self, err: SchedulerError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Events sent here are delivered to the next pipeline subscription.
    /// Dropping the sender ends that stream cleanly.
    pub fn pipeline_events(&self) -> PipelineTx {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.pipeline_rx.lock().unwrap() = Some(rx);
        tx
    }

    pub fn server_events(&self) -> ServerTx {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.server_rx.lock().unwrap() = Some(rx);
        tx
    }

    /// Poll until at least `n` calls were recorded or a second has passed.
    pub async fn wait_for_calls(&self, n: usize) -> Vec<Call> {
        for _ in 0..100 {
            let calls = self.calls();
            if calls.len() >= n {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.calls()
    }

    fn record(&self, call: Call) -> Result<(), SchedulerError> {
        self.calls.lock().unwrap().push(call);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SchedulerApi for FakeScheduler {
    async fn load_pipeline(&self, request: LoadPipelineRequest) -> Result<(), SchedulerError> {
        self.record(Call::Load(request))
    }

    async fn unload_pipeline(&self, request: UnloadPipelineRequest) -> Result<(), SchedulerError> {
        self.record(Call::Unload(request))
    }

    async fn server_notify(&self, request: ServerNotifyRequest) -> Result<(), SchedulerError> {
        self.record(Call::Notify(request))
    }

    async fn subscribe_pipeline_status(
        &self,
        request: SubscriptionRequest,
    ) -> Result<PipelineStatusStream, SchedulerError> {
        self.record(Call::SubscribePipelines(request.subscriber_name))?;
        let rx = self
            .pipeline_rx
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn subscribe_server_status(
        &self,
        request: SubscriptionRequest,
    ) -> Result<ServerStatusStream, SchedulerError> {
        self.record(Call::SubscribeServers(request.subscriber_name))?;
        let rx = self
            .server_rx
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// Hands out the same fake for every namespace, or fails when `down` is set.
pub struct FakeConnector {
    pub scheduler: Arc<FakeScheduler>,
    pub down: bool,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _namespace: &str) -> Result<Arc<dyn SchedulerApi>, SchedulerError> {
        if self.down {
            return Err(SchedulerError::Unavailable("connection refused".into()));
        }
        Ok(self.scheduler.clone())
    }
}

pub fn memory_store() -> ResourceStore {
    ResourceStore::new(Arc::new(MemoryMetaStore::new()))
}

pub fn connections(scheduler: Arc<FakeScheduler>) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(Arc::new(FakeConnector {
        scheduler,
        down: false,
    })))
}

/// Memory-backed context with events persisted next to the records.
pub fn sync_context() -> SyncContext {
    let store = memory_store();
    let recorder = Arc::new(MetaEventRecorder::new(store.meta().clone()));
    SyncContext::new(store, recorder, Arc::new(SyncMetrics::default())).with_conflict_retry(ConflictRetry {
        delay: Duration::from_millis(1),
        ..Default::default()
    })
}

/// Memory store that parks the `park_at`-th `get` (1-based) until
/// [`GatedMetaStore::release`] is called. Lets a test change the store
/// between a handler's reads.
pub struct GatedMetaStore {
    inner: Arc<dyn MetaStore>,
    gets: AtomicUsize,
    park_at: usize,
    parked: Notify,
    released: Notify,
}

impl GatedMetaStore {
    pub fn new(inner: Arc<dyn MetaStore>, park_at: usize) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
            park_at,
            parked: Notify::new(),
            released: Notify::new(),
        }
    }

    /// Resolves once the gated `get` is waiting.
    pub async fn wait_parked(&self) {
        self.parked.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl MetaStore for GatedMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> anyhow::Result<u64> {
        self.inner.put(key, value, ttl_ms).await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<KvEntry>> {
        if self.gets.fetch_add(1, Ordering::SeqCst) + 1 == self.park_at {
            self.parked.notify_one();
            self.released.notified().await;
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<u64> {
        self.inner.delete(key).await
    }

    async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<KvEntry>> {
        self.inner.list_prefix(prefix).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> anyhow::Result<CasOutcome> {
        self.inner.compare_and_swap(key, expected_revision, value).await
    }

    async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> anyhow::Result<CasOutcome> {
        self.inner.compare_and_delete(key, expected_revision).await
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> anyhow::Result<WatchStream> {
        self.inner.watch_prefix(prefix, start_revision_exclusive).await
    }
}

/// Context whose reads go through a [`GatedMetaStore`] parked at the
/// `park_at`-th `get`. The returned store bypasses the gate.
pub fn gated_sync_context(park_at: usize) -> (SyncContext, Arc<GatedMetaStore>, ResourceStore) {
    let inner: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
    let gate = Arc::new(GatedMetaStore::new(inner.clone(), park_at));
    let store = ResourceStore::new(gate.clone());
    let recorder = Arc::new(MetaEventRecorder::new(inner.clone()));
    let ctx = SyncContext::new(store, recorder, Arc::new(SyncMetrics::default())).with_conflict_retry(ConflictRetry {
        delay: Duration::from_millis(1),
        ..Default::default()
    });
    (ctx, gate, ResourceStore::new(inner))
}
