use std::sync::Arc;

use nebula_common::Resource;
use nebula_meta::{Event, EventRecorder, ResourceStore, StoreError};
use tokio_util::sync::CancellationToken;

use crate::metrics::SyncMetrics;
use crate::retry::ConflictRetry;

/// Collaborators shared by every reconciliation path.
#[derive(Clone)]
pub struct SyncContext {
    pub store: ResourceStore,
    pub recorder: Arc<dyn EventRecorder>,
    pub metrics: Arc<SyncMetrics>,
    pub conflict_retry: ConflictRetry,
    /// Fired on shutdown; conflict retries stop waiting once it is.
    pub cancel: CancellationToken,
}

impl SyncContext {
    pub fn new(store: ResourceStore, recorder: Arc<dyn EventRecorder>, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            store,
            recorder,
            metrics,
            conflict_retry: ConflictRetry::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_conflict_retry(mut self, conflict_retry: ConflictRetry) -> Self {
        self.conflict_retry = conflict_retry;
        self
    }

    /// Status-only write. A failure is counted and reported as a warning
    /// event on the record before being returned.
    pub async fn write_status<R: Resource>(&self, record: &R) -> Result<R, StoreError> {
        match self.store.update_status(record).await {
            Ok(written) => {
                SyncMetrics::inc(&self.metrics.status_writes_total);
                Ok(written)
            }
            Err(e) => {
                SyncMetrics::inc(&self.metrics.status_write_failures_total);
                let message = format!(
                    "Failed to update status for {} {:?}: {e}",
                    R::KIND,
                    record.name()
                );
                self.recorder
                    .record(Event::warning(record, "UpdateFailed", message))
                    .await;
                Err(e)
            }
        }
    }
}

/// What handling one status event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Required fields were missing.
    Malformed,
    /// The record could not be read.
    Missing,
    /// Event generation differs from the record's.
    Stale,
    /// Nothing to do for this event.
    Ignored,
    /// Status (or spec, for scaling requests) was written.
    Updated,
    /// The record disappeared while handling the event.
    Gone,
    /// A write failed after retries.
    Failed,
}

/// Inner result of a fenced write inside a conflict-retry closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fenced {
    Stale { current: i64 },
    Written,
}

impl SyncContext {
    /// Fold the result of a fenced write into an [`EventOutcome`], logging
    /// the non-happy paths.
    pub(crate) fn fenced_outcome(
        &self,
        kind: &'static str,
        name: &str,
        event_generation: i64,
        result: Result<Fenced, StoreError>,
    ) -> EventOutcome {
        match result {
            Ok(Fenced::Written) => EventOutcome::Updated,
            Ok(Fenced::Stale { current }) => {
                SyncMetrics::inc(&self.metrics.stale_events_total);
                tracing::info!(
                    kind,
                    name,
                    current_generation = current,
                    event_generation,
                    "ignoring event for old generation"
                );
                EventOutcome::Stale
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(kind, name, "record removed before status could be written");
                EventOutcome::Gone
            }
            Err(e) => {
                tracing::error!(kind, name, error=%e, "failed to update status");
                EventOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use nebula_common::{Pipeline, PipelineSpec, PIPELINE_READY};
    use nebula_meta::EventType;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::memory_store;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventRecorder for Collect {
        async fn record(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_failed_write_emits_warning() {
        let recorder = Arc::new(Collect::default());
        let ctx = SyncContext::new(memory_store(), recorder.clone(), Arc::new(SyncMetrics::default()));
        let p = ctx
            .store
            .create(Pipeline::new("ns", "p1", PipelineSpec::default()))
            .await
            .unwrap();

        let mut fresh = p.clone();
        fresh.status.conditions.set(PIPELINE_READY, true, "", "PipelineReady");
        ctx.write_status(&fresh).await.unwrap();

        let err = ctx.write_status(&p).await.unwrap_err();
        assert!(err.is_conflict());

        let events = recorder.0.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Warning);
        assert_eq!(events[0].reason, "UpdateFailed");
        assert_eq!(events[0].name, "p1");
        assert_eq!(ctx.metrics.status_writes_total.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.metrics.status_write_failures_total.load(Ordering::Relaxed), 1);
    }
}
