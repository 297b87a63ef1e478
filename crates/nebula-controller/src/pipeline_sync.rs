use std::sync::Arc;

use futures_util::StreamExt;
use nebula_common::scheduler::PipelineStatus as SchedulerPipelineStatus;
use nebula_common::{
    NamespacedName, Pipeline, PipelineStatusEvent, Resource, SubscriptionRequest, MODELS_READY,
    PIPELINE_FINALIZER, PIPELINE_READY,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::finalizer::{can_remove_pipeline_finalizer, remove_finalizer, FinalizerOutcome};
use crate::metrics::SyncMetrics;
use crate::retry::retry_on_conflict;
use crate::scheduler::{SchedulerApi, SchedulerError};
use crate::status::{EventOutcome, Fenced, SyncContext};

/// Reconciles scheduler pipeline status into the desired-state store.
#[derive(Clone)]
pub struct PipelineStatusSync {
    ctx: SyncContext,
    subscriber_name: String,
}

impl PipelineStatusSync {
    pub fn new(ctx: SyncContext, subscriber_name: impl Into<String>) -> Self {
        Self {
            ctx,
            subscriber_name: subscriber_name.into(),
        }
    }

    /// Subscribe and process events until the stream ends, fails or `cancel`
    /// fires. A clean end of stream and cancellation both return `Ok`.
    pub async fn run(
        &self,
        scheduler: Arc<dyn SchedulerApi>,
        namespace: &str,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        let mut stream = scheduler
            .subscribe_pipeline_status(SubscriptionRequest {
                subscriber_name: self.subscriber_name.clone(),
            })
            .await?;
        info!(%namespace, subscriber = %self.subscriber_name, "pipeline status stream open");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(%namespace, "pipeline status stream cancelled");
                    return Ok(());
                }
                next = stream.next() => next,
            };

            match next {
                None => {
                    info!(%namespace, "pipeline status stream closed");
                    return Ok(());
                }
                Some(Err(e)) => {
                    error!(%namespace, error = %e, "failed to receive pipeline event");
                    return Err(e);
                }
                Some(Ok(event)) => {
                    // An event still in flight is abandoned on shutdown.
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!(%namespace, "pipeline status stream cancelled");
                            return Ok(());
                        }
                        _ = self.handle_event(event) => {}
                    }
                }
            }
        }
    }

    pub async fn handle_event(&self, event: PipelineStatusEvent) -> EventOutcome {
        SyncMetrics::inc(&self.ctx.metrics.pipeline_events_total);

        if event.versions.len() != 1 {
            SyncMetrics::inc(&self.ctx.metrics.malformed_events_total);
            info!(
                pipeline = %event.pipeline_name,
                versions = event.versions.len(),
                "unexpected number of pipeline versions"
            );
            return EventOutcome::Malformed;
        }
        let version = &event.versions[0];
        let Some(meta) = version.pipeline.kubernetes_meta.as_ref() else {
            SyncMetrics::inc(&self.ctx.metrics.malformed_events_total);
            info!(pipeline = %event.pipeline_name, "pipeline event without desired-state metadata, ignoring");
            return EventOutcome::Malformed;
        };
        let state = version.state.status;
        info!(
            pipeline = %event.pipeline_name,
            generation = meta.generation,
            version = version.pipeline.version,
            state = %state,
            "received pipeline event"
        );

        let key = NamespacedName::new(meta.namespace.clone(), event.pipeline_name.clone());
        let pipeline: Pipeline = match self.ctx.store.get(&key).await {
            Ok(p) => p,
            Err(e) => {
                warn!(pipeline = %key, error = %e, "failed to get pipeline");
                return EventOutcome::Missing;
            }
        };

        if pipeline.meta().is_deleting() {
            info!(pipeline = %key, %state, "pipeline is pending deletion");
            if can_remove_pipeline_finalizer(state) {
                self.release_finalizer(&key).await;
            }
        }

        let result = retry_on_conflict(&self.ctx.conflict_retry, &self.ctx.cancel, || async {
            let mut latest: Pipeline = self.ctx.store.get(&key).await?;
            if latest.generation() != meta.generation {
                return Ok(Fenced::Stale {
                    current: latest.generation(),
                });
            }
            apply_pipeline_state(&mut latest, state, &version.state.reason, version.state.models_ready);
            self.ctx.write_status(&latest).await?;
            Ok(Fenced::Written)
        })
        .await;

        self.ctx
            .fenced_outcome(Pipeline::KIND, &key.name, meta.generation, result)
    }

    async fn release_finalizer(&self, key: &NamespacedName) {
        match remove_finalizer::<Pipeline>(&self.ctx, key, PIPELINE_FINALIZER).await {
            Ok(outcome @ (FinalizerOutcome::Removed | FinalizerOutcome::Stripped)) => {
                SyncMetrics::inc(&self.ctx.metrics.finalizers_removed_total);
                info!(pipeline = %key, ?outcome, "pipeline finalizer removed");
            }
            Ok(outcome) => debug!(pipeline = %key, ?outcome, "pipeline finalizer left as is"),
            Err(e) => error!(pipeline = %key, error = %e, "failed to remove finalizer after retries"),
        }
    }
}

/// Set the `Ready` and `ModelsReady` conditions from a scheduler state report.
pub fn apply_pipeline_state(
    pipeline: &mut Pipeline,
    state: SchedulerPipelineStatus,
    reason: &str,
    models_ready: bool,
) {
    let ready = state == SchedulerPipelineStatus::PipelineReady;
    pipeline
        .status
        .conditions
        .set(PIPELINE_READY, ready, reason, state.as_str());

    if models_ready {
        pipeline
            .status
            .conditions
            .set(MODELS_READY, true, "Models all available", "");
    } else {
        pipeline
            .status
            .conditions
            .set(MODELS_READY, false, "Some models are not available", "");
    }
}
