use nebula_common::scheduler::PipelineStatus;
use nebula_common::{NamespacedName, Resource};
use nebula_meta::{StoreError, UpdateOutcome};

use crate::retry::retry_on_conflict;
use crate::status::SyncContext;

/// Whether a pipeline pending deletion may lose its finalizer given the
/// scheduler's latest state for it.
///
/// Only the two "still terminating" states hold the finalizer back. Any other
/// state, including ready or failed, releases it: short-lived pipelines are
/// not always reported as terminated.
pub fn can_remove_pipeline_finalizer(state: PipelineStatus) -> bool {
    !state.is_terminating()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerOutcome {
    /// Token stripped; other finalizers keep the record alive.
    Stripped,
    /// Token stripped and the record was physically removed.
    Removed,
    /// Deletion is no longer pending, nothing was changed.
    NotDeleting,
    /// The token was already gone.
    Absent,
    /// The record no longer exists.
    Gone,
}

/// Strip `token` from a record pending deletion.
///
/// Each attempt re-reads the record and re-checks that deletion is still
/// pending, so a concurrent un-delete is never overridden.
pub async fn remove_finalizer<R: Resource>(
    ctx: &SyncContext,
    key: &NamespacedName,
    token: &str,
) -> Result<FinalizerOutcome, StoreError> {
    let result = retry_on_conflict(&ctx.conflict_retry, &ctx.cancel, || async {
        let mut latest: R = ctx.store.get(key).await?;
        if !latest.meta().is_deleting() {
            return Ok(FinalizerOutcome::NotDeleting);
        }
        if !latest.meta_mut().remove_finalizer(token) {
            return Ok(FinalizerOutcome::Absent);
        }
        match ctx.store.update(latest).await? {
            UpdateOutcome::Updated(_) => Ok(FinalizerOutcome::Stripped),
            UpdateOutcome::Removed => Ok(FinalizerOutcome::Removed),
        }
    })
    .await;

    match result {
        Err(e) if e.is_not_found() => Ok(FinalizerOutcome::Gone),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use nebula_common::{Pipeline, PipelineSpec, PIPELINE_FINALIZER};

    use super::*;
    use crate::testing::sync_context;

    async fn pending_delete(ctx: &SyncContext, finalizers: &[&str]) -> Pipeline {
        let mut p = Pipeline::new("ns", "p1", PipelineSpec::default());
        for f in finalizers {
            p.metadata.add_finalizer(f);
        }
        let p = ctx.store.create(p).await.unwrap();
        ctx.store.delete::<Pipeline>(&p.key()).await.unwrap();
        ctx.store.get(&p.key()).await.unwrap()
    }

    #[test]
    fn test_only_terminating_states_block() {
        use PipelineStatus::*;
        for s in [PipelineTerminate, PipelineTerminating] {
            assert!(!can_remove_pipeline_finalizer(s));
        }
        for s in [
            PipelineCreate,
            PipelineCreating,
            PipelineReady,
            PipelineFailed,
            PipelineTerminated,
            PipelineFailedTerminating,
            PipelineRebalancing,
            Unknown,
        ] {
            assert!(can_remove_pipeline_finalizer(s));
        }
    }

    #[tokio::test]
    async fn test_last_finalizer_removes_record() {
        let ctx = sync_context();
        let p = pending_delete(&ctx, &[PIPELINE_FINALIZER]).await;

        let outcome = remove_finalizer::<Pipeline>(&ctx, &p.key(), PIPELINE_FINALIZER)
            .await
            .unwrap();
        assert_eq!(outcome, FinalizerOutcome::Removed);
        assert!(ctx.store.get::<Pipeline>(&p.key()).await.unwrap_err().is_not_found());

        let again = remove_finalizer::<Pipeline>(&ctx, &p.key(), PIPELINE_FINALIZER)
            .await
            .unwrap();
        assert_eq!(again, FinalizerOutcome::Gone);
    }

    #[tokio::test]
    async fn test_other_finalizers_keep_record() {
        let ctx = sync_context();
        let p = pending_delete(&ctx, &[PIPELINE_FINALIZER, "other"]).await;

        let outcome = remove_finalizer::<Pipeline>(&ctx, &p.key(), PIPELINE_FINALIZER)
            .await
            .unwrap();
        assert_eq!(outcome, FinalizerOutcome::Stripped);

        let left: Pipeline = ctx.store.get(&p.key()).await.unwrap();
        assert_eq!(left.metadata.finalizers, vec!["other".to_string()]);
        assert!(left.metadata.is_deleting());

        let outcome = remove_finalizer::<Pipeline>(&ctx, &p.key(), PIPELINE_FINALIZER)
            .await
            .unwrap();
        assert_eq!(outcome, FinalizerOutcome::Absent);
    }

    #[tokio::test]
    async fn test_not_deleting_is_untouched() {
        let ctx = sync_context();
        let mut p = Pipeline::new("ns", "p1", PipelineSpec::default());
        p.metadata.add_finalizer(PIPELINE_FINALIZER);
        let p = ctx.store.create(p).await.unwrap();

        let outcome = remove_finalizer::<Pipeline>(&ctx, &p.key(), PIPELINE_FINALIZER)
            .await
            .unwrap();
        assert_eq!(outcome, FinalizerOutcome::NotDeleting);
        let still: Pipeline = ctx.store.get(&p.key()).await.unwrap();
        assert!(still.metadata.has_finalizer(PIPELINE_FINALIZER));
    }
}
