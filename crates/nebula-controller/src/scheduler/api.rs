use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use nebula_common::{
    LoadPipelineRequest, PipelineStatusEvent, ServerNotifyRequest, ServerStatusEvent,
    SubscriptionRequest, UnloadPipelineRequest,
};

use super::SchedulerError;

/// Pipeline status events in arrival order. The stream ending is a clean close.
pub type PipelineStatusStream =
    Pin<Box<dyn Stream<Item = Result<PipelineStatusEvent, SchedulerError>> + Send>>;

/// Server status events in arrival order. The stream ending is a clean close.
pub type ServerStatusStream =
    Pin<Box<dyn Stream<Item = Result<ServerStatusEvent, SchedulerError>> + Send>>;

/// The scheduler's command and subscription surface for one namespace.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    async fn load_pipeline(&self, request: LoadPipelineRequest) -> Result<(), SchedulerError>;

    async fn unload_pipeline(&self, request: UnloadPipelineRequest) -> Result<(), SchedulerError>;

    async fn server_notify(&self, request: ServerNotifyRequest) -> Result<(), SchedulerError>;

    async fn subscribe_pipeline_status(
        &self,
        request: SubscriptionRequest,
    ) -> Result<PipelineStatusStream, SchedulerError>;

    async fn subscribe_server_status(
        &self,
        request: SubscriptionRequest,
    ) -> Result<ServerStatusStream, SchedulerError>;
}
