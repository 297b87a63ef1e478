pub mod condition;
pub mod pipeline;
pub mod resource;
pub mod scheduler;
pub mod server;
pub mod telemetry;

pub use condition::{Condition, Conditions};
pub use pipeline::{
    Pipeline, PipelineOutput, PipelineSpec, PipelineStatus, PipelineStep, MODELS_READY,
    PIPELINE_FINALIZER, PIPELINE_READY,
};
pub use resource::{NamespacedName, ObjectMeta, Resource};
pub use scheduler::{
    KubernetesMeta, LoadPipelineRequest, PipelineStatusEvent, PipelineVersionState,
    PipelineWithState, SchedulerPipeline, ServerEventKind, ServerNotify, ServerNotifyRequest,
    ServerStatusEvent, SubscriptionRequest, UnloadPipelineRequest,
};
pub use server::{
    ReplicaConnectionStatus, ScalingSpec, ScalingSpecError, Server, ServerSpec, ServerStatus,
    CONTROL_PLANE_CONNECTIONS_READY,
};
