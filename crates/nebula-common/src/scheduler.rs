//! Wire types exchanged with the scheduler service.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pipeline::{PipelineOutput, PipelineStep};

/// Desired-state identity attached to objects the scheduler reports on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KubernetesMeta {
    pub namespace: String,
    pub generation: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerPipeline {
    pub name: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PipelineOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_meta: Option<KubernetesMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadPipelineRequest {
    pub pipeline: SchedulerPipeline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnloadPipelineRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerNotify {
    pub name: String,
    pub expected_replicas: i32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_meta: Option<KubernetesMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerNotifyRequest {
    pub servers: Vec<ServerNotify>,
    pub is_first_sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub subscriber_name: String,
}

/// Runtime state of one pipeline version as seen by the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PipelineStatus {
    PipelineCreate,
    PipelineCreating,
    PipelineReady,
    PipelineFailed,
    PipelineTerminate,
    PipelineTerminating,
    PipelineTerminated,
    PipelineFailedTerminating,
    PipelineRebalancing,
    #[serde(rename = "PipelineStatusUnknown", other)]
    Unknown,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::PipelineCreate => "PipelineCreate",
            PipelineStatus::PipelineCreating => "PipelineCreating",
            PipelineStatus::PipelineReady => "PipelineReady",
            PipelineStatus::PipelineFailed => "PipelineFailed",
            PipelineStatus::PipelineTerminate => "PipelineTerminate",
            PipelineStatus::PipelineTerminating => "PipelineTerminating",
            PipelineStatus::PipelineTerminated => "PipelineTerminated",
            PipelineStatus::PipelineFailedTerminating => "PipelineFailedTerminating",
            PipelineStatus::PipelineRebalancing => "PipelineRebalancing",
            PipelineStatus::Unknown => "PipelineStatusUnknown",
        }
    }

    /// The scheduler is still tearing the pipeline down.
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            PipelineStatus::PipelineTerminate | PipelineStatus::PipelineTerminating
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineVersionState {
    pub status: PipelineStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub models_ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineWithState {
    pub pipeline: SchedulerPipeline,
    pub state: PipelineVersionState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStatusEvent {
    pub pipeline_name: String,
    #[serde(default)]
    pub versions: Vec<PipelineWithState>,
}

/// What a server status event asks the controller to do.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServerEventKind {
    /// Authoritative replica/connection report.
    #[default]
    StatusUpdate,
    /// The scheduler wants the declared replica count changed.
    ScalingRequest,
    /// Sent while the scheduler is still discovering replicas; counts are not trustworthy.
    NonAuthoritativeReplicaInfo,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerStatusEvent {
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_meta: Option<KubernetesMeta>,
    #[serde(default)]
    pub expected_replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
    #[serde(default)]
    pub num_loaded_model_replicas: i32,
    #[serde(default)]
    pub event_type: ServerEventKind,
}
