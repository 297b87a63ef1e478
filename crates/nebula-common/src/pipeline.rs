use serde::{Deserialize, Serialize};

use crate::condition::Conditions;
use crate::resource::{ObjectMeta, Resource};
use crate::scheduler::{KubernetesMeta, SchedulerPipeline};

/// Finalizer token that blocks physical removal until the scheduler has unloaded the pipeline.
pub const PIPELINE_FINALIZER: &str = "nebula.io/pipeline-finalizer";

pub const PIPELINE_READY: &str = "Ready";
pub const MODELS_READY: &str = "ModelsReady";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineOutput {
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineSpec {
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PipelineOutput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStatus {
    #[serde(default)]
    pub conditions: Conditions,
}

/// A chain of model steps. Stored under `/resources/Pipeline/{namespace}/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PipelineSpec,
    #[serde(default)]
    pub status: PipelineStatus,
}

impl Pipeline {
    pub fn new(namespace: &str, name: &str, spec: PipelineSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: PipelineStatus::default(),
        }
    }

    /// The form the scheduler expects in a load request.
    pub fn as_scheduler_pipeline(&self) -> SchedulerPipeline {
        SchedulerPipeline {
            name: self.metadata.name.clone(),
            version: 0,
            steps: self.spec.steps.clone(),
            output: self.spec.output.clone(),
            kubernetes_meta: Some(KubernetesMeta {
                namespace: self.metadata.namespace.clone(),
                generation: self.metadata.generation,
            }),
        }
    }
}

impl Resource for Pipeline {
    const KIND: &'static str = "Pipeline";

    type Spec = PipelineSpec;
    type Status = PipelineStatus;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    fn status(&self) -> &PipelineStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut PipelineStatus {
        &mut self.status
    }
}
