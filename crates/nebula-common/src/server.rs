use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::Conditions;
use crate::resource::{ObjectMeta, Resource};

pub const CONTROL_PLANE_CONNECTIONS_READY: &str = "ControlPlaneConnectionsReady";

/// How many of a server's replicas hold a connection to the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ReplicaConnectionStatus {
    NoReplicasConnected,
    AllReplicasConnected,
    SomeReplicasConnected,
}

impl ReplicaConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaConnectionStatus::NoReplicasConnected => "NoReplicasConnected",
            ReplicaConnectionStatus::AllReplicasConnected => "AllReplicasConnected",
            ReplicaConnectionStatus::SomeReplicasConnected => "SomeReplicasConnected",
        }
    }
}

impl fmt::Display for ReplicaConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSpec {
    /// `None` means "use the default" (1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    /// Name of the server configuration template (e.g. "mlserver", "triton").
    #[serde(default)]
    pub server_config: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerStatus {
    /// Replicas currently declared by the workload backing this server.
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub loaded_model_replicas: i32,
    #[serde(default)]
    pub replicas_connected_to_control_plane: i32,
    #[serde(default)]
    pub conditions: Conditions,
}

/// A pool of inference server replicas. Stored under `/resources/Server/{namespace}/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServerSpec,
    #[serde(default)]
    pub status: ServerStatus,
}

impl Server {
    pub fn new(namespace: &str, name: &str, spec: ServerSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: ServerStatus::default(),
        }
    }

    /// Replica count reported to the scheduler. Zero while deletion is pending.
    pub fn expected_replicas(&self) -> i32 {
        if self.metadata.is_deleting() {
            0
        } else {
            self.spec.replicas.unwrap_or(1)
        }
    }

    /// Validated scaling triple. All zeros while deletion is pending, which the
    /// scheduler reads as "drain to zero".
    pub fn scaling_spec(&self) -> Result<ScalingSpec, ScalingSpecError> {
        if self.metadata.is_deleting() {
            return Ok(ScalingSpec::default());
        }
        ScalingSpec::validate(
            self.spec.replicas,
            self.spec.min_replicas,
            self.spec.max_replicas,
        )
    }
}

impl Resource for Server {
    const KIND: &'static str = "Server";

    type Spec = ServerSpec;
    type Status = ServerStatus;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    fn status(&self) -> &ServerStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut ServerStatus {
        &mut self.status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScalingSpecError {
    #[error("number of replicas {replicas} must be <= max replicas {max}")]
    ReplicasAboveMax { replicas: u32, max: u32 },
    #[error("min replicas {min} must be <= max replicas {max}")]
    MinAboveMax { min: u32, max: u32 },
}

/// Replica bounds after defaulting and validation. A zero min/max means "unbounded".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScalingSpec {
    pub replicas: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
}

impl ScalingSpec {
    pub fn validate(
        replicas: Option<i32>,
        min_replicas: Option<i32>,
        max_replicas: Option<i32>,
    ) -> Result<Self, ScalingSpecError> {
        let positive = |v: Option<i32>| v.filter(|n| *n > 0).map(|n| n as u32);

        let mut replicas = positive(replicas).unwrap_or(1);
        let min = positive(min_replicas).unwrap_or(0);
        if replicas < min {
            replicas = min;
        }
        let max = positive(max_replicas).unwrap_or(0);

        if max > 0 {
            if min > max {
                return Err(ScalingSpecError::MinAboveMax { min, max });
            }
            if replicas > max {
                return Err(ScalingSpecError::ReplicasAboveMax { replicas, max });
            }
        }

        Ok(Self {
            replicas,
            min_replicas: min,
            max_replicas: max,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn server(replicas: Option<i32>, min: Option<i32>, max: Option<i32>) -> Server {
        Server::new(
            "ns",
            "mlserver",
            ServerSpec {
                replicas,
                min_replicas: min,
                max_replicas: max,
                server_config: "mlserver".to_string(),
            },
        )
    }

    #[test]
    fn test_scaling_spec_defaults() {
        let s = ScalingSpec::validate(None, None, None).unwrap();
        assert_eq!(
            s,
            ScalingSpec {
                replicas: 1,
                min_replicas: 0,
                max_replicas: 0
            }
        );
    }

    #[test]
    fn test_scaling_spec_min_lifts_replicas() {
        let s = ScalingSpec::validate(Some(1), Some(3), Some(5)).unwrap();
        assert_eq!(s.replicas, 3);
        assert_eq!(s.min_replicas, 3);
        assert_eq!(s.max_replicas, 5);
    }

    #[test]
    fn test_scaling_spec_rejects_bad_bounds() {
        assert_eq!(
            ScalingSpec::validate(Some(6), None, Some(5)),
            Err(ScalingSpecError::ReplicasAboveMax { replicas: 6, max: 5 })
        );
        assert_eq!(
            ScalingSpec::validate(Some(1), Some(4), Some(2)),
            Err(ScalingSpecError::MinAboveMax { min: 4, max: 2 })
        );
    }

    #[test]
    fn test_expected_replicas() {
        assert_eq!(server(None, None, None).expected_replicas(), 1);
        assert_eq!(server(Some(4), None, None).expected_replicas(), 4);
    }

    #[test]
    fn test_deleting_server_drains_to_zero() {
        let mut s = server(Some(4), Some(2), Some(8));
        s.metadata.deletion_timestamp = Some(Utc::now());
        assert_eq!(s.expected_replicas(), 0);
        assert_eq!(s.scaling_spec().unwrap(), ScalingSpec::default());

        // Even an invalid spec drains cleanly.
        let mut bad = server(Some(9), None, Some(2));
        bad.metadata.deletion_timestamp = Some(Utc::now());
        assert_eq!(bad.scaling_spec().unwrap(), ScalingSpec::default());
    }
}
