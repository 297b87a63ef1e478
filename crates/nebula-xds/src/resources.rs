use serde::{Deserialize, Serialize};

/// Total weight every traffic split is normalized to.
pub const TOTAL_WEIGHT: u32 = 100;

/// A pipeline route as handed to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteResource {
    pub pipeline: String,
    pub name: String,
    /// Weight exactly as last upserted.
    pub weight: u32,
    pub mirror: bool,
    /// Share of the pipeline's primary traffic, out of [`TOTAL_WEIGHT`].
    /// For mirror routes this is the mirrored percentage.
    pub traffic_percent: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeightedCluster {
    pub cluster: String,
    pub weight: u32,
    pub mirror: bool,
    pub shadow: bool,
}

/// Weighted distribution of a model's traffic over its clusters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficSplitResource {
    pub model: String,
    pub total_weight: u32,
    /// Primary clusters; weights sum to `total_weight` when non-empty.
    pub clusters: Vec<WeightedCluster>,
    /// Mirror and shadow copies; weights are percentages of duplicated traffic.
    pub mirrors: Vec<WeightedCluster>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterResource {
    pub name: String,
    pub http_protocol: String,
    pub grpc_protocol: String,
}

/// One unit of proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyResource {
    Route(RouteResource),
    TrafficSplit(TrafficSplitResource),
    Cluster(ClusterResource),
}

/// A complete configuration view, versioned by the cache write counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub version: u64,
    pub resources: Vec<ProxyResource>,
}
