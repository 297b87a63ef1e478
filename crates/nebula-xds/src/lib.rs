use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

pub mod resources;

pub use resources::{
    ClusterResource, ProxyResource, RouteResource, RouteSnapshot, TrafficSplitResource,
    WeightedCluster, TOTAL_WEIGHT,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteCacheError {
    #[error("cluster {cluster} of model {model}: weight basis must be > 0")]
    ZeroWeightBasis { model: String, cluster: String },
    #[error("cluster {cluster} of model {model}: traffic weight {weight} exceeds basis {basis}")]
    WeightExceedsBasis {
        model: String,
        cluster: String,
        weight: u32,
        basis: u32,
    },
    #[error("mirror route {route} of pipeline {pipeline}: weight {weight} exceeds {TOTAL_WEIGHT}")]
    MirrorWeightExceedsTotal {
        pipeline: String,
        route: String,
        weight: u32,
    },
    #[error("cluster {cluster}: protocols {http_protocol}/{grpc_protocol} conflict with model {existing_model}")]
    ClusterProtocolMismatch {
        cluster: String,
        existing_model: String,
        http_protocol: String,
        grpc_protocol: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub weight: u32,
    pub mirror: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTrafficEntry {
    pub traffic_weight: u32,
    pub weight_basis: u32,
    pub http_protocol: String,
    pub grpc_protocol: String,
    pub mirror: bool,
    pub shadow: bool,
}

impl ClusterTrafficEntry {
    fn percent(&self) -> f64 {
        f64::from(self.traffic_weight) * f64::from(TOTAL_WEIGHT) / f64::from(self.weight_basis)
    }
}

#[derive(Debug, Default)]
struct RouteTables {
    version: u64,
    /// (pipeline, route) → entry
    routes: BTreeMap<(String, String), RouteEntry>,
    /// (model, cluster) → entry
    traffic: BTreeMap<(String, String), ClusterTrafficEntry>,
}

/// Routes and traffic splits for the proxy data plane.
///
/// Both tables sit behind one lock: a snapshot is computed from a single
/// consistent view and always reflects every upsert that completed before it.
#[derive(Debug, Default)]
pub struct RouteCache {
    tables: RwLock<RouteTables>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RouteTables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RouteTables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the route `(pipeline, route)`.
    ///
    /// Primary route weights are relative to each other. A mirror route's
    /// weight is the percentage of traffic copied to it, so it may not exceed
    /// [`TOTAL_WEIGHT`].
    pub fn add_pipeline_route(
        &self,
        pipeline: &str,
        route: &str,
        weight: u32,
        mirror: bool,
    ) -> Result<(), RouteCacheError> {
        if mirror && weight > TOTAL_WEIGHT {
            return Err(RouteCacheError::MirrorWeightExceedsTotal {
                pipeline: pipeline.to_string(),
                route: route.to_string(),
                weight,
            });
        }
        let mut tables = self.write();
        tables.routes.insert(
            (pipeline.to_string(), route.to_string()),
            RouteEntry { weight, mirror },
        );
        tables.version += 1;
        tracing::debug!(pipeline, route, weight, mirror, "pipeline route upserted");
        Ok(())
    }

    /// Insert or replace the traffic entry `(model, cluster)`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_route_cluster_traffic(
        &self,
        model: &str,
        cluster: &str,
        traffic_weight: u32,
        weight_basis: u32,
        http_protocol: &str,
        grpc_protocol: &str,
        mirror: bool,
        shadow: bool,
    ) -> Result<(), RouteCacheError> {
        if weight_basis == 0 {
            return Err(RouteCacheError::ZeroWeightBasis {
                model: model.to_string(),
                cluster: cluster.to_string(),
            });
        }
        if traffic_weight > weight_basis {
            return Err(RouteCacheError::WeightExceedsBasis {
                model: model.to_string(),
                cluster: cluster.to_string(),
                weight: traffic_weight,
                basis: weight_basis,
            });
        }

        let mut tables = self.write();
        // Cluster definitions are shared by name, so every model using a
        // cluster must agree on its protocols.
        let conflict = tables.traffic.iter().find(|((m, c), e)| {
            c == cluster
                && m != model
                && (e.http_protocol != http_protocol || e.grpc_protocol != grpc_protocol)
        });
        if let Some(((existing_model, _), _)) = conflict {
            return Err(RouteCacheError::ClusterProtocolMismatch {
                cluster: cluster.to_string(),
                existing_model: existing_model.clone(),
                http_protocol: http_protocol.to_string(),
                grpc_protocol: grpc_protocol.to_string(),
            });
        }
        tables.traffic.insert(
            (model.to_string(), cluster.to_string()),
            ClusterTrafficEntry {
                traffic_weight,
                weight_basis,
                http_protocol: http_protocol.to_string(),
                grpc_protocol: grpc_protocol.to_string(),
                mirror,
                shadow,
            },
        );
        tables.version += 1;
        tracing::debug!(model, cluster, traffic_weight, weight_basis, mirror, shadow, "cluster traffic upserted");
        Ok(())
    }

    pub fn remove_pipeline_route(&self, pipeline: &str, route: &str) -> bool {
        let mut tables = self.write();
        let removed = tables
            .routes
            .remove(&(pipeline.to_string(), route.to_string()))
            .is_some();
        if removed {
            tables.version += 1;
        }
        removed
    }

    /// Drop every route owned by `pipeline`. Returns how many were removed.
    pub fn remove_pipeline(&self, pipeline: &str) -> usize {
        let mut tables = self.write();
        let before = tables.routes.len();
        tables.routes.retain(|(p, _), _| p != pipeline);
        let removed = before - tables.routes.len();
        if removed > 0 {
            tables.version += 1;
        }
        removed
    }

    /// Drop every traffic entry owned by `model`. Returns how many were removed.
    pub fn remove_model_traffic(&self, model: &str) -> usize {
        let mut tables = self.write();
        let before = tables.traffic.len();
        tables.traffic.retain(|(m, _), _| m != model);
        let removed = before - tables.traffic.len();
        if removed > 0 {
            tables.version += 1;
        }
        removed
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    /// Every known route, traffic split and cluster, in a stable order.
    pub fn route_contents(&self) -> Vec<ProxyResource> {
        build_resources(&self.read())
    }

    pub fn snapshot(&self) -> RouteSnapshot {
        let tables = self.read();
        RouteSnapshot {
            version: tables.version,
            resources: build_resources(&tables),
        }
    }
}

fn build_resources(tables: &RouteTables) -> Vec<ProxyResource> {
    let mut out = Vec::with_capacity(tables.routes.len() + 2 * tables.traffic.len());

    // Routes, grouped by pipeline (BTreeMap keeps them contiguous and sorted).
    let mut by_pipeline: BTreeMap<&str, Vec<(&str, &RouteEntry)>> = BTreeMap::new();
    for ((pipeline, route), entry) in &tables.routes {
        by_pipeline
            .entry(pipeline.as_str())
            .or_default()
            .push((route.as_str(), entry));
    }
    for (pipeline, routes) in by_pipeline {
        let primaries: Vec<f64> = routes
            .iter()
            .filter(|(_, e)| !e.mirror)
            .map(|(_, e)| f64::from(e.weight))
            .collect();
        let mut shares = normalize(&primaries).into_iter();
        for (route, entry) in routes {
            let traffic_percent = if entry.mirror {
                entry.weight
            } else {
                shares.next().unwrap_or(0)
            };
            out.push(ProxyResource::Route(RouteResource {
                pipeline: pipeline.to_string(),
                name: route.to_string(),
                weight: entry.weight,
                mirror: entry.mirror,
                traffic_percent,
            }));
        }
    }

    // Traffic splits per model.
    let mut by_model: BTreeMap<&str, Vec<(&str, &ClusterTrafficEntry)>> = BTreeMap::new();
    for ((model, cluster), entry) in &tables.traffic {
        by_model
            .entry(model.as_str())
            .or_default()
            .push((cluster.as_str(), entry));
    }
    for (model, entries) in by_model {
        let (copies, primaries): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|(_, e)| e.mirror || e.shadow);

        let weights = normalize(&primaries.iter().map(|(_, e)| e.percent()).collect::<Vec<_>>());
        let clusters = primaries
            .iter()
            .zip(weights)
            .map(|((cluster, _), weight)| WeightedCluster {
                cluster: cluster.to_string(),
                weight,
                mirror: false,
                shadow: false,
            })
            .collect();
        let mirrors = copies
            .iter()
            .map(|(cluster, e)| WeightedCluster {
                cluster: cluster.to_string(),
                weight: e.percent().round() as u32,
                mirror: e.mirror,
                shadow: e.shadow,
            })
            .collect();

        out.push(ProxyResource::TrafficSplit(TrafficSplitResource {
            model: model.to_string(),
            total_weight: TOTAL_WEIGHT,
            clusters,
            mirrors,
        }));
    }

    // Cluster definitions, one per cluster name. Writers keep protocols
    // consistent across models sharing a name.
    let mut clusters: BTreeMap<&str, ClusterResource> = BTreeMap::new();
    for ((_, cluster), entry) in &tables.traffic {
        clusters
            .entry(cluster.as_str())
            .or_insert_with(|| ClusterResource {
                name: cluster.clone(),
                http_protocol: entry.http_protocol.clone(),
                grpc_protocol: entry.grpc_protocol.clone(),
            });
    }
    out.extend(clusters.into_values().map(ProxyResource::Cluster));

    out
}

/// Scale `shares` to integers summing to [`TOTAL_WEIGHT`] (largest remainder).
/// All-zero shares are split evenly. Empty input stays empty.
fn normalize(shares: &[f64]) -> Vec<u32> {
    if shares.is_empty() {
        return Vec::new();
    }
    let sum: f64 = shares.iter().sum();
    let exact: Vec<f64> = if sum <= 0.0 {
        vec![f64::from(TOTAL_WEIGHT) / shares.len() as f64; shares.len()]
    } else {
        shares
            .iter()
            .map(|s| s * f64::from(TOTAL_WEIGHT) / sum)
            .collect()
    };

    let mut out: Vec<u32> = exact.iter().map(|e| e.floor() as u32).collect();
    let assigned: u32 = out.iter().sum();
    let mut order: Vec<usize> = (0..exact.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    for &i in order.iter().take(TOTAL_WEIGHT.saturating_sub(assigned) as usize) {
        out[i] += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn routes(resources: &[ProxyResource]) -> Vec<&RouteResource> {
        resources
            .iter()
            .filter_map(|r| match r {
                ProxyResource::Route(route) => Some(route),
                _ => None,
            })
            .collect()
    }

    fn split<'a>(resources: &'a [ProxyResource], model: &str) -> &'a TrafficSplitResource {
        resources
            .iter()
            .find_map(|r| match r {
                ProxyResource::TrafficSplit(s) if s.model == model => Some(s),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_later_upsert_replaces_route() {
        let cache = RouteCache::new();
        cache.add_pipeline_route("p1", "r1", 100, false).unwrap();
        cache.add_pipeline_route("p1", "r1", 50, true).unwrap();

        let contents = cache.route_contents();
        let r = routes(&contents);
        assert_eq!(r.len(), 1);
        assert_eq!(r[0].pipeline, "p1");
        assert_eq!(r[0].name, "r1");
        assert_eq!(r[0].weight, 50);
        assert!(r[0].mirror);
    }

    #[test]
    fn test_route_contents_idempotent() {
        let cache = RouteCache::new();
        cache.add_pipeline_route("p2", "r1", 30, false).unwrap();
        cache.add_pipeline_route("p1", "r1", 70, false).unwrap();
        cache
            .add_route_cluster_traffic("iris", "iris_1", 1, 3, "http", "grpc", false, false)
            .unwrap();

        let first = cache.route_contents();
        let second = cache.route_contents();
        assert_eq!(first, second);
        assert_eq!(cache.snapshot().version, cache.snapshot().version);
    }

    #[test]
    fn test_contents_ordering() {
        let cache = RouteCache::new();
        cache.add_pipeline_route("p2", "a", 1, false).unwrap();
        cache.add_pipeline_route("p1", "b", 1, false).unwrap();
        cache
            .add_route_cluster_traffic("m2", "c2", 100, 100, "http", "grpc", false, false)
            .unwrap();
        cache
            .add_route_cluster_traffic("m1", "c1", 100, 100, "http", "grpc", false, false)
            .unwrap();

        let contents = cache.route_contents();
        let kinds: Vec<String> = contents
            .iter()
            .map(|r| match r {
                ProxyResource::Route(r) => format!("route:{}/{}", r.pipeline, r.name),
                ProxyResource::TrafficSplit(s) => format!("split:{}", s.model),
                ProxyResource::Cluster(c) => format!("cluster:{}", c.name),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "route:p1/b",
                "route:p2/a",
                "split:m1",
                "split:m2",
                "cluster:c1",
                "cluster:c2"
            ]
        );
    }

    #[test]
    fn test_primary_split_sums_to_total() {
        let cache = RouteCache::new();
        for (cluster, w) in [("a", 1), ("b", 1), ("c", 1)] {
            cache
                .add_route_cluster_traffic("iris", cluster, w, 3, "http", "grpc", false, false)
                .unwrap();
        }
        cache
            .add_route_cluster_traffic("iris", "shadow", 50, 100, "http", "grpc", false, true)
            .unwrap();

        let contents = cache.route_contents();
        let s = split(&contents, "iris");
        assert_eq!(s.clusters.len(), 3);
        assert_eq!(s.clusters.iter().map(|c| c.weight).sum::<u32>(), TOTAL_WEIGHT);
        assert_eq!(s.mirrors.len(), 1);
        assert!(s.mirrors[0].shadow);
        assert_eq!(s.mirrors[0].weight, 50);
    }

    #[test]
    fn test_partial_split_is_normalized() {
        let cache = RouteCache::new();
        cache
            .add_route_cluster_traffic("iris", "v1", 30, 100, "http", "grpc", false, false)
            .unwrap();
        cache
            .add_route_cluster_traffic("iris", "v2", 30, 100, "http", "grpc", false, false)
            .unwrap();

        let contents = cache.route_contents();
        let weights: Vec<u32> = split(&contents, "iris").clusters.iter().map(|c| c.weight).collect();
        assert_eq!(weights, vec![50, 50]);
    }

    #[test]
    fn test_route_traffic_percent() {
        let cache = RouteCache::new();
        cache.add_pipeline_route("p1", "canary", 1, false).unwrap();
        cache.add_pipeline_route("p1", "main", 3, false).unwrap();
        cache.add_pipeline_route("p1", "mirror", 10, true).unwrap();

        let contents = cache.route_contents();
        let r = routes(&contents);
        assert_eq!(r[0].name, "canary");
        assert_eq!(r[0].traffic_percent, 25);
        assert_eq!(r[1].name, "main");
        assert_eq!(r[1].traffic_percent, 75);
        assert_eq!(r[2].traffic_percent, 10);
    }

    #[test]
    fn test_rejects_malformed_weights() {
        let cache = RouteCache::new();
        assert!(matches!(
            cache.add_route_cluster_traffic("m", "c", 1, 0, "http", "grpc", false, false),
            Err(RouteCacheError::ZeroWeightBasis { .. })
        ));
        assert!(matches!(
            cache.add_route_cluster_traffic("m", "c", 101, 100, "http", "grpc", false, false),
            Err(RouteCacheError::WeightExceedsBasis { .. })
        ));
        assert!(cache.route_contents().is_empty());
        assert_eq!(cache.version(), 0);
    }

    #[test]
    fn test_removal() {
        let cache = RouteCache::new();
        cache.add_pipeline_route("p1", "r1", 100, false).unwrap();
        cache.add_pipeline_route("p1", "r2", 100, false).unwrap();
        cache.add_pipeline_route("p2", "r1", 100, false).unwrap();
        cache
            .add_route_cluster_traffic("m", "c", 100, 100, "http", "grpc", false, false)
            .unwrap();

        assert!(cache.remove_pipeline_route("p2", "r1"));
        assert!(!cache.remove_pipeline_route("p2", "r1"));
        assert_eq!(cache.remove_pipeline("p1"), 2);
        assert_eq!(cache.remove_model_traffic("m"), 1);
        assert!(cache.route_contents().is_empty());
    }

    #[test]
    fn test_snapshot_never_torn() {
        let cache = Arc::new(RouteCache::new());
        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    cache
                        .add_pipeline_route("p", &format!("r{i:03}"), 1, false)
                        .unwrap();
                }
            })
        };

        // Each upsert adds one route and bumps the version once, so a
        // consistent snapshot always has as many routes as its version.
        for _ in 0..200 {
            let snapshot = cache.snapshot();
            let r = routes(&snapshot.resources);
            assert_eq!(r.len() as u64, snapshot.version);
            if !r.is_empty() {
                assert_eq!(r.iter().map(|r| r.traffic_percent).sum::<u32>(), TOTAL_WEIGHT);
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_mirror_route_weight_bounded() {
        let cache = RouteCache::new();
        assert_eq!(
            cache.add_pipeline_route("p1", "shadow", 150, true),
            Err(RouteCacheError::MirrorWeightExceedsTotal {
                pipeline: "p1".into(),
                route: "shadow".into(),
                weight: 150,
            })
        );
        assert_eq!(cache.version(), 0);

        // Primary weights are relative and not bounded.
        cache.add_pipeline_route("p1", "main", 150, false).unwrap();
        cache.add_pipeline_route("p1", "shadow", 100, true).unwrap();
        let contents = cache.route_contents();
        let r = routes(&contents);
        assert_eq!(r[0].traffic_percent, 100);
        assert_eq!(r[1].traffic_percent, 100);
    }

    #[test]
    fn test_shared_cluster_protocols_must_agree() {
        let cache = RouteCache::new();
        cache
            .add_route_cluster_traffic("iris", "shared", 100, 100, "http", "grpc", false, false)
            .unwrap();
        let err = cache
            .add_route_cluster_traffic("tfsimple", "shared", 100, 100, "https", "grpc", false, false)
            .unwrap_err();
        assert!(matches!(
            err,
            RouteCacheError::ClusterProtocolMismatch { ref existing_model, .. } if existing_model == "iris"
        ));

        // Same protocols share the cluster; the owning model may change its own.
        cache
            .add_route_cluster_traffic("tfsimple", "shared", 100, 100, "http", "grpc", false, false)
            .unwrap();
        cache.remove_model_traffic("tfsimple");
        cache
            .add_route_cluster_traffic("iris", "shared", 100, 100, "https", "grpc2", false, false)
            .unwrap();

        let contents = cache.route_contents();
        let clusters: Vec<&ClusterResource> = contents
            .iter()
            .filter_map(|r| match r {
                ProxyResource::Cluster(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].http_protocol, "https");
        assert_eq!(clusters[0].grpc_protocol, "grpc2");
    }

    #[test]
    fn test_snapshot_serializes() {
        let cache = RouteCache::new();
        cache.add_pipeline_route("p1", "r1", 100, false).unwrap();
        let v = serde_json::to_value(cache.snapshot()).unwrap();
        assert_eq!(v["version"], 1);
        assert_eq!(v["resources"][0]["type"], "route");
    }

    #[test]
    fn test_normalize() {
        assert!(normalize(&[]).is_empty());
        assert_eq!(normalize(&[0.0, 0.0]), vec![50, 50]);
        assert_eq!(normalize(&[1.0, 1.0, 1.0]), vec![34, 33, 33]);
        assert_eq!(normalize(&[50.0]), vec![100]);
    }
}
