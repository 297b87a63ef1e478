use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use nebula_xds::RouteCache;

/// Counters for the sync engine, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Pipeline status events received from the scheduler.
    pub pipeline_events_total: AtomicU64,
    /// Server status events received from the scheduler.
    pub server_events_total: AtomicU64,
    /// Events dropped because they lacked required fields.
    pub malformed_events_total: AtomicU64,
    /// Events ignored because their generation no longer matched.
    pub stale_events_total: AtomicU64,
    pub status_writes_total: AtomicU64,
    pub status_write_failures_total: AtomicU64,
    pub finalizers_removed_total: AtomicU64,
    /// Load, unload and notify calls issued.
    pub commands_total: AtomicU64,
    pub command_failures_total: AtomicU64,
    /// Subscription loops restarted after ending or failing.
    pub stream_reconnects_total: AtomicU64,
}

impl SyncMetrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 10] = [
            ("pipeline_events_total", "Pipeline status events received.", &self.pipeline_events_total),
            ("server_events_total", "Server status events received.", &self.server_events_total),
            ("malformed_events_total", "Status events skipped as malformed.", &self.malformed_events_total),
            ("stale_events_total", "Status events ignored for an old generation.", &self.stale_events_total),
            ("status_writes_total", "Successful status writes.", &self.status_writes_total),
            ("status_write_failures_total", "Status writes that failed after retries.", &self.status_write_failures_total),
            ("finalizers_removed_total", "Finalizers removed after scheduler confirmation.", &self.finalizers_removed_total),
            ("commands_total", "Scheduler commands issued.", &self.commands_total),
            ("command_failures_total", "Scheduler commands that failed.", &self.command_failures_total),
            ("stream_reconnects_total", "Status subscription restarts.", &self.stream_reconnects_total),
        ];

        let mut body = String::new();
        for (name, help, value) in counters {
            body.push_str(&format!(
                "# HELP nebula_controller_{name} {help}\n\
                 # TYPE nebula_controller_{name} counter\n\
                 nebula_controller_{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        body
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub metrics: Arc<SyncMetrics>,
    pub routes: Arc<RouteCache>,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/routes", get(routes_handler))
        .with_state(state)
}

/// GET /metrics: Prometheus text format.
pub async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, state.metrics.render())
}

/// GET /healthz
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

/// GET /routes: current proxy configuration snapshot.
pub async fn routes_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.routes.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_counters() {
        let metrics = SyncMetrics::default();
        SyncMetrics::inc(&metrics.stale_events_total);
        SyncMetrics::inc(&metrics.stale_events_total);

        let body = metrics.render();
        assert!(body.contains("# TYPE nebula_controller_stale_events_total counter\n"));
        assert!(body.contains("nebula_controller_stale_events_total 2\n"));
        assert!(body.contains("nebula_controller_commands_total 0\n"));
    }

    #[tokio::test]
    async fn test_admin_routes() {
        let routes = Arc::new(RouteCache::new());
        routes.add_pipeline_route("p1", "r1", 100, false).unwrap();
        let app = admin_router(AdminState {
            metrics: Arc::new(SyncMetrics::default()),
            routes,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let health = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");

        let snapshot: serde_json::Value = reqwest::get(format!("http://{addr}/routes"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(snapshot["version"], 1);
        assert_eq!(snapshot["resources"][0]["name"], "r1");
    }
}
