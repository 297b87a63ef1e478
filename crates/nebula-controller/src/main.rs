mod args;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use nebula_common::telemetry::init_tracing;
use nebula_controller::{
    admin_router, AdminState, CommandClient, ConflictRetry, ConnectionManager,
    DesiredStateReconciler, HttpConnector, HttpConnectorConfig, PipelineStatusSync, RetryConfig,
    ServerStatusSync, SyncContext, SyncMetrics,
};
use nebula_meta::{EtcdMetaStore, MetaEventRecorder, MetaStore, ResourceStore};
use nebula_xds::RouteCache;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _telemetry = init_tracing(
        "nebula-controller",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        args.log_format,
    );
    info!(namespaces = ?args.namespaces, "nebula-controller starting...");

    let meta: Arc<dyn MetaStore> =
        Arc::new(EtcdMetaStore::connect(std::slice::from_ref(&args.etcd_endpoint)).await?);
    info!(endpoint = %args.etcd_endpoint, "connected to etcd");

    let store = ResourceStore::new(meta.clone());
    let recorder = Arc::new(MetaEventRecorder::new(meta));
    let metrics = Arc::new(SyncMetrics::default());
    let cancel = CancellationToken::new();
    let ctx = SyncContext::new(store, recorder, metrics.clone())
        .with_conflict_retry(ConflictRetry::with_steps(args.conflict_retry_steps))
        .with_cancel(cancel.clone());

    let rpc_retry = RetryConfig {
        max_attempts: args.rpc_max_attempts,
        initial_delay: Duration::from_millis(args.rpc_initial_backoff_ms),
        ..Default::default()
    };
    let connector = HttpConnector::new(HttpConnectorConfig {
        url_template: args.scheduler_url_template.clone(),
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        retry: rpc_retry,
        ..Default::default()
    })?;
    let connections = Arc::new(ConnectionManager::new(Arc::new(connector)));

    let commands = CommandClient::new(connections.clone(), ctx.clone(), cancel.clone());
    let routes = Arc::new(RouteCache::new());
    let reconnect_delay = Duration::from_millis(args.reconnect_delay_ms);
    let tracker = TaskTracker::new();

    for namespace in &args.namespaces {
        let pipelines = PipelineStatusSync::new(ctx.clone(), args.subscriber_name.clone());
        let servers = ServerStatusSync::new(ctx.clone(), commands.clone(), args.subscriber_name.clone());

        tracker.spawn(supervise(
            "pipeline-status",
            namespace.clone(),
            connections.clone(),
            metrics.clone(),
            reconnect_delay,
            cancel.clone(),
            move |scheduler, ns, cancel| {
                let pipelines = pipelines.clone();
                async move { pipelines.run(scheduler, &ns, cancel).await }
            },
        ));
        tracker.spawn(supervise(
            "server-status",
            namespace.clone(),
            connections.clone(),
            metrics.clone(),
            reconnect_delay,
            cancel.clone(),
            move |scheduler, ns, cancel| {
                let servers = servers.clone();
                async move { servers.run(scheduler, &ns, cancel).await }
            },
        ));

        let mut reconciler =
            DesiredStateReconciler::new(ctx.clone(), commands.clone(), routes.clone(), namespace.clone());
        let ns = namespace.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            while !cancel.is_cancelled() {
                if let Err(e) = reconciler.run(cancel.clone()).await {
                    error!(namespace = %ns, error = %e, "desired-state watch failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        });
    }
    tracker.close();

    let app = admin_router(AdminState {
        metrics,
        routes,
    });
    let listener = tokio::net::TcpListener::bind(args.admin_addr).await?;
    info!(addr = %args.admin_addr, "admin server listening");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutting down");
        shutdown.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    connections.close();
    tracker.wait().await;
    info!("nebula-controller stopped");
    Ok(())
}

/// Keep one status stream per namespace alive: connect, run until the stream
/// ends or fails, wait `reconnect_delay`, repeat until cancelled.
async fn supervise<F, Fut>(
    stream: &'static str,
    namespace: String,
    connections: Arc<ConnectionManager>,
    metrics: Arc<SyncMetrics>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
    run: F,
) where
    F: Fn(Arc<dyn nebula_controller::scheduler::SchedulerApi>, String, CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), nebula_controller::scheduler::SchedulerError>>,
{
    let mut first = true;
    while !cancel.is_cancelled() {
        if !first {
            SyncMetrics::inc(&metrics.stream_reconnects_total);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
        }
        first = false;

        let scheduler = match connections.get(&namespace).await {
            Ok(s) => s,
            Err(e) => {
                warn!(stream, %namespace, error = %e, "scheduler connection unavailable");
                continue;
            }
        };
        match run(scheduler, namespace.clone(), cancel.clone()).await {
            Ok(()) => info!(stream, %namespace, "stream ended, reconnecting"),
            Err(e) => warn!(stream, %namespace, error = %e, "stream failed, reconnecting"),
        }
    }
}
