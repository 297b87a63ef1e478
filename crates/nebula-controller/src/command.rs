use std::future::Future;
use std::sync::Arc;

use nebula_common::{
    KubernetesMeta, LoadPipelineRequest, Pipeline, Server, ServerNotify, ServerNotifyRequest,
    UnloadPipelineRequest, PIPELINE_READY,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::metrics::SyncMetrics;
use crate::scheduler::{SchedulerApi, SchedulerError};
use crate::status::SyncContext;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no scheduler connection for namespace {namespace}: {source}")]
    Connection {
        namespace: String,
        #[source]
        source: SchedulerError,
    },

    #[error("{operation} failed: {source}")]
    Rpc {
        operation: &'static str,
        #[source]
        source: SchedulerError,
    },

    #[error("command cancelled")]
    Cancelled,
}

impl CommandError {
    /// Whether the caller should try the command again later.
    ///
    /// Failing to obtain a connection is always worth a retry; RPC failures
    /// defer to the transport's classification.
    pub fn is_retryable(&self) -> bool {
        match self {
            CommandError::Connection { .. } => true,
            CommandError::Rpc { source, .. } => source.is_retryable(),
            CommandError::Cancelled => false,
        }
    }
}

/// Issues load, unload and notify commands to the namespace's scheduler.
#[derive(Clone)]
pub struct CommandClient {
    connections: Arc<ConnectionManager>,
    ctx: SyncContext,
    cancel: CancellationToken,
}

impl CommandClient {
    pub fn new(connections: Arc<ConnectionManager>, ctx: SyncContext, cancel: CancellationToken) -> Self {
        Self {
            connections,
            ctx,
            cancel,
        }
    }

    async fn connection(&self, namespace: &str) -> Result<Arc<dyn SchedulerApi>, CommandError> {
        self.connections
            .get(namespace)
            .await
            .map_err(|source| CommandError::Connection {
                namespace: namespace.to_string(),
                source,
            })
    }

    async fn call<F>(&self, operation: &'static str, rpc: F) -> Result<(), CommandError>
    where
        F: Future<Output = Result<(), SchedulerError>>,
    {
        SyncMetrics::inc(&self.ctx.metrics.commands_total);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CommandError::Cancelled),
            r = rpc => r.map_err(|source| CommandError::Rpc { operation, source }),
        };
        if result.is_err() {
            SyncMetrics::inc(&self.ctx.metrics.command_failures_total);
        }
        result
    }

    pub async fn load_pipeline(&self, pipeline: &Pipeline) -> Result<(), CommandError> {
        let scheduler = self.connection(&pipeline.metadata.namespace).await?;
        info!(
            pipeline = %pipeline.metadata.name,
            namespace = %pipeline.metadata.namespace,
            generation = pipeline.metadata.generation,
            "load pipeline"
        );
        let request = LoadPipelineRequest {
            pipeline: pipeline.as_scheduler_pipeline(),
        };
        self.call("load_pipeline", scheduler.load_pipeline(request)).await
    }

    /// Ask the scheduler to unload `pipeline`.
    ///
    /// On success the pipeline is marked not ready and that status is written
    /// once. A failed status write is reported but does not fail the unload.
    pub async fn unload_pipeline(&self, pipeline: &Pipeline) -> Result<(), CommandError> {
        let scheduler = self.connection(&pipeline.metadata.namespace).await?;
        info!(
            pipeline = %pipeline.metadata.name,
            namespace = %pipeline.metadata.namespace,
            "unload pipeline"
        );
        let request = UnloadPipelineRequest {
            name: pipeline.metadata.name.clone(),
        };
        self.call("unload_pipeline", scheduler.unload_pipeline(request))
            .await?;

        let mut terminating = pipeline.clone();
        terminating.status.conditions.set(
            PIPELINE_READY,
            false,
            "PipelineTerminating",
            "Pipeline unload requested",
        );
        if let Err(e) = self.ctx.write_status(&terminating).await {
            warn!(pipeline = %pipeline.metadata.name, error = %e, "failed to mark pipeline terminating");
        }
        Ok(())
    }

    /// Report `servers` to the scheduler of the first server's namespace.
    /// An empty set succeeds without contacting anything.
    pub async fn notify_servers(&self, servers: &[Server], is_first_sync: bool) -> Result<(), CommandError> {
        let Some(first) = servers.first() else {
            return Ok(());
        };
        let scheduler = self.connection(&first.metadata.namespace).await?;
        self.notify_servers_on(scheduler.as_ref(), servers, is_first_sync)
            .await
    }

    /// Same as [`CommandClient::notify_servers`] over an already open connection.
    pub async fn notify_servers_on(
        &self,
        scheduler: &dyn SchedulerApi,
        servers: &[Server],
        is_first_sync: bool,
    ) -> Result<(), CommandError> {
        let notifications = server_notifications(servers);
        if notifications.is_empty() {
            return Ok(());
        }
        let request = ServerNotifyRequest {
            servers: notifications,
            is_first_sync,
        };
        self.call("server_notify", scheduler.server_notify(request))
            .await
    }
}

/// Replica intent for each server. Servers whose scaling settings do not
/// validate are left out with a warning.
pub fn server_notifications(servers: &[Server]) -> Vec<ServerNotify> {
    servers
        .iter()
        .filter_map(|server| {
            let scaling = match server.scaling_spec() {
                Ok(s) => s,
                Err(e) => {
                    warn!(server = %server.metadata.name, namespace = %server.metadata.namespace, error = %e, "invalid scaling spec, not notifying");
                    return None;
                }
            };
            let expected_replicas = server.expected_replicas();
            info!(
                server = %server.metadata.name,
                namespace = %server.metadata.namespace,
                replicas = expected_replicas,
                "notify server"
            );
            Some(ServerNotify {
                name: server.metadata.name.clone(),
                expected_replicas,
                min_replicas: scaling.min_replicas,
                max_replicas: scaling.max_replicas,
                kubernetes_meta: Some(KubernetesMeta {
                    namespace: server.metadata.namespace.clone(),
                    generation: server.metadata.generation,
                }),
            })
        })
        .collect()
}
