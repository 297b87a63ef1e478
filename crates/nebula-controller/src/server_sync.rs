use std::sync::Arc;

use futures_util::StreamExt;
use nebula_common::{
    NamespacedName, Resource, Server, ServerEventKind, ServerStatusEvent, SubscriptionRequest,
};
use nebula_meta::StoreError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::apply_connection_condition;
use crate::command::CommandClient;
use crate::metrics::SyncMetrics;
use crate::retry::retry_on_conflict;
use crate::scheduler::{SchedulerApi, SchedulerError};
use crate::status::{EventOutcome, Fenced, SyncContext};

/// Reconciles scheduler server status into the desired-state store.
#[derive(Clone)]
pub struct ServerStatusSync {
    ctx: SyncContext,
    commands: CommandClient,
    subscriber_name: String,
}

impl ServerStatusSync {
    pub fn new(ctx: SyncContext, commands: CommandClient, subscriber_name: impl Into<String>) -> Self {
        Self {
            ctx,
            commands,
            subscriber_name: subscriber_name.into(),
        }
    }

    /// Subscribe, start the re-sync burst, and process events until the
    /// stream ends, fails or `cancel` fires.
    ///
    /// The burst runs as its own task over the same connection so a
    /// restarted scheduler learns every server without waiting for spec
    /// changes.
    pub async fn run(
        &self,
        scheduler: Arc<dyn SchedulerApi>,
        namespace: &str,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        let mut stream = scheduler
            .subscribe_server_status(SubscriptionRequest {
                subscriber_name: self.subscriber_name.clone(),
            })
            .await?;
        info!(%namespace, subscriber = %self.subscriber_name, "server status stream open");

        // Dropping the set aborts a burst still in flight.
        let mut resync = JoinSet::new();
        resync.spawn(resync_servers(
            self.ctx.clone(),
            self.commands.clone(),
            scheduler.clone(),
            namespace.to_string(),
        ));

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(%namespace, "server status stream cancelled");
                    return Ok(());
                }
                next = stream.next() => next,
            };

            match next {
                None => {
                    info!(%namespace, "server status stream closed");
                    return Ok(());
                }
                Some(Err(e)) => {
                    error!(%namespace, error = %e, "server event recv failed");
                    return Err(e);
                }
                Some(Ok(event)) => {
                    // An event still in flight is abandoned on shutdown.
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!(%namespace, "server status stream cancelled");
                            return Ok(());
                        }
                        _ = self.handle_event(event) => {}
                    }
                }
            }
        }
    }

    pub async fn handle_event(&self, event: ServerStatusEvent) -> EventOutcome {
        SyncMetrics::inc(&self.ctx.metrics.server_events_total);

        let Some(meta) = event.kubernetes_meta.clone() else {
            SyncMetrics::inc(&self.ctx.metrics.malformed_events_total);
            debug!(server = %event.server_name, "server event without desired-state metadata, ignoring");
            return EventOutcome::Malformed;
        };
        info!(
            server = %event.server_name,
            generation = meta.generation,
            kind = ?event.event_type,
            expected = event.expected_replicas,
            available = event.available_replicas,
            "received server event"
        );

        let key = NamespacedName::new(meta.namespace.clone(), event.server_name.clone());
        if let Err(e) = self.ctx.store.get::<Server>(&key).await {
            warn!(server = %key, error = %e, "failed to get server");
            return EventOutcome::Missing;
        }

        let result = match event.event_type {
            ServerEventKind::StatusUpdate => self.update_status(&key, &event, meta.generation, true).await,
            ServerEventKind::NonAuthoritativeReplicaInfo => {
                self.update_status(&key, &event, meta.generation, false).await
            }
            ServerEventKind::ScalingRequest => {
                if event.expected_replicas == event.available_replicas {
                    debug!(server = %key, "scaling request already satisfied");
                    return EventOutcome::Ignored;
                }
                self.apply_scaling(&key, &event, meta.generation).await
            }
            ServerEventKind::Unknown => {
                debug!(server = %key, "unknown server event kind, ignoring");
                return EventOutcome::Ignored;
            }
        };

        self.ctx
            .fenced_outcome(Server::KIND, &key.name, meta.generation, result)
    }

    /// Recompute the connection condition. Authoritative reports also carry
    /// the loaded-model and connected replica counts.
    async fn update_status(
        &self,
        key: &NamespacedName,
        event: &ServerStatusEvent,
        generation: i64,
        authoritative: bool,
    ) -> Result<Fenced, StoreError> {
        retry_on_conflict(&self.ctx.conflict_retry, &self.ctx.cancel, || async {
            let mut latest: Server = self.ctx.store.get(key).await?;
            if latest.generation() != generation {
                return Ok(Fenced::Stale {
                    current: latest.generation(),
                });
            }
            if authoritative {
                latest.status.loaded_model_replicas = event.num_loaded_model_replicas;
                latest.status.replicas_connected_to_control_plane = event.available_replicas;
            }
            let c = apply_connection_condition(&mut latest, event.available_replicas, event.expected_replicas);
            debug!(server = %key, reason = %c.reason, ready = c.ready, "setting server status");
            self.ctx.write_status(&latest).await?;
            Ok(Fenced::Written)
        })
        .await
    }

    /// Write the scheduler's desired replica count into the server spec.
    async fn apply_scaling(
        &self,
        key: &NamespacedName,
        event: &ServerStatusEvent,
        generation: i64,
    ) -> Result<Fenced, StoreError> {
        retry_on_conflict(&self.ctx.conflict_retry, &self.ctx.cancel, || async {
            let mut latest: Server = self.ctx.store.get(key).await?;
            if latest.generation() != generation {
                return Ok(Fenced::Stale {
                    current: latest.generation(),
                });
            }
            info!(
                server = %key,
                from = ?latest.spec.replicas,
                to = event.expected_replicas,
                "applying scaling request"
            );
            latest.spec.replicas = Some(event.expected_replicas);
            self.ctx.store.update(latest).await?;
            Ok(Fenced::Written)
        })
        .await
    }
}

/// Notify the scheduler of every server in `namespace` that is not being
/// deleted, flagged as a first sync.
pub async fn resync_servers(
    ctx: SyncContext,
    commands: CommandClient,
    scheduler: Arc<dyn SchedulerApi>,
    namespace: String,
) {
    let servers: Vec<Server> = match ctx.store.list::<Server>(&namespace).await {
        Ok(all) => all
            .into_iter()
            .filter(|s| !s.metadata.is_deleting())
            .collect(),
        Err(e) => {
            error!(%namespace, error = %e, "failed to list servers for re-sync");
            return;
        }
    };

    info!(%namespace, servers = servers.len(), "re-sync servers with scheduler");
    if let Err(e) = commands
        .notify_servers_on(scheduler.as_ref(), &servers, true)
        .await
    {
        error!(%namespace, error = %e, "failed to re-sync servers");
    }
}
