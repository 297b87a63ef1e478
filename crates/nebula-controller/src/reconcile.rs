//! Desired-state watch loop.
//!
//! Pushes Pipeline and Server changes from the store to the scheduler:
//! pipelines get the finalizer and a load per generation, pipelines pending
//! deletion get one unload, servers are re-announced whenever their
//! generation or deletion state changes. Loaded pipelines are published to
//! the route cache and withdrawn again once unloaded or removed.
//!
//! Commands are sent once per change; transient transport failures are
//! retried by the scheduler client. A command that still fails leaves the
//! generation unrecorded so the next put for it tries again.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use nebula_common::{
    NamespacedName, Pipeline, Resource, Server, ServerSpec, PIPELINE_FINALIZER,
};
use nebula_meta::{ResourceStore, StoreError, UpdateOutcome, WatchEvent};
use nebula_xds::{RouteCache, TOTAL_WEIGHT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::CommandClient;
use crate::retry::retry_on_conflict;
use crate::status::SyncContext;

pub struct DesiredStateReconciler {
    ctx: SyncContext,
    commands: CommandClient,
    routes: Arc<RouteCache>,
    namespace: String,
    pipeline_prefix: String,
    server_prefix: String,
    /// Pipeline name -> generation last loaded.
    loaded: HashMap<String, i64>,
    /// Pipeline name -> generation last unloaded.
    unloaded: HashMap<String, i64>,
    /// Server name -> (generation, deleting) last notified.
    notified: HashMap<String, (i64, bool)>,
}

impl DesiredStateReconciler {
    pub fn new(
        ctx: SyncContext,
        commands: CommandClient,
        routes: Arc<RouteCache>,
        namespace: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            pipeline_prefix: ResourceStore::prefix_for::<Pipeline>(&namespace),
            server_prefix: ResourceStore::prefix_for::<Server>(&namespace),
            ctx,
            commands,
            routes,
            namespace,
            loaded: HashMap::new(),
            unloaded: HashMap::new(),
            notified: HashMap::new(),
        }
    }

    /// Reconcile everything currently stored, then follow the watch until it
    /// ends or `cancel` fires. Progress is kept across calls, so a restarted
    /// run does not repeat commands for generations already handled.
    pub async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        // Watch before listing; anything written in between shows up twice,
        // which the per-generation bookkeeping absorbs.
        let meta = self.ctx.store.meta().clone();
        let pipelines = meta.watch_prefix(&self.pipeline_prefix, None).await?;
        let servers = meta.watch_prefix(&self.server_prefix, None).await?;
        let mut events = futures_util::stream::select(pipelines, servers);

        for pipeline in self.ctx.store.list::<Pipeline>(&self.namespace).await? {
            self.reconcile_pipeline(pipeline).await;
        }
        for server in self.ctx.store.list::<Server>(&self.namespace).await? {
            self.reconcile_server(server).await;
        }
        info!(namespace = %self.namespace, "desired-state watch started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = events.next() => next,
            };
            let Some(event) = next else {
                warn!(namespace = %self.namespace, "desired-state watch ended");
                return Ok(());
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = self.handle_watch_event(event) => {}
            }
        }
    }

    async fn handle_watch_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Put(entry) => {
                if entry.key.starts_with(&self.pipeline_prefix) {
                    match ResourceStore::decode::<Pipeline>(&entry) {
                        Ok(p) => self.reconcile_pipeline(p).await,
                        Err(e) => warn!(key = %entry.key, error = %e, "undecodable pipeline"),
                    }
                } else if entry.key.starts_with(&self.server_prefix) {
                    match ResourceStore::decode::<Server>(&entry) {
                        Ok(s) => self.reconcile_server(s).await,
                        Err(e) => warn!(key = %entry.key, error = %e, "undecodable server"),
                    }
                }
            }
            WatchEvent::Delete { key, .. } => {
                if let Some(name) = key.strip_prefix(&self.pipeline_prefix) {
                    debug!(pipeline = %name, "pipeline removed");
                    self.loaded.remove(name);
                    self.unloaded.remove(name);
                    self.withdraw_routes(name);
                } else if let Some(name) = key.strip_prefix(&self.server_prefix) {
                    let name = name.to_string();
                    self.drain_server(&name).await;
                }
            }
        }
    }

    pub async fn reconcile_pipeline(&mut self, pipeline: Pipeline) {
        let name = pipeline.metadata.name.clone();
        let generation = pipeline.generation();

        if pipeline.metadata.is_deleting() {
            if !pipeline.metadata.has_finalizer(PIPELINE_FINALIZER)
                || self.unloaded.get(&name) == Some(&generation)
            {
                return;
            }
            match self.commands.unload_pipeline(&pipeline).await {
                Ok(()) => {
                    self.withdraw_routes(&name);
                    self.loaded.remove(&name);
                    self.unloaded.insert(name, generation);
                }
                Err(e) => error!(pipeline = %name, error = %e, "failed to unload pipeline"),
            }
            return;
        }

        if self.loaded.get(&name) == Some(&generation) {
            return;
        }
        let pipeline = match self.ensure_finalizer(&pipeline.key()).await {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                warn!(pipeline = %name, error = %e, "failed to add finalizer");
                return;
            }
        };

        match self.commands.load_pipeline(&pipeline).await {
            Ok(()) => {
                // One primary route per pipeline, named after it.
                if let Err(e) = self.routes.add_pipeline_route(&name, &name, TOTAL_WEIGHT, false) {
                    warn!(pipeline = %name, error = %e, "failed to publish pipeline route");
                }
                self.loaded.insert(name, pipeline.generation());
            }
            Err(e) => error!(pipeline = %name, error = %e, "failed to load pipeline"),
        }
    }

    /// Make sure the pipeline carries the finalizer. Returns the latest
    /// record, or `None` when deletion became pending meanwhile.
    async fn ensure_finalizer(&self, key: &NamespacedName) -> Result<Option<Pipeline>, StoreError> {
        retry_on_conflict(&self.ctx.conflict_retry, &self.ctx.cancel, || async {
            let mut latest: Pipeline = self.ctx.store.get(key).await?;
            if latest.metadata.is_deleting() {
                return Ok(None);
            }
            if !latest.metadata.add_finalizer(PIPELINE_FINALIZER) {
                return Ok(Some(latest));
            }
            debug!(pipeline = %key, "adding finalizer");
            match self.ctx.store.update(latest).await? {
                UpdateOutcome::Updated(p) => Ok(Some(p)),
                UpdateOutcome::Removed => Ok(None),
            }
        })
        .await
    }

    pub async fn reconcile_server(&mut self, server: Server) {
        let name = server.metadata.name.clone();
        let mark = (server.generation(), server.metadata.is_deleting());
        if self.notified.get(&name) == Some(&mark) {
            return;
        }
        let result = self
            .commands
            .notify_servers(std::slice::from_ref(&server), false)
            .await;
        match result {
            Ok(()) => {
                self.notified.insert(name, mark);
            }
            Err(e) => error!(server = %name, error = %e, "failed to notify server"),
        }
    }

    /// Tell the scheduler a server that was notified before is gone, so its
    /// replicas drain to zero.
    async fn drain_server(&mut self, name: &str) {
        let Some((generation, _)) = self.notified.remove(name) else {
            return;
        };
        info!(server = %name, namespace = %self.namespace, "server removed, draining");
        let mut gone = Server::new(&self.namespace, name, ServerSpec::default());
        gone.metadata.generation = generation;
        gone.metadata.deletion_timestamp = Some(Utc::now());
        if let Err(e) = self
            .commands
            .notify_servers(std::slice::from_ref(&gone), false)
            .await
        {
            error!(server = %name, error = %e, "failed to drain server");
        }
    }

    fn withdraw_routes(&self, pipeline: &str) {
        let removed = self.routes.remove_pipeline(pipeline);
        if removed > 0 {
            debug!(pipeline, removed, "pipeline routes withdrawn");
        }
    }
}
