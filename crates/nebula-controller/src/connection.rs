use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::info;

use crate::retry::RetryConfig;
use crate::scheduler::{HttpScheduler, SchedulerApi, SchedulerError};

/// Opens a scheduler connection for a namespace.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, namespace: &str) -> Result<Arc<dyn SchedulerApi>, SchedulerError>;
}

#[derive(Debug, Clone)]
pub struct HttpConnectorConfig {
    /// Base URL with a `{namespace}` placeholder.
    pub url_template: String,
    pub connect_timeout: Duration,
    /// Applies to commands only; subscriptions stay open indefinitely.
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for HttpConnectorConfig {
    fn default() -> Self {
        Self {
            url_template: "http://nebula-scheduler.{namespace}:9004".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl HttpConnectorConfig {
    pub fn url_for(&self, namespace: &str) -> String {
        self.url_template.replace("{namespace}", namespace)
    }
}

/// Builds [`HttpScheduler`]s that share one pooled `reqwest::Client`.
pub struct HttpConnector {
    config: HttpConnectorConfig,
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(config: HttpConnectorConfig) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, namespace: &str) -> Result<Arc<dyn SchedulerApi>, SchedulerError> {
        let url = self.config.url_for(namespace);
        reqwest::Url::parse(&url).map_err(|e| SchedulerError::InvalidEndpoint(format!("{url}: {e}")))?;

        Ok(Arc::new(HttpScheduler::new(
            self.client.clone(),
            url,
            self.config.request_timeout,
            self.config.retry.clone(),
        )))
    }
}

type Slot = Arc<OnceCell<Arc<dyn SchedulerApi>>>;

/// One scheduler connection per namespace, created on first use.
///
/// Concurrent first use of a namespace resolves to a single `connect` call:
/// the per-namespace slot is inserted under the map's entry lock and then
/// initialized once. A failed `connect` leaves the slot empty so the next
/// caller tries again.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connections: DashMap<String, Slot>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn get(&self, namespace: &str) -> Result<Arc<dyn SchedulerApi>, SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::Closed);
        }

        let slot: Slot = self
            .connections
            .entry(namespace.to_string())
            .or_default()
            .clone();

        let conn = slot
            .get_or_try_init(|| async {
                info!(%namespace, "opening scheduler connection");
                self.connector.connect(namespace).await
            })
            .await?;
        Ok(conn.clone())
    }

    /// Namespaces with an established connection.
    pub fn namespaces(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.value().initialized())
            .map(|e| e.key().clone())
            .collect();
        out.sort();
        out
    }

    /// Drop every connection. Later calls to [`ConnectionManager::get`] fail
    /// with [`SchedulerError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let n = self.connections.len();
        self.connections.clear();
        info!(connections = n, "scheduler connections closed");
    }
}
