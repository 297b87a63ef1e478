use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nebula_common::Resource;
use serde::{Deserialize, Serialize};

use crate::types::MetaStore;

/// How long recorded events are kept in the backend.
const DEFAULT_EVENT_TTL_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Normal,
    Warning,
}

/// A human-facing notification about a desired-state record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp_ms: i64,
}

impl Event {
    pub fn warning<R: Resource>(record: &R, reason: &str, message: String) -> Self {
        Self {
            kind: R::KIND.to_string(),
            namespace: record.namespace().to_string(),
            name: record.name().to_string(),
            event_type: EventType::Warning,
            reason: reason.to_string(),
            message,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Best effort; failures to record are logged, never returned.
    async fn record(&self, event: Event);
}

/// Persists events under `/events/{namespace}/{kind}/{name}/{timestamp}` with a TTL.
#[derive(Clone)]
pub struct MetaEventRecorder {
    meta: Arc<dyn MetaStore>,
    ttl_ms: u64,
}

impl MetaEventRecorder {
    pub fn new(meta: Arc<dyn MetaStore>) -> Self {
        Self {
            meta,
            ttl_ms: DEFAULT_EVENT_TTL_MS,
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn key_prefix(namespace: &str) -> String {
        format!("/events/{namespace}/")
    }
}

#[async_trait]
impl EventRecorder for MetaEventRecorder {
    async fn record(&self, event: Event) {
        match event.event_type {
            EventType::Warning => tracing::warn!(
                kind=%event.kind, namespace=%event.namespace, name=%event.name,
                reason=%event.reason, "{}", event.message
            ),
            EventType::Normal => tracing::info!(
                kind=%event.kind, namespace=%event.namespace, name=%event.name,
                reason=%event.reason, "{}", event.message
            ),
        }

        let key = format!(
            "{}{}/{}/{}",
            Self::key_prefix(&event.namespace),
            event.kind,
            event.name,
            event.timestamp_ms
        );
        let value = match serde_json::to_vec(&event) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error=%e, "failed to serialize event");
                return;
            }
        };
        if let Err(e) = self.meta.put(&key, value, Some(self.ttl_ms)).await {
            tracing::warn!(error=%e, %key, "failed to persist event");
        }
    }
}
