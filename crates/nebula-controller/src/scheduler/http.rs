use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use nebula_common::{
    LoadPipelineRequest, PipelineStatusEvent, ServerNotifyRequest, ServerStatusEvent,
    SubscriptionRequest, UnloadPipelineRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{PipelineStatusStream, SchedulerApi, SchedulerError, ServerStatusStream};
use crate::retry::{retry_with_backoff, RetryConfig};

const LOAD_PIPELINE_PATH: &str = "/v1/pipelines/load";
const UNLOAD_PIPELINE_PATH: &str = "/v1/pipelines/unload";
const SERVER_NOTIFY_PATH: &str = "/v1/servers/notify";
const PIPELINE_STATUS_PATH: &str = "/v1/pipelines/status/subscribe";
const SERVER_STATUS_PATH: &str = "/v1/servers/status/subscribe";

const STREAM_BUFFER: usize = 64;

/// JSON over HTTP transport for one scheduler instance.
///
/// Commands are plain POSTs acknowledged by any 2xx. Subscriptions are POSTs
/// whose response body is a never-ending sequence of newline-delimited JSON
/// events. Every request, including opening a subscription, goes through
/// [`retry_with_backoff`].
pub struct HttpScheduler {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    retry: RetryConfig,
}

impl HttpScheduler {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        request_timeout: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            retry,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, SchedulerError> {
        let mut req = self.client.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SchedulerError::Status { status, body });
        }
        Ok(resp)
    }

    async fn command<B: Serialize + Sync>(
        &self,
        operation: &str,
        path: &str,
        body: &B,
    ) -> Result<(), SchedulerError> {
        retry_with_backoff(&self.retry, operation, SchedulerError::is_retryable, || async {
            self.post(path, body, Some(self.request_timeout)).await.map(|_| ())
        })
        .await
    }

    async fn subscribe<T>(
        &self,
        path: &str,
        request: &SubscriptionRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<T, SchedulerError>> + Send>>, SchedulerError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let resp = retry_with_backoff(&self.retry, path, SchedulerError::is_retryable, || async {
            self.post(path, request, None).await
        })
        .await?;

        let (tx, rx) = mpsc::channel::<Result<T, SchedulerError>>(STREAM_BUFFER);
        let mut upstream = resp.bytes_stream();

        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            loop {
                let item = tokio::select! {
                    _ = tx.closed() => return,
                    item = upstream.next() => item,
                };
                let chunk = match item {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                    None => break,
                };

                buf.extend_from_slice(&chunk);
                for event in decode_ndjson::<T>(&mut buf) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }

            // A final event may arrive without its trailing newline.
            if !buf.is_empty() {
                buf.extend_from_slice(b"\n");
                for event in decode_ndjson::<T>(&mut buf) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Drain every complete line from `buf` and decode it.
///
/// Blank lines are skipped. Lines that do not decode are logged and dropped;
/// an incomplete trailing line stays in the buffer.
pub fn decode_ndjson<T: DeserializeOwned>(buf: &mut BytesMut) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line = buf.split_to(pos);
        buf.advance(1);

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<T>(&line) {
            Ok(v) => out.push(v),
            Err(e) => {
                tracing::warn!(error=%e, line=%String::from_utf8_lossy(&line), "dropping undecodable event");
            }
        }
    }
    out
}

#[async_trait]
impl SchedulerApi for HttpScheduler {
    async fn load_pipeline(&self, request: LoadPipelineRequest) -> Result<(), SchedulerError> {
        self.command("load_pipeline", LOAD_PIPELINE_PATH, &request).await
    }

    async fn unload_pipeline(&self, request: UnloadPipelineRequest) -> Result<(), SchedulerError> {
        self.command("unload_pipeline", UNLOAD_PIPELINE_PATH, &request).await
    }

    async fn server_notify(&self, request: ServerNotifyRequest) -> Result<(), SchedulerError> {
        self.command("server_notify", SERVER_NOTIFY_PATH, &request).await
    }

    async fn subscribe_pipeline_status(
        &self,
        request: SubscriptionRequest,
    ) -> Result<PipelineStatusStream, SchedulerError> {
        self.subscribe::<PipelineStatusEvent>(PIPELINE_STATUS_PATH, &request)
            .await
    }

    async fn subscribe_server_status(
        &self,
        request: SubscriptionRequest,
    ) -> Result<ServerStatusStream, SchedulerError> {
        self.subscribe::<ServerStatusEvent>(SERVER_STATUS_PATH, &request)
            .await
    }
}
