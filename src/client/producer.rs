//! Producer
//!
//! The long-lived send dispatcher handed to every piece of code that
//! publishes. Send modes:
//! - `send_sync`: waits for the broker's `SendResult`, bounded by a timeout
//! - `send_async`: returns at once; exactly one of the two callbacks runs on
//!   a task owned by the producer
//! - `send_one_way`: fire and forget
//! - `send_one_way_ordered`: fire and forget through an ordered lane; all
//!   envelopes with the same partition key share a lane and are sent one
//!   after the other
//!
//! Transport failures are retried `retry_times_when_send_failed` times
//! before a send fails with `BrokerUnavailable`.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::message::{Headers, MessageEnvelope, SendResult};
use crate::config::ProducerSettings;
use crate::transport::BrokerEndpoint;
use crate::utils::{MqError, Result};

/// Endpoint plus retry policy, shared by the producer and its lane tasks.
#[derive(Clone)]
struct Dispatcher {
    endpoint: Arc<dyn BrokerEndpoint>,
    retries: u32,
}

impl Dispatcher {
    async fn dispatch(&self, envelope: MessageEnvelope) -> Result<SendResult> {
        let attempts = self.retries + 1;
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match self.endpoint.send(envelope.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() => {
                    warn!(attempt, attempts, topic = envelope.topic(), "send failed: {err}");
                    reason = err.to_string();
                }
                Err(err) => return Err(err),
            }
        }
        Err(MqError::BrokerUnavailable { attempts, reason })
    }

    async fn dispatch_one_way(&self, envelope: MessageEnvelope) -> Result<()> {
        let attempts = self.retries + 1;
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match self.endpoint.send_one_way(envelope.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    debug!(attempt, attempts, "one-way send failed: {err}");
                    reason = err.to_string();
                }
                Err(err) => return Err(err),
            }
        }
        Err(MqError::BrokerUnavailable { attempts, reason })
    }
}

#[derive(Clone)]
pub struct Producer {
    dispatcher: Dispatcher,
    send_timeout: Duration,
    lanes: Arc<Vec<mpsc::UnboundedSender<MessageEnvelope>>>,
    runtime: Handle,
}

impl Producer {
    /// Must be called from within a Tokio runtime; the producer keeps a
    /// handle to it for its callback and lane tasks.
    pub fn new(endpoint: Arc<dyn BrokerEndpoint>, settings: &ProducerSettings) -> Self {
        let runtime = Handle::current();
        let dispatcher = Dispatcher {
            endpoint,
            retries: settings.retry_times_when_send_failed,
        };

        let lanes = (0..settings.ordered_lanes.max(1))
            .map(|lane| {
                let (tx, mut rx) = mpsc::unbounded_channel::<MessageEnvelope>();
                let dispatcher = dispatcher.clone();
                runtime.spawn(async move {
                    while let Some(envelope) = rx.recv().await {
                        if let Err(err) = dispatcher.dispatch_one_way(envelope).await {
                            warn!(lane, "ordered one-way send dropped: {err}");
                        }
                    }
                });
                tx
            })
            .collect();

        Self {
            dispatcher,
            send_timeout: Duration::from_millis(settings.send_timeout_ms),
            lanes: Arc::new(lanes),
            runtime,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Sends and waits for the broker's answer, at most `timeout`.
    pub async fn send_sync(&self, envelope: MessageEnvelope, timeout: Duration) -> Result<SendResult> {
        tokio::time::timeout(timeout, self.dispatcher.dispatch(envelope))
            .await
            .map_err(|_| MqError::Timeout(timeout))?
    }

    /// [`send_sync`](Self::send_sync) with the configured `send_timeout_ms`.
    pub async fn send(&self, envelope: MessageEnvelope) -> Result<SendResult> {
        self.send_sync(envelope, self.send_timeout).await
    }

    /// Synchronous send tagged with a partition key.
    pub async fn send_ordered(
        &self,
        envelope: MessageEnvelope,
        partition_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<SendResult> {
        self.send_sync(envelope.with_partition_key(partition_key), timeout)
            .await
    }

    pub fn send_async<S, F>(&self, envelope: MessageEnvelope, on_success: S, on_failure: F)
    where
        S: FnOnce(SendResult) + Send + 'static,
        F: FnOnce(MqError) + Send + 'static,
    {
        self.send_async_with_timeout(envelope, self.send_timeout, on_success, on_failure);
    }

    pub fn send_async_with_timeout<S, F>(
        &self,
        envelope: MessageEnvelope,
        timeout: Duration,
        on_success: S,
        on_failure: F,
    ) where
        S: FnOnce(SendResult) + Send + 'static,
        F: FnOnce(MqError) + Send + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        self.runtime.spawn(async move {
            let outcome = tokio::time::timeout(timeout, dispatcher.dispatch(envelope))
                .await
                .map_err(|_| MqError::Timeout(timeout))
                .and_then(|result| result);
            match outcome {
                Ok(result) => on_success(result),
                Err(err) => on_failure(err),
            }
        });
    }

    pub fn send_one_way(&self, envelope: MessageEnvelope) {
        let dispatcher = self.dispatcher.clone();
        self.runtime.spawn(async move {
            if let Err(err) = dispatcher.dispatch_one_way(envelope).await {
                debug!("one-way send dropped: {err}");
            }
        });
    }

    pub fn send_one_way_ordered(&self, envelope: MessageEnvelope, partition_key: impl Into<String>) {
        let partition_key = partition_key.into();
        let lane = self.lane_for(&partition_key);
        let envelope = envelope.with_partition_key(partition_key);
        if let Err(e) = self.lanes[lane].send(envelope) {
            warn!(lane, "ordered lane closed, message dropped: {e}");
        }
    }

    fn lane_for(&self, partition_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Serializes `payload` into the body and sends it synchronously.
    /// Strings are sent as their raw UTF-8 bytes, anything else as JSON.
    pub async fn convert_and_send<T>(&self, destination: &str, payload: &T) -> Result<SendResult>
    where
        T: Serialize + ?Sized,
    {
        self.convert_and_send_with(destination, payload, None, |envelope| envelope)
            .await
    }

    pub async fn convert_and_send_with_headers<T>(
        &self,
        destination: &str,
        payload: &T,
        headers: Headers,
    ) -> Result<SendResult>
    where
        T: Serialize + ?Sized,
    {
        self.convert_and_send_with(destination, payload, Some(headers), |envelope| envelope)
            .await
    }

    /// Like [`convert_and_send`](Self::convert_and_send), letting
    /// `post_process` rewrite the envelope right before it is sent.
    pub async fn convert_and_send_with<T, P>(
        &self,
        destination: &str,
        payload: &T,
        headers: Option<Headers>,
        post_process: P,
    ) -> Result<SendResult>
    where
        T: Serialize + ?Sized,
        P: FnOnce(MessageEnvelope) -> MessageEnvelope,
    {
        let mut envelope = MessageEnvelope::new(destination, to_body(payload)?)?;
        if let Some(headers) = headers {
            envelope = envelope.with_headers(headers);
        }
        self.send(post_process(envelope)).await
    }
}

fn to_body<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>> {
    Ok(match serde_json::to_value(payload)? {
        Value::String(text) => text.into_bytes(),
        other => serde_json::to_vec(&other)?,
    })
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("send_timeout", &self.send_timeout)
            .field("retries", &self.dispatcher.retries)
            .field("ordered_lanes", &self.lanes.len())
            .finish()
    }
}
