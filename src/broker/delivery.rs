//! Delivery loop
//!
//! An `ActiveSubscription` is a registered subscription plus the machinery
//! that feeds it:
//! - concurrent mode spawns one task per delivery, bounded by a semaphore of
//!   `consume_thread_max` permits
//! - ordered mode keeps one lane (channel + task) per partition key and runs
//!   it strictly in sequence; a failing envelope is retried in place so later
//!   envelopes with the same key never overtake it; a lane that stays idle
//!   for `LANE_IDLE_TIMEOUT` is closed
//!
//! A listener invocation succeeds when it returns `Ok`. An `Err` or a panic
//! leaves the message unacknowledged: its attempt counter is bumped and it is
//! redelivered after the backoff. A failure at `attempt == max_redeliveries`
//! routes the envelope to the dead-letter store instead.
//!
//! Shutdown flips `closed`, then takes every permit of the semaphore, which
//! waits for in-flight invocations to finish, and finally closes it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::broker::delay::DelayLadder;
use crate::broker::message::MessageEnvelope;
use crate::broker::topic::TagFilter;
use crate::client::listener::MessageListener;
use crate::client::subscription::{ConsumeMode, MessageModel, RedeliveryBackoff, Subscription};
use crate::persistence::Persistence;
use crate::utils::MqError;

pub type SubscriptionId = u64;

/// First delay level used by ladder backoff (10s in the default ladder).
const FIRST_REDELIVERY_LEVEL: u32 = 3;

/// Lane used by ordered subscriptions for envelopes without a partition key.
const DEFAULT_LANE: &str = "";

/// An ordered lane with nothing to do for this long is closed; the next
/// envelope with its key opens a new one.
pub(crate) const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub max_redeliveries: u32,
    pub backoff: RedeliveryBackoff,
    pub consume_thread_max: usize,
    pub ladder: DelayLadder,
}

impl DeliveryPolicy {
    /// Wait before redelivering an envelope whose delivery just failed at `attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            RedeliveryBackoff::Fixed(delay) => delay,
            RedeliveryBackoff::DelayLadder => {
                let max_level = u32::from(self.ladder.max_level());
                let level = FIRST_REDELIVERY_LEVEL
                    .saturating_add(attempt)
                    .min(max_level);
                // level is within 1..=max_level here
                self.ladder
                    .duration(level as u8)
                    .unwrap_or(Duration::from_secs(1))
            }
        }
    }
}

#[derive(Debug, Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    acked: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Counters of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryStatsSnapshot {
    /// Listener invocations started.
    pub delivered: u64,
    pub acked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

enum Outcome {
    Acked,
    Failed,
    Closed,
}

pub struct ActiveSubscription {
    id: SubscriptionId,
    topic: String,
    tag_filter: TagFilter,
    group: String,
    model: MessageModel,
    mode: ConsumeMode,
    listener: Arc<dyn MessageListener>,
    policy: DeliveryPolicy,
    dead_letters: Persistence,
    gate: Arc<Semaphore>,
    closed: AtomicBool,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<MessageEnvelope>>>,
    stats: DeliveryStats,
}

impl ActiveSubscription {
    pub(crate) fn new(
        id: SubscriptionId,
        subscription: Subscription,
        policy: DeliveryPolicy,
        dead_letters: Persistence,
    ) -> Arc<Self> {
        let permits = policy.consume_thread_max.clamp(1, u32::MAX as usize);
        Arc::new(Self {
            id,
            topic: subscription.topic,
            tag_filter: subscription.tag_filter,
            group: subscription.group,
            model: subscription.model,
            mode: subscription.mode,
            listener: subscription.listener,
            policy,
            dead_letters,
            gate: Arc::new(Semaphore::new(permits)),
            closed: AtomicBool::new(false),
            lanes: Mutex::new(HashMap::new()),
            stats: DeliveryStats::default(),
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn model(&self) -> MessageModel {
        self.model
    }

    pub fn mode(&self) -> ConsumeMode {
        self.mode
    }

    pub fn matches(&self, envelope: &MessageEnvelope) -> bool {
        self.topic == envelope.topic() && self.tag_filter.matches(envelope.tag())
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            acked: self.stats.acked.load(Ordering::Relaxed),
            redelivered: self.stats.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Ordered lanes currently open, one per active partition key.
    pub fn open_lanes(&self) -> usize {
        self.lanes.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Hands an envelope to the subscription. Must run inside a Tokio runtime.
    pub(crate) fn deliver(self: &Arc<Self>, envelope: MessageEnvelope) {
        if self.is_closed() {
            debug!(
                subscription = self.id,
                message_id = ?envelope.message_id(),
                "subscription closed, dropping delivery"
            );
            return;
        }

        match self.mode {
            ConsumeMode::Concurrent => {
                tokio::spawn(self.clone().run_concurrent(envelope));
            }
            ConsumeMode::Ordered => self.enqueue_ordered(envelope),
        }
    }

    fn enqueue_ordered(self: &Arc<Self>, envelope: MessageEnvelope) {
        let key = envelope
            .partition_key()
            .unwrap_or(DEFAULT_LANE)
            .to_string();

        let mut lanes = self.lanes.lock().unwrap();
        let lane = lanes.entry(key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            debug!(subscription = self.id, key, "opening ordered lane");
            tokio::spawn(self.clone().run_lane(key, rx));
            tx
        });

        if let Err(e) = lane.send(envelope) {
            warn!(subscription = self.id, "ordered lane is gone: {e}");
        }
    }

    async fn run_concurrent(self: Arc<Self>, mut envelope: MessageEnvelope) {
        match self.invoke(&envelope).await {
            Outcome::Acked | Outcome::Closed => {}
            Outcome::Failed => {
                if self.exhausted(&envelope) {
                    self.dead_letter(envelope);
                    return;
                }
                let delay = self.policy.backoff_for(envelope.attempt());
                envelope.record_failed_attempt();
                self.stats.redelivered.fetch_add(1, Ordering::Relaxed);

                let this = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.deliver(envelope);
                });
            }
        }
    }

    async fn run_lane(self: Arc<Self>, key: String, mut rx: mpsc::UnboundedReceiver<MessageEnvelope>) {
        loop {
            let mut envelope = match tokio::time::timeout(LANE_IDLE_TIMEOUT, rx.recv()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(_idle) => {
                    // senders push under this lock
                    let mut lanes = self.lanes.lock().unwrap();
                    match rx.try_recv() {
                        Ok(envelope) => envelope,
                        Err(_) => {
                            lanes.remove(&key);
                            break;
                        }
                    }
                }
            };

            loop {
                match self.invoke(&envelope).await {
                    Outcome::Acked => break,
                    Outcome::Closed => return,
                    Outcome::Failed if self.exhausted(&envelope) => {
                        self.dead_letter(envelope);
                        break;
                    }
                    Outcome::Failed => {
                        let delay = self.policy.backoff_for(envelope.attempt());
                        envelope.record_failed_attempt();
                        self.stats.redelivered.fetch_add(1, Ordering::Relaxed);
                        // suspend the lane, nothing behind this envelope may pass it
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        debug!(subscription = self.id, key, "ordered lane closed");
    }

    async fn invoke(&self, envelope: &MessageEnvelope) -> Outcome {
        if self.is_closed() {
            return Outcome::Closed;
        }
        let Ok(_permit) = self.gate.clone().acquire_owned().await else {
            return Outcome::Closed;
        };
        // unsubscribe may have started while waiting for the permit
        if self.is_closed() {
            return Outcome::Closed;
        }

        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        let listener = self.listener.clone();
        let message = envelope.clone();
        let result = tokio::spawn(async move { listener.on_message(message).await }).await;

        let failure = match result {
            Ok(Ok(())) => {
                self.stats.acked.fetch_add(1, Ordering::Relaxed);
                debug!(
                    subscription = self.id,
                    message_id = ?envelope.message_id(),
                    attempt = envelope.attempt(),
                    "acked"
                );
                return Outcome::Acked;
            }
            Ok(Err(e)) => MqError::Callback(e.to_string()),
            Err(join_error) if join_error.is_panic() => {
                MqError::Callback(panic_message(join_error.into_panic()))
            }
            Err(join_error) => MqError::Callback(join_error.to_string()),
        };

        warn!(
            subscription = self.id,
            group = %self.group,
            message_id = ?envelope.message_id(),
            attempt = envelope.attempt(),
            "{failure}"
        );
        Outcome::Failed
    }

    fn exhausted(&self, envelope: &MessageEnvelope) -> bool {
        envelope.attempt() >= self.policy.max_redeliveries
    }

    fn dead_letter(&self, envelope: MessageEnvelope) {
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        warn!(
            subscription = self.id,
            group = %self.group,
            message_id = ?envelope.message_id(),
            attempt = envelope.attempt(),
            "redeliveries exhausted, routing to dead letters"
        );
        if let Err(e) = self.dead_letters.store_dead_letter(&self.group, &envelope) {
            warn!(group = %self.group, "failed to store dead letter: {e}");
        }
    }

    /// Stops new deliveries and waits for in-flight listener calls.
    pub(crate) async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let permits = self.policy.consume_thread_max.clamp(1, u32::MAX as usize) as u32;
        match self.gate.acquire_many(permits).await {
            Ok(drained) => drained.forget(),
            Err(_) => debug!(subscription = self.id, "already drained"),
        }
        self.gate.close();
        self.lanes.lock().unwrap().clear();

        info!(
            subscription = self.id,
            topic = %self.topic,
            group = %self.group,
            "subscription drained"
        );
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("listener panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("listener panicked: {message}")
    } else {
        "listener panicked".to_string()
    }
}
