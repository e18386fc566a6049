//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - accepting envelopes and stamping them with a message id
//! - parking delayed envelopes in the delay scheduler
//! - routing envelopes to matching subscriptions via the registry
//! - exposing the dead-letter store of each consumer group
//!
//! Concurrency and usage notes:
//! - The broker is shared as `Arc<Broker>`; all methods take `&self` and the
//!   internal state is guarded by short-lived locks that are never held
//!   across an `.await`.
//! - `publish` and `subscribe` spawn tasks and must be called from inside a
//!   Tokio runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::broker::delay::{DelayLadder, DelayScheduler};
use crate::broker::delivery::DeliveryPolicy;
use crate::broker::message::{MessageEnvelope, SendResult, SendStatus};
use crate::broker::registry::{RegistrationHandle, SubscriptionRegistry};
use crate::client::subscription::{RedeliveryBackoff, Subscription};
use crate::config::{BrokerSettings, ConsumerSettings, Settings};
use crate::persistence::{DeadLetter, Persistence};
use crate::utils::{MqError, Result};

pub struct Broker {
    registry: SubscriptionRegistry,
    scheduler: DelayScheduler,
    persistence: Persistence,
    consumer: ConsumerSettings,
    running: AtomicBool,
}

impl Broker {
    /// Opens the dead-letter store under `broker.data_dir` and builds a broker.
    pub fn open(settings: &Settings) -> Result<Arc<Self>> {
        let ttl = i64::try_from(settings.broker.dead_letter_ttl_secs).ok();
        let persistence = Persistence::open(&settings.broker.data_dir, ttl)?;
        Self::new_with_persistence(&settings.broker, &settings.consumer, persistence)
    }

    pub fn new_with_persistence(
        broker: &BrokerSettings,
        consumer: &ConsumerSettings,
        persistence: Persistence,
    ) -> Result<Arc<Self>> {
        let ladder = DelayLadder::parse(&broker.delay_levels)?;

        Ok(Arc::new_cyclic(|weak: &Weak<Broker>| {
            let weak = weak.clone();
            let scheduler = DelayScheduler::new(ladder, move |envelope| {
                if let Some(broker) = weak.upgrade() {
                    broker.route(envelope);
                }
            });

            Self {
                registry: SubscriptionRegistry::new(),
                scheduler,
                persistence,
                consumer: consumer.clone(),
                running: AtomicBool::new(true),
            }
        }))
    }

    /// Accepts an envelope for delivery.
    ///
    /// Envelopes carrying a delay level are parked and routed once the level's
    /// duration has elapsed; the result is returned immediately either way.
    pub fn publish(&self, mut envelope: MessageEnvelope) -> Result<SendResult> {
        if !self.is_running() {
            return Err(MqError::BrokerUnavailable {
                attempts: 1,
                reason: "broker is shut down".to_string(),
            });
        }
        envelope.validate()?;

        let message_id = Uuid::new_v4().simple().to_string().to_uppercase();
        envelope.stamp(message_id.clone(), Utc::now().timestamp_millis());
        envelope.reset_attempt();

        match envelope.take_delay_level() {
            Some(level) => self.scheduler.schedule(envelope, level)?,
            None => self.route(envelope),
        }

        Ok(SendResult {
            status: SendStatus::Ok,
            message_id,
        })
    }

    fn route(&self, envelope: MessageEnvelope) {
        let targets = self.registry.targets(&envelope);
        if targets.is_empty() {
            debug!(
                destination = %envelope.destination(),
                message_id = ?envelope.message_id(),
                "no subscription matches, message dropped"
            );
            return;
        }

        trace!(
            destination = %envelope.destination(),
            targets = targets.len(),
            "routing message"
        );
        for target in targets {
            target.deliver(envelope.clone());
        }
    }

    pub fn subscribe(&self, subscription: Subscription) -> Result<RegistrationHandle> {
        let policy = DeliveryPolicy {
            max_redeliveries: subscription
                .max_redeliveries
                .unwrap_or(self.consumer.max_redeliveries),
            backoff: subscription.backoff.unwrap_or(
                match self.consumer.redelivery_backoff_ms {
                    Some(ms) => RedeliveryBackoff::Fixed(Duration::from_millis(ms)),
                    None => RedeliveryBackoff::DelayLadder,
                },
            ),
            consume_thread_max: self.consumer.consume_thread_max,
            ladder: self.scheduler.ladder().clone(),
        };
        self.registry
            .register(subscription, policy, self.persistence.clone())
    }

    /// Detaches the subscription, then waits for its in-flight deliveries.
    pub async fn unsubscribe(&self, handle: RegistrationHandle) {
        match self.registry.remove(&handle) {
            Some(subscription) => subscription.shutdown().await,
            None => debug!(id = handle.id(), "unsubscribe of unknown subscription"),
        }
    }

    pub fn dead_letters(&self, group: &str) -> Result<Vec<DeadLetter>> {
        self.persistence.load_dead_letters(group)
    }

    pub fn pending_delayed(&self, level: u8) -> usize {
        self.scheduler.pending(level)
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Refuses further sends. Subscriptions stay registered until unsubscribed.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("broker shut down");
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("subscriptions", &self.registry.len())
            .field("running", &self.is_running())
            .field("persistence", &self.persistence)
            .finish()
    }
}
