//! Consumer sample
//!
//! Listens on `springboot-topic` as `consumer-group` (clustering,
//! concurrent), prints every body and then fails on purpose with a division
//! by zero so the message is redelivered. Once a message comes back for the
//! third time the listener gives up on it and acknowledges it.

use std::hint::black_box;

use async_trait::async_trait;
use tracing::warn;

use crate::broker::Broker;
use crate::broker::message::MessageEnvelope;
use crate::broker::registry::RegistrationHandle;
use crate::client::listener::{ListenerResult, MessageListener};
use crate::client::subscription::{ConsumeMode, MessageModel, Subscription};
use crate::utils::Result;

pub const TOPIC: &str = "springboot-topic";
pub const GROUP: &str = "consumer-group";

/// Attempt at which the sample stops failing and acknowledges.
pub const GIVE_UP_AT_ATTEMPT: u32 = 3;

pub struct SampleListener;

#[async_trait]
impl MessageListener for SampleListener {
    async fn on_message(&self, message: MessageEnvelope) -> ListenerResult {
        if message.attempt() == GIVE_UP_AT_ATTEMPT {
            warn!(
                message_id = ?message.message_id(),
                attempt = message.attempt(),
                "giving up on message, acknowledging it"
            );
            return Ok(());
        }

        println!("---------- received message: {}", message.body_str());

        // panics: the delivery loop treats it as a failed consumption
        let divisor = black_box(0_u32);
        let _ = 1 / divisor;
        Ok(())
    }
}

pub fn subscription() -> Result<Subscription> {
    Subscription::builder(TOPIC, GROUP)
        .model(MessageModel::Clustering)
        .mode(ConsumeMode::Concurrent)
        .listener(SampleListener)
        .build()
}

pub fn register(broker: &Broker) -> Result<RegistrationHandle> {
    broker.subscribe(subscription()?)
}
