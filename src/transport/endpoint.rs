use async_trait::async_trait;

use crate::broker::Broker;
use crate::broker::message::{MessageEnvelope, SendResult};
use crate::utils::Result;

/// Something a producer can hand envelopes to: the in-process broker or a
/// remote one reached over the network.
#[async_trait]
pub trait BrokerEndpoint: Send + Sync + 'static {
    /// Resolves once the broker has accepted the envelope.
    async fn send(&self, envelope: MessageEnvelope) -> Result<SendResult>;

    /// Hands the envelope over without waiting for the broker's answer.
    async fn send_one_way(&self, envelope: MessageEnvelope) -> Result<()> {
        self.send(envelope).await.map(|_| ())
    }
}

#[async_trait]
impl BrokerEndpoint for Broker {
    async fn send(&self, envelope: MessageEnvelope) -> Result<SendResult> {
        self.publish(envelope)
    }
}
