use std::future::Future;

use async_trait::async_trait;

use crate::broker::message::MessageEnvelope;

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// `Ok` acknowledges the message; `Err` (or a panic) asks for redelivery.
pub type ListenerResult = Result<(), ListenerError>;

/// Receives the messages of a subscription.
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, message: MessageEnvelope) -> ListenerResult;
}

/// Adapter turning an async closure into a [`MessageListener`].
pub struct ListenerFn<F>(F);

pub fn listener_fn<F, Fut>(f: F) -> ListenerFn<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ListenerResult> + Send + 'static,
{
    ListenerFn(f)
}

#[async_trait]
impl<F, Fut> MessageListener for ListenerFn<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ListenerResult> + Send + 'static,
{
    async fn on_message(&self, message: MessageEnvelope) -> ListenerResult {
        (self.0)(message).await
    }
}
