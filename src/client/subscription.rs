//! Subscription descriptors.
//!
//! A [`Subscription`] binds a listener to a topic, an optional tag filter, a
//! consumer group, a message model and a consume mode. It is built explicitly
//! and handed to [`Broker::subscribe`](crate::broker::Broker::subscribe).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::topic::{TagFilter, validate_topic};
use crate::client::listener::MessageListener;
use crate::utils::{MqError, Result};

/// How the members of a consumer group share a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageModel {
    /// Every message goes to exactly one member of the group.
    #[default]
    Clustering,
    /// Every subscriber receives every message.
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumeMode {
    /// Worker pool, no ordering guarantee.
    #[default]
    Concurrent,
    /// One serialized stream per partition key.
    Ordered,
}

/// Wait between a failed delivery and the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryBackoff {
    /// Failed attempt `n` waits delay level `3 + n` (10s, 30s, 1m, ...).
    DelayLadder,
    Fixed(Duration),
}

pub struct Subscription {
    pub(crate) topic: String,
    pub(crate) tag_filter: TagFilter,
    pub(crate) group: String,
    pub(crate) model: MessageModel,
    pub(crate) mode: ConsumeMode,
    pub(crate) listener: Arc<dyn MessageListener>,
    pub(crate) max_redeliveries: Option<u32>,
    pub(crate) backoff: Option<RedeliveryBackoff>,
}

impl Subscription {
    pub fn builder(topic: impl Into<String>, group: impl Into<String>) -> SubscriptionBuilder {
        SubscriptionBuilder {
            topic: topic.into(),
            group: group.into(),
            selector: None,
            model: MessageModel::default(),
            mode: ConsumeMode::default(),
            listener: None,
            max_redeliveries: None,
            backoff: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn tag_filter(&self) -> &TagFilter {
        &self.tag_filter
    }

    pub fn model(&self) -> MessageModel {
        self.model
    }

    pub fn mode(&self) -> ConsumeMode {
        self.mode
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("tag_filter", &self.tag_filter.to_string())
            .field("group", &self.group)
            .field("model", &self.model)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

pub struct SubscriptionBuilder {
    topic: String,
    group: String,
    selector: Option<String>,
    model: MessageModel,
    mode: ConsumeMode,
    listener: Option<Arc<dyn MessageListener>>,
    max_redeliveries: Option<u32>,
    backoff: Option<RedeliveryBackoff>,
}

impl SubscriptionBuilder {
    /// Tag filter expression: `*`, `tag` or `tag1 || tag2`.
    pub fn selector(mut self, expression: impl Into<String>) -> Self {
        self.selector = Some(expression.into());
        self
    }

    pub fn model(mut self, model: MessageModel) -> Self {
        self.model = model;
        self
    }

    pub fn mode(mut self, mode: ConsumeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn listener(mut self, listener: impl MessageListener) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Overrides `consumer.max_redeliveries` for this subscription.
    pub fn max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = Some(max);
        self
    }

    pub fn backoff(mut self, backoff: RedeliveryBackoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn build(self) -> Result<Subscription> {
        validate_topic(&self.topic)?;
        if self.group.trim().is_empty() {
            return Err(MqError::validation("consumer group must not be empty"));
        }
        let listener = self.listener.ok_or_else(|| {
            MqError::validation(format!("subscription to '{}' has no listener", self.topic))
        })?;
        let tag_filter = match &self.selector {
            Some(expression) => TagFilter::parse(expression)?,
            None => TagFilter::All,
        };

        Ok(Subscription {
            topic: self.topic,
            tag_filter,
            group: self.group,
            model: self.model,
            mode: self.mode,
            listener,
            max_redeliveries: self.max_redeliveries,
            backoff: self.backoff,
        })
    }
}
