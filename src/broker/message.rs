//! Message definitions for the broker
//!
//! `MessageEnvelope` is the unit of transport between producers, the broker
//! and listeners. It is serialized to JSON on the WebSocket transport and
//! for the dead-letter store.
//!
//! Notes on fields:
//! - `topic` / `tag`: routing; the tag is absent or non-empty
//! - `partition_key`: envelopes sharing a key are delivered in send order
//! - `headers`: user properties, string keys to JSON values
//! - `body`: opaque bytes
//! - `attempt`: how many times delivery failed so far, starting at 0; only
//!   the delivery loop changes it
//! - `delay_level`: index into the delay ladder, `1..=MAX_DELAY_LEVEL`
//! - `message_id` / `born_timestamp`: stamped by the broker on acceptance

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::topic::{Destination, validate_tag, validate_topic};
use crate::utils::{MqError, Result};

pub type Headers = BTreeMap<String, Value>;

/// Highest delay level of the fixed ladder (2h).
pub const MAX_DELAY_LEVEL: u8 = 18;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_key: Option<String>,
    #[serde(default)]
    headers: Headers,
    body: Vec<u8>,
    #[serde(default)]
    attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    born_timestamp: Option<i64>,
}

impl MessageEnvelope {
    /// Builds an envelope for `topic` or `topic:tag`.
    ///
    /// ```
    /// use tidemq::broker::message::MessageEnvelope;
    ///
    /// let msg = MessageEnvelope::new("springboot-topic:tag1", "hello").unwrap();
    /// assert_eq!(msg.topic(), "springboot-topic");
    /// assert_eq!(msg.tag(), Some("tag1"));
    /// assert!(MessageEnvelope::new("topic:", "tag empty ?").is_err());
    /// ```
    pub fn new(destination: &str, body: impl Into<Vec<u8>>) -> Result<Self> {
        let Destination { topic, tag } = Destination::parse(destination)?;
        Ok(Self {
            topic,
            tag,
            partition_key: None,
            headers: Headers::new(),
            body: body.into(),
            attempt: 0,
            delay_level: None,
            message_id: None,
            born_timestamp: None,
        })
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_delay_level(mut self, level: u8) -> Result<Self> {
        validate_delay_level(level)?;
        self.delay_level = Some(level);
        Ok(self)
    }

    /// Re-checks the invariants of an envelope that did not come through
    /// [`MessageEnvelope::new`], e.g. one deserialized from the wire.
    pub fn validate(&self) -> Result<()> {
        validate_topic(&self.topic)?;
        if let Some(tag) = &self.tag {
            validate_tag(tag)?;
        }
        if let Some(level) = self.delay_level {
            validate_delay_level(level)?;
        }
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn delay_level(&self) -> Option<u8> {
        self.delay_level
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn born_timestamp(&self) -> Option<i64> {
        self.born_timestamp
    }

    /// `topic` or `topic:tag`.
    pub fn destination(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}:{}", self.topic, tag),
            None => self.topic.clone(),
        }
    }

    pub(crate) fn stamp(&mut self, message_id: String, born_timestamp: i64) {
        self.message_id = Some(message_id);
        self.born_timestamp = Some(born_timestamp);
    }

    pub(crate) fn take_delay_level(&mut self) -> Option<u8> {
        self.delay_level.take()
    }

    /// A freshly accepted envelope starts with its whole redelivery budget.
    pub(crate) fn reset_attempt(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn record_failed_attempt(&mut self) {
        self.attempt += 1;
    }
}

fn validate_delay_level(level: u8) -> Result<()> {
    if !(1..=MAX_DELAY_LEVEL).contains(&level) {
        return Err(MqError::validation(format!(
            "delay level {level} is outside 1..={MAX_DELAY_LEVEL}"
        )));
    }
    Ok(())
}

/// Outcome reported by the broker for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    #[serde(rename = "SEND_OK")]
    Ok,
    FlushSlaveTimeout,
    SlaveNotAvailable,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub status: SendStatus,
    pub message_id: String,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "SEND_OK",
            Self::FlushSlaveTimeout => "FLUSH_SLAVE_TIMEOUT",
            Self::SlaveNotAvailable => "SLAVE_NOT_AVAILABLE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for SendResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SendResult [status={}, msgId={}]",
            self.status, self.message_id
        )
    }
}
