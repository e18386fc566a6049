//! The `error` module defines the error type shared by every part of `tidemq`.
//!
//! Senders see these errors directly. Listener failures are reported as
//! `Callback` in logs only; they drive redelivery and never reach a sender.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqError>;

#[derive(Debug, Error)]
pub enum MqError {
    /// Malformed topic, tag, delay level or subscription descriptor.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("no reachable broker after {attempts} attempt(s): {reason}")]
    BrokerUnavailable { attempts: u32, reason: String },

    #[error("conflicting subscription for topic '{topic}' in group '{group}'")]
    DuplicateSubscription { topic: String, group: String },

    #[error("listener failed: {0}")]
    Callback(String),

    /// A single failed exchange with the broker endpoint. Retried by the producer.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] sled::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl MqError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether a failed send may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::BrokerUnavailable { .. })
    }
}

impl From<tungstenite::Error> for MqError {
    fn from(err: tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
