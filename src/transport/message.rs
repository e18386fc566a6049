use serde::{Deserialize, Serialize};

use crate::broker::message::{MessageEnvelope, SendResult};
use crate::utils::MqError;

/// Frames sent by producers to the broker.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Answered with `send_result` or `error` carrying the same `request_id`.
    Send {
        request_id: String,
        envelope: MessageEnvelope,
    },

    /// Never answered.
    SendOneWay { envelope: MessageEnvelope },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Unavailable,
    Internal,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SendResult {
        request_id: String,
        result: SendResult,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        kind: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(request_id: Option<String>, err: &MqError) -> Self {
        let kind = match err {
            MqError::Validation(_) => ErrorKind::Validation,
            MqError::BrokerUnavailable { .. } => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        };
        Self::Error {
            request_id,
            kind,
            message: err.to_string(),
        }
    }
}

impl ErrorKind {
    /// Rebuilds the producer-side error for a broker reply.
    pub fn into_error(self, message: String) -> MqError {
        match self {
            Self::Validation => MqError::Validation(message),
            Self::Unavailable => MqError::BrokerUnavailable {
                attempts: 1,
                reason: message,
            },
            Self::Internal => MqError::Transport(message),
        }
    }
}
