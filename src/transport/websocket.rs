//! WebSocket transport
//!
//! A minimal WebSocket server that lets remote producers hand envelopes to
//! the broker. Responsibilities:
//! - Accept TCP/WebSocket connections
//! - Deserialize `ClientMessage` frames and forward them to the `Broker`
//! - Answer `send` requests with `send_result` or `error`, matched by
//!   `request_id`; `send_one_way` frames are never answered
//!
//! Each connection gets a writer task fed by an unbounded channel, so the
//! read loop never waits on the socket while talking to the broker.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Broker;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::{MqError, Result};

pub async fn start_websocket_server(addr: &str, broker: Arc<Broker>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| MqError::Transport(format!("can't bind {addr}: {e}")))?;
    serve(listener, broker).await
}

/// Runs the accept loop on an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|e| MqError::Transport(e.to_string()))?;
    info!("WebSocket broker listening on ws://{local}");

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| MqError::Transport(format!("accept failed: {e}")))?;
        spawn(handle_connection(stream, peer, broker.clone()));
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Arc<Broker>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error from {peer}: {e}");
            return;
        }
    };
    debug!("{peer} connected");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    // broker -> producer
    spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                warn!("Failed to send reply to {peer}: {e}");
                break;
            }
        }
        debug!("Send loop closed for {peer}");
    });

    while let Some(frame) = ws_receiver.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Read error from {peer}: {e}");
                break;
            }
        };

        let Some(reply) = handle_client_message(&broker, text.as_str()) else {
            continue;
        };
        match serde_json::to_string(&reply) {
            Ok(json) => {
                if tx.send(WsMessage::text(json)).is_err() {
                    break;
                }
            }
            Err(e) => warn!("Failed to serialize reply for {peer}: {e}"),
        }
    }

    debug!("{peer} disconnected");
}

/// Applies one client frame to the broker and returns the reply, if any.
pub(crate) fn handle_client_message(broker: &Broker, text: &str) -> Option<ServerMessage> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Send {
            request_id,
            envelope,
        }) => Some(match broker.publish(envelope) {
            Ok(result) => ServerMessage::SendResult { request_id, result },
            Err(err) => ServerMessage::error(Some(request_id), &err),
        }),
        Ok(ClientMessage::SendOneWay { envelope }) => {
            if let Err(err) = broker.publish(envelope) {
                debug!("one-way send rejected: {err}");
            }
            None
        }
        Err(err) => {
            warn!(
                "Invalid client message: {err} | {}",
                text.chars().take(100).collect::<String>()
            );
            Some(ServerMessage::error(None, &MqError::Serialization(err)))
        }
    }
}
