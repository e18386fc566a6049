//! Remote broker endpoint
//!
//! Talks to a broker's WebSocket server. One connection is shared by every
//! send; it is opened on first use and reopened on the next send after it
//! breaks, so callers only ever see a failed attempt (which the producer
//! retries) rather than a dead connection.
//!
//! Replies are matched to requests by `request_id`. A request whose caller
//! gave up (timeout, dropped future) removes itself from the pending table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::message::{MessageEnvelope, SendResult};
use crate::transport::BrokerEndpoint;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::{MqError, Result};

type Reply = Result<SendResult>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

struct Connection {
    outbound: mpsc::UnboundedSender<WsMessage>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
}

impl Connection {
    async fn open(url: &str) -> Result<Self> {
        let (ws_stream, _response) = connect_async(url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        {
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = ws_sender.send(msg).await {
                        warn!("Failed to write to broker: {e}");
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
            });
        }

        {
            let pending = pending.clone();
            let closed = closed.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                while let Some(frame) = ws_receiver.next().await {
                    let text = match frame {
                        Ok(WsMessage::Text(text)) => text,
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("Read error from {url}: {e}");
                            break;
                        }
                    };
                    match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(ServerMessage::SendResult { request_id, result }) => {
                            resolve(&pending, &request_id, Ok(result));
                        }
                        Ok(ServerMessage::Error {
                            request_id: Some(request_id),
                            kind,
                            message,
                        }) => {
                            resolve(&pending, &request_id, Err(kind.into_error(message)));
                        }
                        Ok(ServerMessage::Error { message, .. }) => {
                            warn!("Broker reported an error: {message}");
                        }
                        Err(e) => warn!("Unreadable frame from {url}: {e}"),
                    }
                }

                closed.store(true, Ordering::SeqCst);
                // dropping the senders fails every waiting request
                pending.lock().unwrap().clear();
                debug!("connection to {url} closed");
            });
        }

        Ok(Self {
            outbound: tx,
            pending,
            closed,
        })
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    fn write(&self, frame: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.outbound
            .send(WsMessage::text(json))
            .map_err(|_| MqError::Transport("connection closed".to_string()))
    }
}

fn resolve(pending: &PendingMap, request_id: &str, reply: Reply) {
    match pending.lock().unwrap().remove(request_id) {
        Some(waiter) => {
            let _ = waiter.send(reply);
        }
        None => debug!(request_id, "reply for a request nobody waits for"),
    }
}

/// Removes its request from the pending table when the caller stops waiting.
struct PendingRequest {
    pending: PendingMap,
    request_id: String,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(&self.request_id);
    }
}

pub struct RemoteEndpoint {
    url: String,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl RemoteEndpoint {
    /// No connection is made until the first send.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref().filter(|c| c.is_open()) {
            return Ok(connection.clone());
        }

        let connection = Arc::new(Connection::open(&self.url).await?);
        info!("connected to broker at {}", self.url);
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn reset(&self, broken: &Arc<Connection>) {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, broken)) {
            *slot = None;
        }
    }
}

#[async_trait]
impl BrokerEndpoint for RemoteEndpoint {
    async fn send(&self, envelope: MessageEnvelope) -> Result<SendResult> {
        let connection = self.connection().await?;
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        connection
            .pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);
        let _guard = PendingRequest {
            pending: connection.pending.clone(),
            request_id: request_id.clone(),
        };
        // the reader marks the connection closed before it clears `pending`,
        // so a close that raced the insert above is seen here
        if connection.closed.load(Ordering::SeqCst) {
            self.reset(&connection).await;
            return Err(MqError::Transport(
                "connection closed before the request was sent".to_string(),
            ));
        }

        if let Err(err) = connection.write(&ClientMessage::Send {
            request_id,
            envelope,
        }) {
            self.reset(&connection).await;
            return Err(err);
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => {
                self.reset(&connection).await;
                Err(MqError::Transport(
                    "connection lost before the broker replied".to_string(),
                ))
            }
        }
    }

    async fn send_one_way(&self, envelope: MessageEnvelope) -> Result<()> {
        let connection = self.connection().await?;
        if let Err(err) = connection.write(&ClientMessage::SendOneWay { envelope }) {
            self.reset(&connection).await;
            return Err(err);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("url", &self.url)
            .finish()
    }
}
