//! The `transport` module is responsible for moving envelopes between
//! producers and the broker.
//!
//! It defines the `BrokerEndpoint` seam producers send through, the JSON
//! protocol spoken over WebSockets, and the WebSocket server that forwards
//! remote sends to the broker.

pub mod endpoint;
pub mod message;
pub mod websocket;

pub use endpoint::BrokerEndpoint;
