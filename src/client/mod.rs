//! The `client` module holds everything applications use to talk to a broker.
//!
//! - `producer`: the `Producer` send dispatcher and its send modes
//! - `remote`: a `BrokerEndpoint` reaching a broker over WebSockets
//! - `listener`: the `MessageListener` trait consumers implement
//! - `subscription`: the builder binding a listener to a topic and group

pub mod listener;
pub mod producer;
pub mod remote;
pub mod subscription;

pub use listener::{ListenerError, ListenerResult, MessageListener, listener_fn};
pub use producer::Producer;
pub use remote::RemoteEndpoint;
pub use subscription::{ConsumeMode, MessageModel, RedeliveryBackoff, Subscription};
