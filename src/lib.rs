//! # tidemq
//!
//! `tidemq` is a small message broker core with the delivery guarantees
//! applications expect from a managed broker client: at-least-once delivery
//! with bounded redelivery and dead letters, ordered delivery per partition
//! key, delayed delivery on a fixed ladder of delay levels, tag filtering,
//! and synchronous, asynchronous and one-way sends.
//!
//! ## Core Modules
//!
//! - `broker`: envelopes, the delay scheduler, the subscription registry and the delivery loop.
//! - `client`: the `Producer`, the remote endpoint, listeners and subscription builders.
//! - `config`: Handles loading and managing configuration.
//! - `persistence`: The sled-backed dead-letter store.
//! - `transport`: The endpoint seam and the WebSocket server for remote producers.
//! - `samples`: The consumer and producer sample applications.
//! - `utils`: Error type and logging.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod samples;
pub mod transport;
pub mod utils;

pub use utils::{MqError, Result};
