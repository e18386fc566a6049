//! The `persistence` module keeps messages that outlive their delivery.
//!
//! Envelopes that exhaust their redeliveries are routed to a per-group
//! dead-letter tree (`%DLQ%<group>`) in an embedded `sled` database, where
//! they can be inspected until their retention TTL expires.

pub mod sled_store;

pub use sled_store::{DeadLetter, Persistence};
