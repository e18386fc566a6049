//! The `utils` module provides the pieces shared across `tidemq`:
//! the crate-wide error type and logging initialisation.

pub mod error;
pub mod logging;

pub use error::{MqError, Result};
