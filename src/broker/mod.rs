pub mod delay;
pub mod delivery;
pub mod engine;
pub mod message;
pub mod registry;
pub mod topic;

pub use engine::Broker;
pub use message::{MessageEnvelope, SendResult, SendStatus};
pub use registry::RegistrationHandle;

#[cfg(test)]
mod tests;
