//! Sample applications wired by the `consume` and `produce` subcommands.

pub mod consumer;
pub mod producer;
