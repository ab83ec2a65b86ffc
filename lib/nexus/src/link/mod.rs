//! The connection layer: logical connection state machines and the
//! registry that creates, resolves and routes them.

pub mod connection;
pub mod manager;
