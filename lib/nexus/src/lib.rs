//! Nexus connects independent execution contexts over point-to-point
//! message channels: typed service proxies, bidirectional callbacks,
//! pass-by-reference for stateful objects, multicast and streaming
//! delivery, and lifecycle-coupled cleanup on disconnect or handle drop.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod error;
pub mod identity;
pub mod link;
pub mod message;
pub mod net;
pub mod nexus;
pub mod rpc;
pub mod value;

pub mod prelude;

/// Process-local id of a ready logical connection.
pub type ConnectionId = u64;

/// Correlation id tying responses to requests.
pub type MessageId = u64;

/// Process-unique id of an interned local resource; never reused.
pub type ResourceId = u64;
