//! The transport layer: packet codecs, chunked transfer, the raw-port and
//! endpoint adapter contracts, and the in-process reference adapter.

pub mod chunk;
pub mod memory;
pub mod packet;
pub mod port;
