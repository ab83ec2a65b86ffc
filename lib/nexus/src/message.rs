//! Logical wire messages. Numeric type codes are part of the protocol and
//! must never change.

use crate::error::SerializedError;
use crate::identity::Identity;
use crate::{MessageId, ResourceId};
use lattice::sequence::Sequence;

static MESSAGE_IDS: Sequence = Sequence::new(1);

/// Mints a process-unique correlation id.
#[inline]
pub fn next_message_id() -> MessageId {
    MESSAGE_IDS.next()
}

/// Sanitized payload tree. After sanitize every extended type is a
/// placeholder string, so plain JSON values are sufficient on the wire.
pub type WireValue = serde_json::Value;

pub mod code {
    pub const GET: u8 = 1;
    pub const SET: u8 = 2;
    pub const APPLY: u8 = 3;
    pub const RES: u8 = 5;
    pub const ERR: u8 = 6;
    pub const RELEASE: u8 = 7;
    pub const BATCH: u8 = 8;
    pub const BATCH_RES: u8 = 9;
    pub const HANDSHAKE_REQ: u8 = 10;
    pub const HANDSHAKE_ACK: u8 = 11;
    pub const HANDSHAKE_REJECT: u8 = 12;
    pub const IDENTITY_UPDATE: u8 = 13;
    pub const CHUNK_START: u8 = 16;
    pub const CHUNK_DATA: u8 = 17;
}

/// One slice of a chunked packet. Mirrors the packet encoding it was cut
/// from: text packets chunk into strings, binary packets into byte runs.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkPayload {
    Text(String),
    Bytes(Vec<u8>),
}

impl ChunkPayload {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            ChunkPayload::Text(text) => text.len(),
            ChunkPayload::Bytes(bytes) => bytes.len(),
        }
    }
}

/// Entry of a BATCH_RES message: `[0, value]` or `[1, error]` on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchEntry {
    Ok(WireValue),
    Err(SerializedError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Get {
        id: MessageId,
        resource: Option<ResourceId>,
        path: Vec<String>,
    },
    Set {
        id: MessageId,
        resource: Option<ResourceId>,
        path: Vec<String>,
        value: WireValue,
    },
    Apply {
        id: MessageId,
        resource: Option<ResourceId>,
        path: Vec<String>,
        args: Vec<WireValue>,
    },
    Response {
        id: MessageId,
        result: WireValue,
    },
    Error {
        id: MessageId,
        error: SerializedError,
    },
    Release {
        resource: ResourceId,
    },
    Batch {
        id: MessageId,
        calls: Vec<Message>,
    },
    BatchResponse {
        id: MessageId,
        results: Vec<BatchEntry>,
    },
    HandshakeRequest {
        id: MessageId,
        identity: Identity,
        assigns: Option<Identity>,
    },
    HandshakeAck {
        id: MessageId,
        identity: Identity,
    },
    HandshakeReject {
        id: MessageId,
        error: SerializedError,
    },
    IdentityUpdate {
        updates: Identity,
    },
    ChunkStart {
        session: u64,
        total_chunks: u32,
        original_id: Option<MessageId>,
        original_type: u8,
    },
    ChunkData {
        session: u64,
        index: u32,
        data: ChunkPayload,
    },
}

impl Message {
    /// The protocol type code.
    pub fn type_code(&self) -> u8 {
        match self {
            Message::Get { .. } => code::GET,
            Message::Set { .. } => code::SET,
            Message::Apply { .. } => code::APPLY,
            Message::Response { .. } => code::RES,
            Message::Error { .. } => code::ERR,
            Message::Release { .. } => code::RELEASE,
            Message::Batch { .. } => code::BATCH,
            Message::BatchResponse { .. } => code::BATCH_RES,
            Message::HandshakeRequest { .. } => code::HANDSHAKE_REQ,
            Message::HandshakeAck { .. } => code::HANDSHAKE_ACK,
            Message::HandshakeReject { .. } => code::HANDSHAKE_REJECT,
            Message::IdentityUpdate { .. } => code::IDENTITY_UPDATE,
            Message::ChunkStart { .. } => code::CHUNK_START,
            Message::ChunkData { .. } => code::CHUNK_DATA,
        }
    }

    /// The correlation id, when the message carries one.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Get { id, .. }
            | Message::Set { id, .. }
            | Message::Apply { id, .. }
            | Message::Response { id, .. }
            | Message::Error { id, .. }
            | Message::Batch { id, .. }
            | Message::BatchResponse { id, .. }
            | Message::HandshakeRequest { id, .. }
            | Message::HandshakeAck { id, .. }
            | Message::HandshakeReject { id, .. } => Some(*id),
            Message::Release { .. }
            | Message::IdentityUpdate { .. }
            | Message::ChunkStart { .. }
            | Message::ChunkData { .. } => None,
        }
    }

    /// True for the messages the logical connection consumes itself.
    #[inline]
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Message::HandshakeRequest { .. } | Message::HandshakeAck { .. } | Message::HandshakeReject { .. }
        )
    }
}
