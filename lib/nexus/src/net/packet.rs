//! Packet codecs. Both codecs carry the same logical form: the JSON codec
//! emits positional arrays `[code, fields...]`, the binary codec emits
//! big-endian scalars with length-prefixed UTF-8 segments. Payload values are
//! already sanitized JSON trees, so both codecs embed them as JSON text.

use crate::error::{ProtocolError, SerializedError};
use crate::identity::Identity;
use crate::message::{code, BatchEntry, ChunkPayload, Message, WireValue};
use crate::{MessageId, ResourceId};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use serde_json::json;
use serde_json::Value as Json;
use std::io::{Cursor, Read, Write};

/// Nesting bound for BATCH recursion; deeper packets are rejected rather
/// than recursed.
const MAX_BATCH_DEPTH: usize = 4;

/// An encoded message ready for a raw port. Binary payloads are shared
/// buffers so the port layer can list them as transferables without a
/// copy.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Text(String),
    Binary(Bytes),
}

impl Packet {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Packet::Text(text) => text.len(),
            Packet::Binary(bytes) => bytes.len(),
        }
    }
}

pub trait PacketCodec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<Packet, ProtocolError>;
    fn decode(&self, packet: &Packet) -> Result<Message, ProtocolError>;
}

/// Positional-array JSON packets.
pub struct JsonCodec;

/// Byte packets for channels that support zero-copy transfer.
pub struct BinaryCodec;

impl PacketCodec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<Packet, ProtocolError> {
        let array = encode_json(message, 0)?;
        Ok(Packet::Text(serde_json::to_string(&array)?))
    }

    fn decode(&self, packet: &Packet) -> Result<Message, ProtocolError> {
        let text = match packet {
            Packet::Text(text) => text,
            Packet::Binary(_) => {
                return Err(ProtocolError::MalformedPacket(
                    "binary packet handed to the JSON codec".to_string(),
                ))
            }
        };

        let array: Json = serde_json::from_str(text)?;
        decode_json(&array, 0)
    }
}

impl PacketCodec for BinaryCodec {
    fn encode(&self, message: &Message) -> Result<Packet, ProtocolError> {
        let mut buffer = Vec::with_capacity(64);
        encode_binary(message, &mut buffer, 0)?;
        Ok(Packet::Binary(Bytes::from(buffer)))
    }

    fn decode(&self, packet: &Packet) -> Result<Message, ProtocolError> {
        let bytes = match packet {
            Packet::Binary(bytes) => bytes,
            Packet::Text(_) => {
                return Err(ProtocolError::MalformedPacket(
                    "text packet handed to the binary codec".to_string(),
                ))
            }
        };

        let mut cursor = Cursor::new(bytes.as_ref());
        let message = decode_binary(&mut cursor, 0)?;

        if cursor.position() as usize != bytes.len() {
            return Err(ProtocolError::MalformedPacket("trailing bytes".to_string()));
        }

        Ok(message)
    }
}

// --- JSON form -------------------------------------------------------------

fn encode_json(message: &Message, depth: usize) -> Result<Json, ProtocolError> {
    let array = match message {
        Message::Get { id, resource, path } => {
            json!([code::GET, id, resource, path])
        }
        Message::Set {
            id,
            resource,
            path,
            value,
        } => json!([code::SET, id, resource, path, value]),
        Message::Apply {
            id,
            resource,
            path,
            args,
        } => json!([code::APPLY, id, resource, path, args]),
        Message::Response { id, result } => json!([code::RES, id, result]),
        Message::Error { id, error } => json!([code::ERR, id, error_json(error)?]),
        Message::Release { resource } => json!([code::RELEASE, Json::Null, resource]),
        Message::Batch { id, calls } => {
            if depth >= MAX_BATCH_DEPTH {
                return Err(ProtocolError::MalformedPacket("batch nesting too deep".to_string()));
            }

            let nested = calls
                .iter()
                .map(|call| encode_json(call, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            json!([code::BATCH, id, nested])
        }
        Message::BatchResponse { id, results } => {
            let entries = results
                .iter()
                .map(|entry| match entry {
                    BatchEntry::Ok(value) => Ok(json!([0, value])),
                    BatchEntry::Err(error) => Ok(json!([1, error_json(error)?])),
                })
                .collect::<Result<Vec<_>, ProtocolError>>()?;
            json!([code::BATCH_RES, id, entries])
        }
        Message::HandshakeRequest { id, identity, assigns } => {
            json!([code::HANDSHAKE_REQ, id, identity, assigns])
        }
        Message::HandshakeAck { id, identity } => json!([code::HANDSHAKE_ACK, id, identity]),
        Message::HandshakeReject { id, error } => json!([code::HANDSHAKE_REJECT, id, error_json(error)?]),
        Message::IdentityUpdate { updates } => json!([code::IDENTITY_UPDATE, Json::Null, updates]),
        Message::ChunkStart {
            session,
            total_chunks,
            original_id,
            original_type,
        } => json!([code::CHUNK_START, session, total_chunks, original_id, original_type]),
        Message::ChunkData { session, index, data } => {
            let payload = match data {
                ChunkPayload::Text(text) => Json::String(text.clone()),
                ChunkPayload::Bytes(bytes) => json!(bytes),
            };
            json!([code::CHUNK_DATA, session, index, payload])
        }
    };

    Ok(array)
}

fn decode_json(packet: &Json, depth: usize) -> Result<Message, ProtocolError> {
    let fields = packet
        .as_array()
        .ok_or_else(|| ProtocolError::MalformedPacket("packet is not an array".to_string()))?;

    let type_code = field(fields, 0)?
        .as_u64()
        .ok_or_else(|| ProtocolError::MalformedPacket("type code is not a number".to_string()))?;

    let message = match type_code as u8 {
        code::GET => Message::Get {
            id: message_id(fields, 1)?,
            resource: opt_resource(fields, 2)?,
            path: path(fields, 3)?,
        },
        code::SET => Message::Set {
            id: message_id(fields, 1)?,
            resource: opt_resource(fields, 2)?,
            path: path(fields, 3)?,
            value: field(fields, 4)?.clone(),
        },
        code::APPLY => Message::Apply {
            id: message_id(fields, 1)?,
            resource: opt_resource(fields, 2)?,
            path: path(fields, 3)?,
            args: field(fields, 4)?
                .as_array()
                .ok_or_else(|| ProtocolError::MalformedPacket("args is not an array".to_string()))?
                .to_vec(),
        },
        code::RES => Message::Response {
            id: message_id(fields, 1)?,
            result: field(fields, 2)?.clone(),
        },
        code::ERR => Message::Error {
            id: message_id(fields, 1)?,
            error: error_from_json(field(fields, 2)?)?,
        },
        code::RELEASE => Message::Release {
            resource: field(fields, 2)?
                .as_u64()
                .ok_or_else(|| ProtocolError::MalformedPacket("resource id is not a number".to_string()))?,
        },
        code::BATCH => {
            if depth >= MAX_BATCH_DEPTH {
                return Err(ProtocolError::MalformedPacket("batch nesting too deep".to_string()));
            }

            let calls = field(fields, 2)?
                .as_array()
                .ok_or_else(|| ProtocolError::MalformedPacket("batch calls is not an array".to_string()))?
                .iter()
                .map(|call| decode_json(call, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            Message::Batch {
                id: message_id(fields, 1)?,
                calls,
            }
        }
        code::BATCH_RES => {
            let results = field(fields, 2)?
                .as_array()
                .ok_or_else(|| ProtocolError::MalformedPacket("batch results is not an array".to_string()))?
                .iter()
                .map(batch_entry_from_json)
                .collect::<Result<Vec<_>, _>>()?;
            Message::BatchResponse {
                id: message_id(fields, 1)?,
                results,
            }
        }
        code::HANDSHAKE_REQ => Message::HandshakeRequest {
            id: message_id(fields, 1)?,
            identity: identity_from_json(field(fields, 2)?)?,
            assigns: match fields.get(3) {
                None | Some(Json::Null) => None,
                Some(value) => Some(identity_from_json(value)?),
            },
        },
        code::HANDSHAKE_ACK => Message::HandshakeAck {
            id: message_id(fields, 1)?,
            identity: identity_from_json(field(fields, 2)?)?,
        },
        code::HANDSHAKE_REJECT => Message::HandshakeReject {
            id: message_id(fields, 1)?,
            error: error_from_json(field(fields, 2)?)?,
        },
        code::IDENTITY_UPDATE => Message::IdentityUpdate {
            updates: identity_from_json(field(fields, 2)?)?,
        },
        code::CHUNK_START => Message::ChunkStart {
            session: field(fields, 1)?
                .as_u64()
                .ok_or_else(|| ProtocolError::MalformedPacket("session id is not a number".to_string()))?,
            total_chunks: field(fields, 2)?
                .as_u64()
                .ok_or_else(|| ProtocolError::MalformedPacket("total chunks is not a number".to_string()))?
                as u32,
            original_id: match field(fields, 3)? {
                Json::Null => None,
                value => Some(value.as_u64().ok_or_else(|| {
                    ProtocolError::MalformedPacket("original id is not a number".to_string())
                })?),
            },
            original_type: field(fields, 4)?
                .as_u64()
                .ok_or_else(|| ProtocolError::MalformedPacket("original type is not a number".to_string()))?
                as u8,
        },
        code::CHUNK_DATA => Message::ChunkData {
            session: field(fields, 1)?
                .as_u64()
                .ok_or_else(|| ProtocolError::MalformedPacket("session id is not a number".to_string()))?,
            index: field(fields, 2)?
                .as_u64()
                .ok_or_else(|| ProtocolError::MalformedPacket("chunk index is not a number".to_string()))?
                as u32,
            data: match field(fields, 3)? {
                Json::String(text) => ChunkPayload::Text(text.clone()),
                Json::Array(items) => ChunkPayload::Bytes(
                    items
                        .iter()
                        .map(|item| {
                            item.as_u64()
                                .filter(|byte| *byte <= u64::from(u8::max_value()))
                                .map(|byte| byte as u8)
                                .ok_or_else(|| {
                                    ProtocolError::MalformedPacket("chunk byte out of range".to_string())
                                })
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                _ => {
                    return Err(ProtocolError::MalformedPacket(
                        "chunk data is neither text nor bytes".to_string(),
                    ))
                }
            },
        },
        unknown => return Err(ProtocolError::UnknownMessageType(unknown)),
    };

    Ok(message)
}

#[inline]
fn field(fields: &[Json], index: usize) -> Result<&Json, ProtocolError> {
    fields
        .get(index)
        .ok_or_else(|| ProtocolError::MalformedPacket(format!("missing field {}", index)))
}

#[inline]
fn message_id(fields: &[Json], index: usize) -> Result<MessageId, ProtocolError> {
    field(fields, index)?
        .as_u64()
        .ok_or_else(|| ProtocolError::MalformedPacket("message id is not a number".to_string()))
}

#[inline]
fn opt_resource(fields: &[Json], index: usize) -> Result<Option<ResourceId>, ProtocolError> {
    match field(fields, index)? {
        Json::Null => Ok(None),
        value => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| ProtocolError::MalformedPacket("resource id is not a number".to_string())),
    }
}

fn path(fields: &[Json], index: usize) -> Result<Vec<String>, ProtocolError> {
    field(fields, index)?
        .as_array()
        .ok_or_else(|| ProtocolError::MalformedPacket("path is not an array".to_string()))?
        .iter()
        .map(|segment| {
            segment
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::MalformedPacket("path segment is not a string".to_string()))
        })
        .collect()
}

#[inline]
fn error_json(error: &SerializedError) -> Result<Json, ProtocolError> {
    serde_json::to_value(error).map_err(Into::into)
}

#[inline]
fn error_from_json(value: &Json) -> Result<SerializedError, ProtocolError> {
    serde_json::from_value(value.clone()).map_err(Into::into)
}

fn identity_from_json(value: &Json) -> Result<Identity, ProtocolError> {
    match value {
        Json::Object(map) => Ok(map.clone()),
        _ => Err(ProtocolError::MalformedPacket("identity is not an object".to_string())),
    }
}

fn batch_entry_from_json(value: &Json) -> Result<BatchEntry, ProtocolError> {
    let fields = value
        .as_array()
        .ok_or_else(|| ProtocolError::MalformedPacket("batch entry is not an array".to_string()))?;

    match field(fields, 0)?.as_u64() {
        Some(0) => Ok(BatchEntry::Ok(field(fields, 1)?.clone())),
        Some(1) => Ok(BatchEntry::Err(error_from_json(field(fields, 1)?)?)),
        _ => Err(ProtocolError::MalformedPacket("invalid batch entry tag".to_string())),
    }
}

// --- Binary form -----------------------------------------------------------

fn encode_binary(message: &Message, out: &mut Vec<u8>, depth: usize) -> Result<(), ProtocolError> {
    out.write_u8(message.type_code())?;

    match message {
        Message::Get { id, resource, path } => {
            out.write_u64::<BigEndian>(*id)?;
            write_opt_u64(out, *resource)?;
            write_path(out, path)?;
        }
        Message::Set {
            id,
            resource,
            path,
            value,
        } => {
            out.write_u64::<BigEndian>(*id)?;
            write_opt_u64(out, *resource)?;
            write_path(out, path)?;
            write_json(out, value)?;
        }
        Message::Apply {
            id,
            resource,
            path,
            args,
        } => {
            out.write_u64::<BigEndian>(*id)?;
            write_opt_u64(out, *resource)?;
            write_path(out, path)?;
            out.write_u16::<BigEndian>(args.len() as u16)?;
            for arg in args {
                write_json(out, arg)?;
            }
        }
        Message::Response { id, result } => {
            out.write_u64::<BigEndian>(*id)?;
            write_json(out, result)?;
        }
        Message::Error { id, error } => {
            out.write_u64::<BigEndian>(*id)?;
            write_json(out, &error_json(error)?)?;
        }
        Message::Release { resource } => {
            out.write_u64::<BigEndian>(*resource)?;
        }
        Message::Batch { id, calls } => {
            if depth >= MAX_BATCH_DEPTH {
                return Err(ProtocolError::MalformedPacket("batch nesting too deep".to_string()));
            }

            out.write_u64::<BigEndian>(*id)?;
            out.write_u16::<BigEndian>(calls.len() as u16)?;
            for call in calls {
                let mut nested = Vec::with_capacity(32);
                encode_binary(call, &mut nested, depth + 1)?;
                write_bytes(out, &nested)?;
            }
        }
        Message::BatchResponse { id, results } => {
            out.write_u64::<BigEndian>(*id)?;
            out.write_u16::<BigEndian>(results.len() as u16)?;
            for entry in results {
                match entry {
                    BatchEntry::Ok(value) => {
                        out.write_u8(0)?;
                        write_json(out, value)?;
                    }
                    BatchEntry::Err(error) => {
                        out.write_u8(1)?;
                        write_json(out, &error_json(error)?)?;
                    }
                }
            }
        }
        Message::HandshakeRequest { id, identity, assigns } => {
            out.write_u64::<BigEndian>(*id)?;
            write_json(out, &Json::Object(identity.clone()))?;
            match assigns {
                Some(assigns) => {
                    out.write_u8(1)?;
                    write_json(out, &Json::Object(assigns.clone()))?;
                }
                None => out.write_u8(0)?,
            }
        }
        Message::HandshakeAck { id, identity } => {
            out.write_u64::<BigEndian>(*id)?;
            write_json(out, &Json::Object(identity.clone()))?;
        }
        Message::HandshakeReject { id, error } => {
            out.write_u64::<BigEndian>(*id)?;
            write_json(out, &error_json(error)?)?;
        }
        Message::IdentityUpdate { updates } => {
            write_json(out, &Json::Object(updates.clone()))?;
        }
        Message::ChunkStart {
            session,
            total_chunks,
            original_id,
            original_type,
        } => {
            out.write_u64::<BigEndian>(*session)?;
            out.write_u32::<BigEndian>(*total_chunks)?;
            write_opt_u64(out, *original_id)?;
            out.write_u8(*original_type)?;
        }
        Message::ChunkData { session, index, data } => {
            out.write_u64::<BigEndian>(*session)?;
            out.write_u32::<BigEndian>(*index)?;
            match data {
                ChunkPayload::Text(text) => {
                    out.write_u8(0)?;
                    write_bytes(out, text.as_bytes())?;
                }
                ChunkPayload::Bytes(bytes) => {
                    out.write_u8(1)?;
                    write_bytes(out, bytes)?;
                }
            }
        }
    }

    Ok(())
}

fn decode_binary(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Message, ProtocolError> {
    let type_code = cursor.read_u8()?;

    let message = match type_code {
        code::GET => Message::Get {
            id: cursor.read_u64::<BigEndian>()?,
            resource: read_opt_u64(cursor)?,
            path: read_path(cursor)?,
        },
        code::SET => Message::Set {
            id: cursor.read_u64::<BigEndian>()?,
            resource: read_opt_u64(cursor)?,
            path: read_path(cursor)?,
            value: read_json(cursor)?,
        },
        code::APPLY => {
            let id = cursor.read_u64::<BigEndian>()?;
            let resource = read_opt_u64(cursor)?;
            let path = read_path(cursor)?;
            let count = cursor.read_u16::<BigEndian>()?;
            let mut args = Vec::with_capacity(count as usize);
            for _ in 0..count {
                args.push(read_json(cursor)?);
            }
            Message::Apply {
                id,
                resource,
                path,
                args,
            }
        }
        code::RES => Message::Response {
            id: cursor.read_u64::<BigEndian>()?,
            result: read_json(cursor)?,
        },
        code::ERR => Message::Error {
            id: cursor.read_u64::<BigEndian>()?,
            error: error_from_json(&read_json(cursor)?)?,
        },
        code::RELEASE => Message::Release {
            resource: cursor.read_u64::<BigEndian>()?,
        },
        code::BATCH => {
            if depth >= MAX_BATCH_DEPTH {
                return Err(ProtocolError::MalformedPacket("batch nesting too deep".to_string()));
            }

            let id = cursor.read_u64::<BigEndian>()?;
            let count = cursor.read_u16::<BigEndian>()?;
            let mut calls = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let nested = read_bytes(cursor)?;
                let mut nested_cursor = Cursor::new(nested.as_slice());
                calls.push(decode_binary(&mut nested_cursor, depth + 1)?);
            }
            Message::Batch { id, calls }
        }
        code::BATCH_RES => {
            let id = cursor.read_u64::<BigEndian>()?;
            let count = cursor.read_u16::<BigEndian>()?;
            let mut results = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let entry = match cursor.read_u8()? {
                    0 => BatchEntry::Ok(read_json(cursor)?),
                    1 => BatchEntry::Err(error_from_json(&read_json(cursor)?)?),
                    _ => {
                        return Err(ProtocolError::MalformedPacket("invalid batch entry tag".to_string()))
                    }
                };
                results.push(entry);
            }
            Message::BatchResponse { id, results }
        }
        code::HANDSHAKE_REQ => {
            let id = cursor.read_u64::<BigEndian>()?;
            let identity = identity_from_json(&read_json(cursor)?)?;
            let assigns = match cursor.read_u8()? {
                0 => None,
                _ => Some(identity_from_json(&read_json(cursor)?)?),
            };
            Message::HandshakeRequest { id, identity, assigns }
        }
        code::HANDSHAKE_ACK => Message::HandshakeAck {
            id: cursor.read_u64::<BigEndian>()?,
            identity: identity_from_json(&read_json(cursor)?)?,
        },
        code::HANDSHAKE_REJECT => Message::HandshakeReject {
            id: cursor.read_u64::<BigEndian>()?,
            error: error_from_json(&read_json(cursor)?)?,
        },
        code::IDENTITY_UPDATE => Message::IdentityUpdate {
            updates: identity_from_json(&read_json(cursor)?)?,
        },
        code::CHUNK_START => Message::ChunkStart {
            session: cursor.read_u64::<BigEndian>()?,
            total_chunks: cursor.read_u32::<BigEndian>()?,
            original_id: read_opt_u64(cursor)?,
            original_type: cursor.read_u8()?,
        },
        code::CHUNK_DATA => {
            let session = cursor.read_u64::<BigEndian>()?;
            let index = cursor.read_u32::<BigEndian>()?;
            let data = match cursor.read_u8()? {
                0 => ChunkPayload::Text(
                    String::from_utf8(read_bytes(cursor)?)
                        .map_err(|_| ProtocolError::MalformedPacket("chunk text is not UTF-8".to_string()))?,
                ),
                _ => ChunkPayload::Bytes(read_bytes(cursor)?),
            };
            Message::ChunkData { session, index, data }
        }
        unknown => return Err(ProtocolError::UnknownMessageType(unknown)),
    };

    Ok(message)
}

#[inline]
fn write_opt_u64(out: &mut Vec<u8>, value: Option<u64>) -> Result<(), ProtocolError> {
    match value {
        Some(value) => {
            out.write_u8(1)?;
            out.write_u64::<BigEndian>(value)?;
        }
        None => out.write_u8(0)?,
    }
    Ok(())
}

#[inline]
fn read_opt_u64(cursor: &mut Cursor<&[u8]>) -> Result<Option<u64>, ProtocolError> {
    match cursor.read_u8()? {
        0 => Ok(None),
        _ => Ok(Some(cursor.read_u64::<BigEndian>()?)),
    }
}

fn write_path(out: &mut Vec<u8>, path: &[String]) -> Result<(), ProtocolError> {
    out.write_u16::<BigEndian>(path.len() as u16)?;
    for segment in path {
        write_bytes(out, segment.as_bytes())?;
    }
    Ok(())
}

fn read_path(cursor: &mut Cursor<&[u8]>) -> Result<Vec<String>, ProtocolError> {
    let count = cursor.read_u16::<BigEndian>()?;
    let mut path = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let bytes = read_bytes(cursor)?;
        path.push(
            String::from_utf8(bytes)
                .map_err(|_| ProtocolError::MalformedPacket("path segment is not UTF-8".to_string()))?,
        );
    }
    Ok(path)
}

#[inline]
fn write_json(out: &mut Vec<u8>, value: &Json) -> Result<(), ProtocolError> {
    write_bytes(out, serde_json::to_vec(value)?.as_slice())
}

#[inline]
fn read_json(cursor: &mut Cursor<&[u8]>) -> Result<WireValue, ProtocolError> {
    let bytes = read_bytes(cursor)?;
    serde_json::from_slice(&bytes).map_err(Into::into)
}

#[inline]
fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), ProtocolError> {
    out.write_u32::<BigEndian>(bytes.len() as u32)?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, ProtocolError> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;

    if len > remaining {
        return Err(ProtocolError::MalformedPacket("length prefix past packet end".to_string()));
    }

    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_messages() -> Vec<Message> {
        vec![
            Message::Get {
                id: 1,
                resource: None,
                path: vec!["calc".to_string(), "version".to_string()],
            },
            Message::Set {
                id: 2,
                resource: Some(40),
                path: vec!["label".to_string()],
                value: json!("renamed"),
            },
            Message::Apply {
                id: 3,
                resource: None,
                path: vec!["calc".to_string(), "add".to_string()],
                args: vec![json!(1), json!(2)],
            },
            Message::Response {
                id: 3,
                result: json!(3),
            },
            Message::Error {
                id: 4,
                error: SerializedError::new("Error", "ERR_REMOTE", "boom")
                    .with_cause(SerializedError::new("TypeError", "ERR_TYPE", "inner")),
            },
            Message::Release { resource: 77 },
            Message::Batch {
                id: 5,
                calls: vec![
                    Message::Get {
                        id: 6,
                        resource: None,
                        path: vec!["a".to_string()],
                    },
                    Message::Apply {
                        id: 7,
                        resource: Some(9),
                        path: vec![],
                        args: vec![json!({"k": "v"})],
                    },
                ],
            },
            Message::BatchResponse {
                id: 5,
                results: vec![
                    BatchEntry::Ok(json!("fine")),
                    BatchEntry::Err(SerializedError::new("Error", "ERR_X", "bad")),
                ],
            },
            Message::HandshakeRequest {
                id: 8,
                identity: identity_fixture(),
                assigns: Some(identity_fixture()),
            },
            Message::HandshakeRequest {
                id: 8,
                identity: identity_fixture(),
                assigns: None,
            },
            Message::HandshakeAck {
                id: 8,
                identity: identity_fixture(),
            },
            Message::HandshakeReject {
                id: 8,
                error: SerializedError::new("Error", "ERR_POLICY_DENIED", "nope"),
            },
            Message::IdentityUpdate {
                updates: identity_fixture(),
            },
            Message::ChunkStart {
                session: 31,
                total_chunks: 3,
                original_id: Some(12),
                original_type: code::APPLY,
            },
            Message::ChunkData {
                session: 31,
                index: 0,
                data: ChunkPayload::Text("abc".to_string()),
            },
            Message::ChunkData {
                session: 31,
                index: 1,
                data: ChunkPayload::Bytes(vec![0, 255, 7]),
            },
        ]
    }

    fn identity_fixture() -> Identity {
        let mut identity = Identity::new();
        identity.insert("context".to_string(), json!("host"));
        identity.insert("tab_id".to_string(), json!(3));
        identity
    }

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;

        for message in probe_messages() {
            let packet = codec.encode(&message).unwrap();
            let back = codec.decode(&packet).unwrap();

            assert_eq!(back, message);
        }
    }

    #[test]
    fn test_binary_round_trip() {
        let codec = BinaryCodec;

        for message in probe_messages() {
            let packet = codec.encode(&message).unwrap();
            let back = codec.decode(&packet).unwrap();

            assert_eq!(back, message);
        }
    }

    #[test]
    fn test_json_packet_is_positional() {
        let codec = JsonCodec;
        let packet = codec
            .encode(&Message::Apply {
                id: 3,
                resource: None,
                path: vec!["calc".to_string(), "add".to_string()],
                args: vec![json!(1), json!(2)],
            })
            .unwrap();

        match packet {
            Packet::Text(text) => {
                assert_eq!(text, r#"[3,3,null,["calc","add"],[1,2]]"#);
            }
            Packet::Binary(_) => panic!("JSON codec produced binary"),
        }
    }

    #[test]
    fn test_release_field_order() {
        let codec = JsonCodec;
        let packet = codec.encode(&Message::Release { resource: 77 }).unwrap();

        match packet {
            Packet::Text(text) => assert_eq!(text, "[7,null,77]"),
            Packet::Binary(_) => panic!("JSON codec produced binary"),
        }
    }

    #[test]
    fn test_unknown_type_code() {
        let codec = JsonCodec;
        let result = codec.decode(&Packet::Text("[99,1,null]".to_string()));

        assert_eq!(result, Err(ProtocolError::UnknownMessageType(99)));
    }

    #[test]
    fn test_malformed_packet() {
        let codec = JsonCodec;

        assert!(codec.decode(&Packet::Text("{}".to_string())).is_err());
        assert!(codec.decode(&Packet::Text("[1]".to_string())).is_err());
        assert!(codec.decode(&Packet::Text("not json".to_string())).is_err());
    }

    #[test]
    fn test_binary_rejects_truncation() {
        let codec = BinaryCodec;
        let packet = codec
            .encode(&Message::Response {
                id: 1,
                result: json!("a longer payload"),
            })
            .unwrap();

        let bytes = match packet {
            Packet::Binary(bytes) => bytes,
            Packet::Text(_) => panic!("binary codec produced text"),
        };

        for cut in 1..bytes.len() {
            assert!(codec.decode(&Packet::Binary(bytes.slice(..cut))).is_err());
        }
    }

    #[test]
    fn test_codec_kind_mismatch() {
        assert!(JsonCodec.decode(&Packet::Binary(Bytes::from_static(&[1, 2, 3]))).is_err());
        assert!(BinaryCodec.decode(&Packet::Text("[5,1,null]".to_string())).is_err());
    }
}
