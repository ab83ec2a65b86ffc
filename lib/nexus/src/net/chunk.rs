//! Oversize packets are cut into a `ChunkStart` header followed by indexed
//! `ChunkData` slices, all travelling as ordinary messages. The reassembler
//! keeps one buffer per session and silently drops sessions whose deadline
//! passed before completion.

use crate::error::ProtocolError;
use crate::message::{ChunkPayload, Message};
use crate::net::packet::Packet;
use hashbrown::HashMap;
use lattice::sequence::Sequence;
use std::time::{Duration, Instant};

static CHUNK_SESSIONS: Sequence = Sequence::new(1);

/// Splits an encoded packet into chunk messages. Returns `None` when the
/// packet fits in `chunk_size`. Text packets are cut on character
/// boundaries, so a slice may run slightly short of `chunk_size`.
pub fn split(packet: &Packet, original: &Message, chunk_size: usize) -> Option<Vec<Message>> {
    if packet.len() <= chunk_size || chunk_size == 0 {
        return None;
    }

    let session = CHUNK_SESSIONS.next();
    let slices = match packet {
        Packet::Text(text) => split_text(text, chunk_size),
        Packet::Binary(bytes) => bytes
            .chunks(chunk_size)
            .map(|run| ChunkPayload::Bytes(run.to_vec()))
            .collect(),
    };

    let mut messages = Vec::with_capacity(slices.len() + 1);
    messages.push(Message::ChunkStart {
        session,
        total_chunks: slices.len() as u32,
        original_id: original.message_id(),
        original_type: original.type_code(),
    });

    for (index, data) in slices.into_iter().enumerate() {
        messages.push(Message::ChunkData {
            session,
            index: index as u32,
            data,
        });
    }

    Some(messages)
}

fn split_text(text: &str, chunk_size: usize) -> Vec<ChunkPayload> {
    let mut slices = Vec::with_capacity(text.len() / chunk_size + 1);
    let mut rest = text;

    while !rest.is_empty() {
        let mut cut = chunk_size.min(rest.len());
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }

        let (head, tail) = rest.split_at(cut);
        slices.push(ChunkPayload::Text(head.to_string()));
        rest = tail;
    }

    slices
}

struct Session {
    total: u32,
    received: u32,
    slots: Vec<Option<ChunkPayload>>,
    deadline: Instant,
}

/// Per-connection reassembly state for inbound chunk sessions.
pub struct Reassembler {
    sessions: HashMap<u64, Session>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Reassembler {
        Reassembler {
            sessions: HashMap::new(),
            timeout,
        }
    }

    /// Feeds one chunk message. Returns the reassembled packet when the
    /// session completes. Non-chunk messages are a caller error.
    pub fn accept(&mut self, message: &Message, now: Instant) -> Result<Option<Packet>, ProtocolError> {
        self.sweep(now);

        match message {
            Message::ChunkStart {
                session, total_chunks, ..
            } => {
                if *total_chunks == 0 {
                    return Err(ProtocolError::ChunkSession("session with zero chunks".to_string()));
                }

                self.sessions.insert(
                    *session,
                    Session {
                        total: *total_chunks,
                        received: 0,
                        slots: vec![None; *total_chunks as usize],
                        deadline: now + self.timeout,
                    },
                );

                Ok(None)
            }
            Message::ChunkData { session, index, data } => {
                let entry = match self.sessions.get_mut(session) {
                    Some(entry) => entry,
                    // Stale or never-started session; drop without fuss.
                    None => return Ok(None),
                };

                if *index >= entry.total {
                    self.sessions.remove(session);
                    return Err(ProtocolError::ChunkSession(format!(
                        "chunk index {} out of bounds",
                        index
                    )));
                }

                let slot = &mut entry.slots[*index as usize];
                if slot.is_none() {
                    entry.received += 1;
                }
                *slot = Some(data.clone());

                if entry.received < entry.total {
                    return Ok(None);
                }

                let entry = self.sessions.remove(session).expect("Session present");
                assemble(entry).map(Some)
            }
            _ => Err(ProtocolError::ChunkSession("not a chunk message".to_string())),
        }
    }

    /// Number of sessions currently buffering.
    #[inline]
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn sweep(&mut self, now: Instant) {
        self.sessions.retain(|_, session| session.deadline > now);
    }
}

fn assemble(session: Session) -> Result<Packet, ProtocolError> {
    let slots = session
        .slots
        .into_iter()
        .map(|slot| slot.expect("Complete session has all slots"))
        .collect::<Vec<_>>();

    let text_parts = slots
        .iter()
        .all(|part| matches!(part, ChunkPayload::Text(_)));

    if text_parts {
        let mut text = String::new();
        for part in slots {
            match part {
                ChunkPayload::Text(part) => text.push_str(&part),
                ChunkPayload::Bytes(_) => unreachable!(),
            }
        }
        return Ok(Packet::Text(text));
    }

    let mut bytes = Vec::new();
    for part in slots {
        match part {
            ChunkPayload::Bytes(part) => bytes.extend_from_slice(&part),
            ChunkPayload::Text(_) => {
                return Err(ProtocolError::ChunkSession("mixed text and byte chunks".to_string()))
            }
        }
    }

    Ok(Packet::Binary(bytes.into()))
}
