//! The raw-port contract consumed from platform adapters, and the port
//! processor that binds one raw port to a codec: outbound messages are
//! encoded and chunked, inbound packets are reassembled, decoded and handed
//! upward through a callbacks triple.

use crate::error::{NexusResult, ProtocolError};
use crate::identity::{Descriptor, PlatformInfo};
use crate::message::Message;
use crate::net::chunk::{split, Reassembler};
use crate::net::packet::{Packet, PacketCodec};
use lattice::logging::{self, Logger};
use lattice::util::truncate_for_log;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Callbacks a raw port delivers into. Installed exactly once.
pub struct PortCallbacks {
    pub on_message: Box<dyn Fn(Packet) + Send + Sync>,
    pub on_disconnect: Box<dyn Fn() + Send + Sync>,
}

/// Buffers posted alongside a packet that the channel may hand to the peer
/// without copying. The port processor lists the binary payload here; the
/// packet argument stays the authoritative data. The entries are cheap
/// handles onto the same allocation, so a channel that cannot exploit the
/// list simply drops it.
pub type TransferList = Vec<bytes::Bytes>;

/// One end of a platform message channel. `close` notifies both sides'
/// disconnect callbacks. Implementations deliver packets in order.
pub trait RawPort: Send + Sync {
    fn post_message(&self, packet: Packet, transfer: Option<TransferList>) -> NexusResult<()>;
    fn bind(&self, callbacks: PortCallbacks);
    fn close(&self);
}

/// Inbound-connection callback handed to a listening endpoint.
pub type AcceptCallback = Box<dyn Fn(Arc<dyn RawPort>, PlatformInfo) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointCapabilities {
    /// Selects the binary codec so buffers can move without a copy.
    pub supports_transferables: bool,
}

/// The platform adapter contract. Listening and dialing are both optional;
/// an endpoint that supports neither can still host accepted connections
/// handed to it by the platform.
pub trait PlatformEndpoint: Send + Sync {
    fn capabilities(&self) -> EndpointCapabilities;

    /// Installs an accept handler. Returns false when the endpoint cannot
    /// accept inbound connections.
    fn listen(self: Arc<Self>, on_accept: AcceptCallback) -> bool;

    /// Opens a channel toward the peer the descriptor identifies.
    fn connect(&self, descriptor: &Descriptor) -> NexusResult<(Arc<dyn RawPort>, PlatformInfo)>;
}

/// Handlers the port processor reports through. Protocol errors drop the
/// offending packet and never tear down the channel.
pub struct PortHandlers {
    pub on_message: Box<dyn Fn(Message) + Send + Sync>,
    pub on_disconnect: Box<dyn Fn() + Send + Sync>,
    pub on_protocol_error: Box<dyn Fn(ProtocolError) + Send + Sync>,
}

pub struct PortProcessor {
    port: Arc<dyn RawPort>,
    codec: Arc<dyn PacketCodec>,
    chunk_size: usize,
    reassembler: Mutex<Reassembler>,
    log: Logger,
}

impl PortProcessor {
    pub fn new(
        port: Arc<dyn RawPort>,
        codec: Arc<dyn PacketCodec>,
        chunk_size: usize,
        session_timeout: Duration,
        handlers: PortHandlers,
        log: &Logger,
    ) -> Arc<PortProcessor> {
        let processor = Arc::new(PortProcessor {
            port: port.clone(),
            codec,
            chunk_size,
            reassembler: Mutex::new(Reassembler::new(session_timeout)),
            log: log.new(logging::o!()),
        });

        let handlers = Arc::new(handlers);
        let inbound = Arc::downgrade(&processor);
        let inbound_handlers = handlers.clone();

        port.bind(PortCallbacks {
            on_message: Box::new(move |packet| {
                if let Some(processor) = inbound.upgrade() {
                    processor.handle_packet(packet, &inbound_handlers);
                }
            }),
            on_disconnect: Box::new(move || (handlers.on_disconnect)()),
        });

        processor
    }

    /// Encodes and posts a message, splitting it into chunk messages when
    /// the packet exceeds the chunk size.
    pub fn send(&self, message: &Message) -> NexusResult<()> {
        let packet = self.codec.encode(message)?;

        logging::trace!(self.log, "sending message";
                        "context" => "send",
                        "message_type" => message.type_code(),
                        "packet_size" => packet.len());

        match split(&packet, message, self.chunk_size) {
            Some(chunks) => {
                for chunk in &chunks {
                    self.post(self.codec.encode(chunk)?)?;
                }
                Ok(())
            }
            None => self.post(packet),
        }
    }

    /// Binary payloads travel with their buffer in the transfer list so
    /// zero-copy channels can move it instead of copying.
    fn post(&self, packet: Packet) -> NexusResult<()> {
        let transfer = match &packet {
            Packet::Binary(bytes) => Some(vec![bytes.clone()]),
            Packet::Text(_) => None,
        };

        self.port.post_message(packet, transfer)
    }

    pub fn close(&self) {
        self.port.close();
    }

    fn handle_packet(&self, packet: Packet, handlers: &PortHandlers) {
        let message = match self.codec.decode(&packet) {
            Ok(message) => message,
            Err(err) => {
                logging::warn!(self.log, "dropping malformed packet";
                               "context" => "receive",
                               "error" => truncate_for_log(&err.to_string(), 160));
                (handlers.on_protocol_error)(err);
                return;
            }
        };

        match message {
            Message::ChunkStart { .. } | Message::ChunkData { .. } => {
                let complete = {
                    let mut reassembler = self.reassembler.lock().expect("Reassembler poisoned");
                    reassembler.accept(&message, Instant::now())
                };

                match complete {
                    Ok(Some(packet)) => match self.codec.decode(&packet) {
                        Ok(reassembled) => (handlers.on_message)(reassembled),
                        Err(err) => {
                            logging::warn!(self.log, "dropping malformed reassembled packet";
                                           "context" => "receive", "error" => %err);
                            (handlers.on_protocol_error)(err);
                        }
                    },
                    Ok(None) => (),
                    Err(err) => {
                        logging::warn!(self.log, "dropping chunk"; "context" => "receive", "error" => %err);
                        (handlers.on_protocol_error)(err);
                    }
                }
            }
            message => (handlers.on_message)(message),
        }
    }
}
