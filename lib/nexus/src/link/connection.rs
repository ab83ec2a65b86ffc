//! A logical connection: one port processor plus the handshake state
//! machine. The connection id is minted locally at handshake completion and
//! never changes; identity snapshots may be patched by identity-update
//! notifications.

use crate::error::{NexusError, NexusResult, SerializedError};
use crate::identity::{merge_identity, Identity, PlatformInfo, Policy};
use crate::message::{next_message_id, Message};
use crate::net::packet::PacketCodec;
use crate::net::port::{PortHandlers, PortProcessor, RawPort};
use crate::ConnectionId;
use lattice::logging::{self, Logger};
use lattice::sequence::Sequence;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

static CONNECTION_IDS: Sequence = Sequence::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Handshaking,
    Ready,
    Closed,
}

/// Callback record injected by the connection manager; the connection never
/// holds a back-pointer to the layers above it.
pub struct ConnectionEvents {
    pub on_ready: Box<dyn Fn(&Arc<Connection>) + Send + Sync>,
    pub on_message: Box<dyn Fn(ConnectionId, Message) + Send + Sync>,
    pub on_closed: Box<dyn Fn(&Arc<Connection>) + Send + Sync>,
}

/// Tuning shared by every connection of one instance.
#[derive(Clone)]
pub struct LinkSettings {
    pub chunk_size: usize,
    pub chunk_session_timeout: Duration,
    pub handshake_timeout: Duration,
}

pub struct Connection {
    id: Mutex<Option<ConnectionId>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    remote_identity: Mutex<Identity>,
    platform: PlatformInfo,
    local_identity: Arc<Mutex<Identity>>,
    policy: Arc<dyn Policy>,
    processor: Mutex<Option<Arc<PortProcessor>>>,
    events: ConnectionEvents,
    shut: AtomicBool,
    log: Logger,
}

impl Connection {
    /// Wraps a raw port into a connection in the `handshaking` state. The
    /// acceptor side simply waits; the initiator side follows up with
    /// `initiate`.
    pub fn spawn(
        port: Arc<dyn RawPort>,
        codec: Arc<dyn PacketCodec>,
        platform: PlatformInfo,
        local_identity: Arc<Mutex<Identity>>,
        policy: Arc<dyn Policy>,
        settings: &LinkSettings,
        events: ConnectionEvents,
        log: &Logger,
    ) -> Arc<Connection> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Handshaking);

        let connection = Arc::new(Connection {
            id: Mutex::new(None),
            state_tx,
            state_rx,
            remote_identity: Mutex::new(Identity::new()),
            platform,
            local_identity,
            policy,
            processor: Mutex::new(None),
            events,
            shut: AtomicBool::new(false),
            log: log.new(logging::o!()),
        });

        let inbound = Arc::downgrade(&connection);
        let dropped = Arc::downgrade(&connection);
        let fault_log = connection.log.clone();

        let processor = PortProcessor::new(
            port,
            codec,
            settings.chunk_size,
            settings.chunk_session_timeout,
            PortHandlers {
                on_message: Box::new(move |message| {
                    if let Some(connection) = inbound.upgrade() {
                        connection.handle_inbound(message);
                    }
                }),
                on_disconnect: Box::new(move || {
                    if let Some(connection) = dropped.upgrade() {
                        connection.shutdown(false);
                    }
                }),
                on_protocol_error: Box::new(move |err| {
                    logging::warn!(fault_log, "protocol error on connection"; "error" => %err);
                }),
            },
            &connection.log,
        );

        *connection.processor.lock().expect("Processor slot poisoned") = Some(processor);

        connection
    }

    /// Opens the handshake from the dialing side.
    pub fn initiate(&self, assigns: Option<Identity>) -> NexusResult<()> {
        let identity = self.local_identity.lock().expect("Identity poisoned").clone();

        self.post(&Message::HandshakeRequest {
            id: next_message_id(),
            identity,
            assigns,
        })
    }

    /// The id minted at handshake completion, if reached.
    pub fn id(&self) -> Option<ConnectionId> {
        *self.id.lock().expect("Id poisoned")
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn remote_identity(&self) -> Identity {
        self.remote_identity.lock().expect("Identity poisoned").clone()
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    /// Sends a message on a ready connection.
    pub fn send(&self, message: &Message) -> NexusResult<()> {
        if self.state() != ConnectionState::Ready {
            return Err(NexusError::disconnected(self.id()));
        }

        self.post(message)
    }

    /// Blocks until the handshake completes, fails, or the timeout fires.
    pub async fn wait_ready(&self, timeout: Duration) -> NexusResult<ConnectionId> {
        let mut state_rx = self.state_rx.clone();

        let ready = async move {
            loop {
                let state = *state_rx.borrow();
                match state {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Closed => return Err(NexusError::disconnected(None)),
                    ConnectionState::Handshaking => (),
                }

                if state_rx.changed().await.is_err() {
                    return Err(NexusError::disconnected(None));
                }
            }
        };

        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(())) => self.id().ok_or_else(|| NexusError::disconnected(None)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(NexusError::Timeout {
                elapsed_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Closes the connection and the underlying port. Idempotent; the
    /// on-closed event fires exactly once.
    pub fn close(self: &Arc<Self>) {
        self.shutdown(true);
    }

    fn shutdown(self: &Arc<Self>, close_port: bool) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }

        logging::debug!(self.log, "closing connection"; "context" => "close", "connection_id" => self.id());

        drop(self.state_tx.send(ConnectionState::Closed));

        if close_port {
            if let Some(processor) = self.processor.lock().expect("Processor slot poisoned").as_ref() {
                processor.close();
            }
        }

        (self.events.on_closed)(self);
    }

    fn post(&self, message: &Message) -> NexusResult<()> {
        let processor = self
            .processor
            .lock()
            .expect("Processor slot poisoned")
            .as_ref()
            .cloned()
            .ok_or_else(|| NexusError::disconnected(self.id()))?;

        processor.send(message)
    }

    fn handle_inbound(self: &Arc<Self>, message: Message) {
        match self.state() {
            ConnectionState::Handshaking => self.handle_handshake(message),
            ConnectionState::Ready => self.handle_traffic(message),
            ConnectionState::Closed => (),
        }
    }

    fn handle_handshake(self: &Arc<Self>, message: Message) {
        match message {
            Message::HandshakeRequest { id, identity, assigns } => {
                if !self.policy.can_connect(&identity, &self.platform) {
                    logging::info!(self.log, "handshake rejected by policy"; "context" => "handshake");

                    drop(self.post(&Message::HandshakeReject {
                        id,
                        error: SerializedError::new(
                            "NexusError",
                            "ERR_POLICY_DENIED",
                            "connection rejected by policy",
                        ),
                    }));
                    self.shutdown(true);
                    return;
                }

                *self.remote_identity.lock().expect("Identity poisoned") = identity;

                let mut ack_identity = self.local_identity.lock().expect("Identity poisoned").clone();
                if let Some(assigns) = &assigns {
                    merge_identity(&mut ack_identity, assigns);
                }

                if self.post(&Message::HandshakeAck {
                    id,
                    identity: ack_identity,
                }).is_err() {
                    self.shutdown(true);
                    return;
                }

                self.complete_handshake();
            }
            Message::HandshakeAck { identity, .. } => {
                *self.remote_identity.lock().expect("Identity poisoned") = identity;
                self.complete_handshake();
            }
            Message::HandshakeReject { error, .. } => {
                logging::info!(self.log, "handshake rejected by peer";
                               "context" => "handshake", "error" => %error);
                self.shutdown(true);
            }
            other => {
                logging::warn!(self.log, "dropping message during handshake";
                               "context" => "handshake", "message_type" => other.type_code());
            }
        }
    }

    fn complete_handshake(self: &Arc<Self>) {
        let id = CONNECTION_IDS.next();
        *self.id.lock().expect("Id poisoned") = Some(id);

        drop(self.state_tx.send(ConnectionState::Ready));

        logging::debug!(self.log, "connection ready"; "context" => "handshake", "connection_id" => id);

        (self.events.on_ready)(self);
    }

    fn handle_traffic(self: &Arc<Self>, message: Message) {
        match message {
            Message::IdentityUpdate { updates } => {
                let mut identity = self.remote_identity.lock().expect("Identity poisoned");
                merge_identity(&mut identity, &updates);
            }
            message if message.is_handshake() => {
                logging::warn!(self.log, "dropping handshake message on ready connection";
                               "context" => "receive", "message_type" => message.type_code());
            }
            message => {
                let id = self.id().expect("Ready connection must have an id");
                (self.events.on_message)(id, message);
            }
        }
    }

}
