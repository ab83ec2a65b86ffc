//! Registry of logical connections: accepts inbound ports, initiates
//! configured ones, resolves targets to live connections and routes sends.

use crate::error::{NexusError, NexusResult};
use crate::identity::{descriptor_matches, Descriptor, Identity, Matcher, Policy, Target};
use crate::link::connection::{Connection, ConnectionEvents, ConnectionState, LinkSettings};
use crate::message::Message;
use crate::net::packet::{BinaryCodec, JsonCodec, PacketCodec};
use crate::net::port::{PlatformEndpoint, RawPort};
use crate::identity::PlatformInfo;
use crate::ConnectionId;
use indexmap::IndexMap;
use lattice::logging::{self, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Search key for `resolve`: a candidate matches when the descriptor is a
/// subset of its identity and the matcher accepts it.
#[derive(Clone, Default)]
pub struct ResolveQuery {
    pub descriptor: Option<Descriptor>,
    pub matcher: Option<Matcher>,
}

/// Callback record into the layer above; installed at construction.
pub struct ManagerSinks {
    pub on_message: Box<dyn Fn(ConnectionId, Message) + Send + Sync>,
    pub on_disconnect: Box<dyn Fn(ConnectionId) + Send + Sync>,
}

pub struct ConnectionManager {
    endpoint: Arc<dyn PlatformEndpoint>,
    codec: Arc<dyn PacketCodec>,
    settings: LinkSettings,
    local_identity: Arc<Mutex<Identity>>,
    policy: Arc<dyn Policy>,
    registry: Mutex<IndexMap<ConnectionId, Arc<Connection>>>,
    pending: Mutex<Vec<Arc<Connection>>>,
    sinks: ManagerSinks,
    listening: AtomicBool,
    log: Logger,
}

impl ConnectionManager {
    pub fn new(
        endpoint: Arc<dyn PlatformEndpoint>,
        settings: LinkSettings,
        local_identity: Arc<Mutex<Identity>>,
        policy: Arc<dyn Policy>,
        sinks: ManagerSinks,
        log: &Logger,
    ) -> Arc<ConnectionManager> {
        let codec: Arc<dyn PacketCodec> = if endpoint.capabilities().supports_transferables {
            Arc::new(BinaryCodec)
        } else {
            Arc::new(JsonCodec)
        };

        Arc::new(ConnectionManager {
            endpoint,
            codec,
            settings,
            local_identity,
            policy,
            registry: Mutex::new(IndexMap::new()),
            pending: Mutex::new(Vec::new()),
            sinks,
            listening: AtomicBool::new(false),
            log: log.new(logging::o!()),
        })
    }

    /// Installs the accept handler (when the endpoint can listen) and dials
    /// every configured descriptor. Descriptors that already resolve to a
    /// live connection are not dialed again, which makes retries after a
    /// failed initialization safe.
    pub async fn initialize(self: &Arc<Self>, connect_to: &[Descriptor]) -> NexusResult<()> {
        if !self.listening.swap(true, Ordering::SeqCst) {
            let manager = Arc::downgrade(self);
            let installed = self.endpoint.clone().listen(Box::new(move |port, platform| {
                if let Some(manager) = manager.upgrade() {
                    logging::debug!(manager.log, "accepting inbound port"; "context" => "accept");
                    manager.adopt(port, platform);
                }
            }));

            if !installed {
                logging::debug!(self.log, "endpoint does not listen"; "context" => "initialize");
            }
        }

        let mut first_failure = None;

        for descriptor in connect_to {
            let existing = self.find_existing(&ResolveQuery {
                descriptor: Some(descriptor.clone()),
                matcher: None,
            });

            if existing.is_some() {
                continue;
            }

            if let Err(err) = self.initiate(descriptor, None).await {
                logging::warn!(self.log, "configured connection failed";
                               "context" => "initialize", "error" => %err);
                first_failure.get_or_insert(err);
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wraps an inbound port into a handshaking connection.
    pub fn adopt(self: &Arc<Self>, port: Arc<dyn RawPort>, platform: PlatformInfo) -> Arc<Connection> {
        let connection = Connection::spawn(
            port,
            self.codec.clone(),
            platform,
            self.local_identity.clone(),
            self.policy.clone(),
            &self.settings,
            self.connection_events(),
            &self.log,
        );

        self.pending.lock().expect("Pending poisoned").push(connection.clone());
        connection
    }

    /// Dials a descriptor and waits for the handshake to complete.
    pub async fn initiate(
        self: &Arc<Self>,
        descriptor: &Descriptor,
        assigns: Option<Identity>,
    ) -> NexusResult<Arc<Connection>> {
        let (port, platform) = self.endpoint.connect(descriptor)?;
        let connection = self.adopt(port, platform);

        if let Err(err) = connection.initiate(assigns) {
            connection.close();
            return Err(err);
        }

        match connection.wait_ready(self.settings.handshake_timeout).await {
            Ok(_) => Ok(connection),
            Err(err) => {
                connection.close();
                Err(err)
            }
        }
    }

    /// Finds a ready connection matching the query, or creates one when a
    /// descriptor allows it. A matcher alone never creates.
    pub async fn resolve(self: &Arc<Self>, query: &ResolveQuery) -> NexusResult<Option<Arc<Connection>>> {
        if let Some(found) = self.find_existing(query) {
            return Ok(Some(found));
        }

        match &query.descriptor {
            Some(descriptor) => self.initiate(descriptor, None).await.map(Some),
            None => Ok(None),
        }
    }

    /// Ready connections selected by the target, in registration order.
    pub fn resolve_targets(&self, target: &Target) -> Vec<Arc<Connection>> {
        let registry = self.registry.lock().expect("Registry poisoned");

        if let Some(id) = target.connection {
            return registry
                .get(&id)
                .filter(|connection| connection.state() == ConnectionState::Ready)
                .cloned()
                .into_iter()
                .collect();
        }

        registry
            .values()
            .filter(|connection| connection.state() == ConnectionState::Ready)
            .filter(|connection| target.selects(&connection.remote_identity()))
            .cloned()
            .collect()
    }

    /// Sends to a single ready connection.
    pub fn send_to(&self, id: ConnectionId, message: &Message) -> NexusResult<()> {
        let connection = {
            let registry = self.registry.lock().expect("Registry poisoned");
            registry.get(&id).cloned()
        };

        match connection {
            Some(connection) => connection.send(message),
            None => Err(NexusError::disconnected(Some(id))),
        }
    }

    /// Delivers one message to every connection the target resolves to and
    /// returns the ids actually reached. Callers infer failure from an
    /// empty return.
    pub fn send_message(&self, target: &Target, message: &Message) -> Vec<ConnectionId> {
        let mut reached = Vec::new();

        for connection in self.resolve_targets(target) {
            let id = match connection.id() {
                Some(id) => id,
                None => continue,
            };

            match connection.send(message) {
                Ok(()) => reached.push(id),
                Err(err) => {
                    logging::warn!(self.log, "send failed";
                                   "context" => "send", "connection_id" => id, "error" => %err);
                }
            }
        }

        reached
    }

    /// Merges the patch into the local identity and notifies every ready
    /// connection.
    pub fn update_local_identity(&self, patch: &Identity) {
        {
            let mut identity = self.local_identity.lock().expect("Identity poisoned");
            crate::identity::merge_identity(&mut identity, patch);
        }

        let update = Message::IdentityUpdate { updates: patch.clone() };
        let reached = self.send_message(&Target::default(), &update);

        logging::debug!(self.log, "identity update broadcast";
                        "context" => "identity", "connections" => reached.len());
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.registry.lock().expect("Registry poisoned").get(&id).cloned()
    }

    /// Snapshot of ready connections for diagnostics.
    pub fn connections(&self) -> Vec<(ConnectionId, Identity)> {
        self.registry
            .lock()
            .expect("Registry poisoned")
            .iter()
            .filter(|(_, connection)| connection.state() == ConnectionState::Ready)
            .map(|(id, connection)| (*id, connection.remote_identity()))
            .collect()
    }

    /// Closes every connection, pending handshakes included.
    pub fn close_all(&self) {
        let connections: Vec<Arc<Connection>> = {
            let registry = self.registry.lock().expect("Registry poisoned");
            registry.values().cloned().collect()
        };
        let pending: Vec<Arc<Connection>> = {
            let pending = self.pending.lock().expect("Pending poisoned");
            pending.clone()
        };

        for connection in connections.into_iter().chain(pending) {
            connection.close();
        }
    }

    fn find_existing(&self, query: &ResolveQuery) -> Option<Arc<Connection>> {
        let registry = self.registry.lock().expect("Registry poisoned");

        registry
            .values()
            .filter(|connection| connection.state() == ConnectionState::Ready)
            .find(|connection| {
                let identity = connection.remote_identity();

                let descriptor_ok = query
                    .descriptor
                    .as_ref()
                    .map_or(true, |descriptor| descriptor_matches(descriptor, &identity));
                let matcher_ok = query
                    .matcher
                    .as_ref()
                    .map_or(true, |matcher| matcher.test(&identity));

                descriptor_ok && matcher_ok
            })
            .cloned()
    }

    fn connection_events(self: &Arc<Self>) -> ConnectionEvents {
        let ready = Arc::downgrade(self);
        let message = Arc::downgrade(self);
        let closed = Arc::downgrade(self);

        ConnectionEvents {
            on_ready: Box::new(move |connection| {
                if let Some(manager) = ready.upgrade() {
                    manager.promote(connection);
                }
            }),
            on_message: Box::new(move |id, inbound| {
                if let Some(manager) = message.upgrade() {
                    (manager.sinks.on_message)(id, inbound);
                }
            }),
            on_closed: Box::new(move |connection| {
                if let Some(manager) = closed.upgrade() {
                    manager.evict(connection);
                }
            }),
        }
    }

    fn promote(&self, connection: &Arc<Connection>) {
        let id = connection.id().expect("Ready connection must have an id");

        {
            let mut pending = self.pending.lock().expect("Pending poisoned");
            pending.retain(|candidate| !Arc::ptr_eq(candidate, connection));
        }

        let mut registry = self.registry.lock().expect("Registry poisoned");
        registry.insert(id, connection.clone());

        logging::debug!(self.log, "connection registered";
                        "context" => "promote", "connection_id" => id);
    }

    fn evict(&self, connection: &Arc<Connection>) {
        {
            let mut pending = self.pending.lock().expect("Pending poisoned");
            pending.retain(|candidate| !Arc::ptr_eq(candidate, connection));
        }

        if let Some(id) = connection.id() {
            let removed = {
                let mut registry = self.registry.lock().expect("Registry poisoned");
                registry.shift_remove(&id)
            };

            if removed.is_some() {
                logging::debug!(self.log, "connection removed";
                                "context" => "evict", "connection_id" => id);
                (self.sinks.on_disconnect)(id);
            }
        }
    }
}
