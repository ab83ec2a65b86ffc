//! The wiring root. Owns the L3 managers, mediates inbound traffic from the
//! connection layer and outbound dispatch from the proxies. Cycles between
//! the engine, the handler and the connection manager are closed through
//! injected callback records holding weak engine handles.

use crate::error::NexusResult;
use crate::identity::{Descriptor, Identity, Policy};
use crate::link::connection::LinkSettings;
use crate::link::manager::{ConnectionManager, ManagerSinks, ResolveQuery};
use crate::message::Message;
use crate::net::port::PlatformEndpoint;
use crate::rpc::call::CallProcessor;
use crate::rpc::handler::{HandlerLinks, MessageHandler};
use crate::rpc::payload::PayloadProcessor;
use crate::rpc::pending::PendingCallManager;
use crate::rpc::resources::ResourceManager;
use crate::value::Value;
use crate::{ConnectionId, ResourceId};
use lattice::logging::{self, Logger};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Engine-level tuning, resolved from the configuration by the facade.
#[derive(Clone)]
pub struct EngineSettings {
    pub link: LinkSettings,
    pub call_timeout: Duration,
}

pub struct Engine {
    manager: Arc<ConnectionManager>,
    resources: Arc<ResourceManager>,
    pending: Arc<PendingCallManager>,
    handler: MessageHandler,
    calls: CallProcessor,
    local_identity: Arc<Mutex<Identity>>,
    log: Logger,
}

impl Engine {
    pub fn new(
        endpoint: Arc<dyn PlatformEndpoint>,
        settings: EngineSettings,
        local_identity: Identity,
        policy: Arc<dyn Policy>,
        services: Vec<(String, Value)>,
        log: &Logger,
    ) -> Arc<Engine> {
        let log = log.new(logging::o!());
        let local_identity = Arc::new(Mutex::new(local_identity));

        Arc::new_cyclic(|engine: &Weak<Engine>| {
            let resources = Arc::new(ResourceManager::new(&log));
            for (name, root) in services {
                resources.register_service(name, root);
            }

            let pending = PendingCallManager::new(&log);
            let payload = Arc::new(PayloadProcessor::new(resources.clone(), engine.clone(), &log));

            let inbound = engine.clone();
            let dropped = engine.clone();
            let manager = ConnectionManager::new(
                endpoint,
                settings.link.clone(),
                local_identity.clone(),
                policy.clone(),
                ManagerSinks {
                    on_message: Box::new(move |connection, message| {
                        if let Some(engine) = inbound.upgrade() {
                            engine.on_message(connection, message);
                        }
                    }),
                    on_disconnect: Box::new(move |connection| {
                        if let Some(engine) = dropped.upgrade() {
                            engine.on_disconnect(connection);
                        }
                    }),
                },
                &log,
            );

            let respond = engine.clone();
            let settle = engine.clone();
            let identify = engine.clone();
            let handler = MessageHandler::new(
                resources.clone(),
                payload.clone(),
                policy,
                HandlerLinks {
                    send: Box::new(move |connection, message| {
                        if let Some(engine) = respond.upgrade() {
                            if let Err(err) = engine.manager.send_to(connection, &message) {
                                logging::debug!(engine.log, "response undeliverable";
                                                "context" => "respond",
                                                "connection_id" => connection,
                                                "error" => %err);
                            }
                        }
                    }),
                    settle: Box::new(move |id, from, result| {
                        if let Some(engine) = settle.upgrade() {
                            engine.pending.settle(id, from, result);
                        }
                    }),
                    caller_identity: Box::new(move |connection| {
                        identify
                            .upgrade()
                            .and_then(|engine| engine.manager.get(connection))
                            .map(|connection| connection.remote_identity())
                    }),
                },
                &log,
            );

            let calls = CallProcessor::new(
                manager.clone(),
                pending.clone(),
                payload,
                settings.call_timeout,
                &log,
            );

            Engine {
                manager,
                resources,
                pending,
                handler,
                calls,
                local_identity,
                log,
            }
        })
    }

    /// Installs the accept handler and dials the configured descriptors.
    pub async fn initialize(self: &Arc<Self>, connect_to: &[Descriptor]) -> NexusResult<()> {
        self.manager().initialize(connect_to).await
    }

    /// Entry from the connection layer for ready-state traffic.
    pub fn on_message(&self, source: ConnectionId, message: Message) {
        self.handler.handle(source, message);
    }

    /// Disconnect cascade: both endpoints of the resource algebra and the
    /// pending accounting observe the loss.
    pub fn on_disconnect(&self, connection: ConnectionId) {
        self.resources.cleanup_connection(connection);
        self.pending.on_disconnect(connection);
    }

    /// Fire-and-forget release of a remote resource; failures are logged
    /// and swallowed.
    pub fn release_remote(&self, source: ConnectionId, resource: ResourceId) {
        self.resources.release_proxy(resource);

        if let Err(err) = self.manager.send_to(source, &Message::Release { resource }) {
            logging::debug!(self.log, "release not delivered";
                            "context" => "release",
                            "resource_id" => resource,
                            "connection_id" => source,
                            "error" => %err);
        }
    }

    /// Resolves (or creates, when a descriptor allows) a ready connection.
    pub async fn resolve_connection(self: &Arc<Self>, query: &ResolveQuery) -> NexusResult<Option<ConnectionId>> {
        let found = self.manager().resolve(query).await?;
        Ok(found.and_then(|connection| connection.id()))
    }

    /// Ready connections the target selects, in registration order; never
    /// initiates.
    pub fn select_existing(&self, target: &crate::identity::Target) -> Vec<ConnectionId> {
        self.manager
            .resolve_targets(target)
            .into_iter()
            .filter_map(|connection| connection.id())
            .collect()
    }

    /// Closes every connection and fails all outstanding calls.
    pub fn shutdown(&self) {
        logging::info!(self.log, "engine shutting down"; "context" => "shutdown");

        self.manager.close_all();
        self.pending.fail_all_disconnected();
    }

    #[inline]
    pub fn call_processor(&self) -> &CallProcessor {
        &self.calls
    }

    #[inline]
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    #[inline]
    pub fn pending(&self) -> &Arc<PendingCallManager> {
        &self.pending
    }

    #[inline]
    pub fn local_identity(&self) -> Identity {
        self.local_identity.lock().expect("Identity poisoned").clone()
    }

    /// Merges the patch locally and broadcasts it to every ready peer.
    pub fn update_identity(&self, patch: &Identity) {
        self.manager.update_local_identity(patch);
    }

    /// Ready connections with their identity snapshots.
    pub fn connections(&self) -> Vec<(ConnectionId, Identity)> {
        self.manager.connections()
    }

    fn manager(self: &Arc<Self>) -> Arc<ConnectionManager> {
        self.manager.clone()
    }
}
