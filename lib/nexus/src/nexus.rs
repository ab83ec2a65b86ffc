//! The user-facing surface. `configure` accumulates configuration and
//! schedules kernel initialization on the next scheduler tick, so every
//! synchronously applied configuration lands before the engine is built.
//! `create` is fail-fast; `create_multicast` tolerates an empty selection.

use crate::config::{NexusConfig, ServiceToken, TargetSpec};
use crate::error::{NexusError, NexusResult};
use crate::identity::{AllowAll, Identity, Target};
use crate::link::manager::ResolveQuery;
use crate::rpc::call::Expectation;
use crate::rpc::engine::Engine;
use crate::rpc::proxy::{MulticastProxy, ResourceProxy, ServiceProxy};
use crate::value::Value;
use crate::ConnectionId;
use lattice::logging::{self, Logger};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Options for `create`. The expectation governs how a call's settlement
/// is adapted; the timeout becomes the proxy default.
#[derive(Clone, Debug)]
pub struct CreateOptions {
    pub target: Option<TargetSpec>,
    pub expects: Expectation,
    pub timeout: Option<Duration>,
}

impl Default for CreateOptions {
    fn default() -> CreateOptions {
        CreateOptions {
            target: None,
            expects: Expectation::One,
            timeout: None,
        }
    }
}

impl CreateOptions {
    pub fn target(target: TargetSpec) -> CreateOptions {
        CreateOptions {
            target: Some(target),
            ..CreateOptions::default()
        }
    }

    pub fn expects(mut self, expects: Expectation) -> CreateOptions {
        self.expects = expects;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> CreateOptions {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct MulticastOptions {
    pub target: Option<TargetSpec>,
    pub timeout: Option<Duration>,
}

impl MulticastOptions {
    pub fn target(target: TargetSpec) -> MulticastOptions {
        MulticastOptions {
            target: Some(target),
            ..MulticastOptions::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> MulticastOptions {
        self.timeout = Some(timeout);
        self
    }
}

enum KernelState {
    Idle,
    Starting,
    Ready(Arc<Engine>),
    Failed(String),
    Stopped,
}

pub struct Nexus {
    config: Mutex<NexusConfig>,
    kernel: Mutex<KernelState>,
    changed: Notify,
    log: Mutex<Logger>,
}

impl Nexus {
    pub fn new() -> Arc<Nexus> {
        Arc::new(Nexus {
            config: Mutex::new(NexusConfig::new()),
            kernel: Mutex::new(KernelState::Idle),
            changed: Notify::new(),
            log: Mutex::new(logging::discard()),
        })
    }

    /// Merges configuration in place. Once an endpoint is configured,
    /// kernel initialization is scheduled on the next scheduler tick (a
    /// failed initialization is retried by the next configure call). Must
    /// run inside a tokio runtime.
    pub fn configure(self: &Arc<Self>, patch: NexusConfig) -> &Arc<Self> {
        let endpoint_ready = {
            let mut config = self.config.lock().expect("Config poisoned");
            config.merge(patch);

            if let Some(logger) = &config.logger {
                *self.log.lock().expect("Log poisoned") = logger.clone();
            }

            config.endpoint.is_some()
        };

        if endpoint_ready {
            let mut kernel = self.kernel.lock().expect("Kernel poisoned");
            match *kernel {
                KernelState::Idle | KernelState::Failed(_) => {
                    *kernel = KernelState::Starting;

                    let nexus = self.clone();
                    tokio::spawn(async move {
                        nexus.run_init().await;
                    });
                }
                _ => (),
            }
        }

        self
    }

    /// Resolves when the kernel is initialized; fails when no endpoint is
    /// configured, initialization failed, or the instance was shut down.
    pub async fn ready(&self) -> NexusResult<()> {
        self.kernel().await.map(|_| ())
    }

    /// Builds a unicast service proxy. Fail-fast: an unresolvable target or
    /// missing connection surfaces here, never on the first call.
    pub async fn create(&self, token: &ServiceToken, options: CreateOptions) -> NexusResult<ServiceProxy> {
        let engine = self.kernel().await?;

        let spec = match options.target.clone().or_else(|| token.default_target().cloned()) {
            Some(spec) => spec,
            None => self.fallback_target()?,
        };

        let target = self.materialize(&spec)?;
        let connection = self.bind_connection(&engine, &target).await?;

        Ok(ServiceProxy::new(
            Arc::downgrade(&engine),
            connection,
            token.id().to_string(),
            options.expects,
            options.timeout,
        ))
    }

    /// Builds a multicast proxy over every connection the target selects.
    /// An empty selection is legal; calls then settle empty.
    pub async fn create_multicast(
        &self,
        token: &ServiceToken,
        options: MulticastOptions,
    ) -> NexusResult<MulticastProxy> {
        let engine = self.kernel().await?;

        let target = match options.target.clone().or_else(|| token.default_target().cloned()) {
            Some(spec) => self.materialize(&spec)?,
            None => Target::default(),
        };

        Ok(MulticastProxy::new(
            Arc::downgrade(&engine),
            target,
            token.id().to_string(),
            options.timeout,
        ))
    }

    /// Merges into the local identity and notifies every ready peer.
    pub fn update_identity(&self, patch: &Identity) {
        {
            let mut config = self.config.lock().expect("Config poisoned");
            crate::identity::merge_identity(&mut config.identity, patch);
        }

        if let KernelState::Ready(engine) = &*self.kernel.lock().expect("Kernel poisoned") {
            engine.update_identity(patch);
        }
    }

    /// Tags a value for pass-by-reference.
    pub fn reference(&self, value: Value) -> Value {
        Value::reference(value)
    }

    /// Releases a resource proxy deterministically.
    pub fn release(&self, proxy: &ResourceProxy) {
        proxy.release();
    }

    /// Ready connections with their identity snapshots.
    pub fn connections(&self) -> Vec<(ConnectionId, Identity)> {
        match &*self.kernel.lock().expect("Kernel poisoned") {
            KernelState::Ready(engine) => engine.connections(),
            _ => Vec::new(),
        }
    }

    /// The running engine, for diagnostics. Awaits initialization like
    /// every other entry point.
    pub async fn engine(&self) -> NexusResult<Arc<Engine>> {
        self.kernel().await
    }

    /// Closes every connection, fails outstanding calls, and retires the
    /// instance.
    pub fn shutdown(&self) {
        let mut kernel = self.kernel.lock().expect("Kernel poisoned");

        if let KernelState::Ready(engine) = &*kernel {
            engine.shutdown();
        }

        *kernel = KernelState::Stopped;
        drop(kernel);
        self.changed.notify_waiters();
    }

    async fn run_init(self: Arc<Self>) {
        let log = self.log.lock().expect("Log poisoned").clone();

        let (engine, connect_to) = {
            let config = self.config.lock().expect("Config poisoned");

            let endpoint = match &config.endpoint {
                Some(endpoint) => endpoint.clone(),
                None => return,
            };

            let services = config
                .services
                .iter()
                .map(|(name, root)| (name.clone(), root.clone()))
                .collect();

            let engine = Engine::new(
                endpoint,
                config.engine_settings(),
                config.identity.clone(),
                config.policy.clone().unwrap_or_else(|| Arc::new(AllowAll)),
                services,
                &log,
            );

            (engine, config.connect_to.clone())
        };

        let result = engine.initialize(&connect_to).await;

        let mut kernel = self.kernel.lock().expect("Kernel poisoned");
        match result {
            Ok(()) => {
                logging::debug!(log, "kernel initialized"; "context" => "init");
                *kernel = KernelState::Ready(engine);
            }
            Err(err) => {
                logging::warn!(log, "kernel initialization failed"; "context" => "init", "error" => %err);
                *kernel = KernelState::Failed(err.to_string());
            }
        }
        drop(kernel);
        self.changed.notify_waiters();
    }

    async fn kernel(&self) -> NexusResult<Arc<Engine>> {
        loop {
            let changed = self.changed.notified();

            {
                let kernel = self.kernel.lock().expect("Kernel poisoned");
                match &*kernel {
                    KernelState::Ready(engine) => return Ok(engine.clone()),
                    KernelState::Idle => {
                        return Err(NexusError::configuration("no endpoint configured"))
                    }
                    KernelState::Failed(message) => {
                        return Err(NexusError::configuration(format!(
                            "initialization failed: {}",
                            message
                        )))
                    }
                    KernelState::Stopped => {
                        return Err(NexusError::configuration("instance shut down"))
                    }
                    KernelState::Starting => (),
                }
            }

            changed.await;
        }
    }

    fn fallback_target(&self) -> NexusResult<TargetSpec> {
        let config = self.config.lock().expect("Config poisoned");

        match config.connect_to.len() {
            1 => Ok(TargetSpec::descriptor(config.connect_to[0].clone())),
            0 => Err(NexusError::configuration(
                "no target: pass one explicitly or configure a default",
            )),
            _ => Err(NexusError::configuration(
                "ambiguous target: several connect-to entries are configured",
            )),
        }
    }

    /// Resolves named descriptor/matcher references into a concrete target.
    fn materialize(&self, spec: &TargetSpec) -> NexusResult<Target> {
        let config = self.config.lock().expect("Config poisoned");

        let descriptor = match (&spec.descriptor, &spec.descriptor_name) {
            (Some(descriptor), _) => Some(descriptor.clone()),
            (None, Some(name)) => Some(config.descriptors.get(name).cloned().ok_or_else(|| {
                NexusError::configuration(format!("unknown named descriptor '{}'", name))
            })?),
            (None, None) => None,
        };

        let matcher = match (&spec.matcher, &spec.matcher_name) {
            (Some(matcher), _) => Some(matcher.clone()),
            (None, Some(name)) => Some(config.matchers.get(name).cloned().ok_or_else(|| {
                NexusError::configuration(format!("unknown named matcher '{}'", name))
            })?),
            (None, None) => None,
        };

        Ok(Target {
            connection: spec.connection,
            descriptor,
            matcher,
            group: spec.group.clone(),
        })
    }

    async fn bind_connection(&self, engine: &Arc<Engine>, target: &Target) -> NexusResult<ConnectionId> {
        if let Some(id) = target.connection {
            return match engine.select_existing(&Target::to_connection(id)).first() {
                Some(id) => Ok(*id),
                None => Err(NexusError::targeting(format!("connection {} is not ready", id))),
            };
        }

        if let Some(id) = engine.select_existing(target).first() {
            return Ok(*id);
        }

        if target.descriptor.is_some() {
            let query = ResolveQuery {
                descriptor: target.descriptor.clone(),
                matcher: target.matcher.clone(),
            };

            if let Some(id) = engine.resolve_connection(&query).await? {
                return Ok(id);
            }
        }

        Err(NexusError::targeting("no connection matches the target"))
    }
}
