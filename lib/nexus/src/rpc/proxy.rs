//! Capability proxies. Both shapes share the chainable path machinery and
//! dispatch through the engine with explicit `get`/`set`/`call` methods; a
//! resource proxy additionally carries a release handle wired to drop.

use crate::error::{NexusError, NexusResult, ResourceFault};
use crate::identity::Target;
use crate::rpc::call::{CallKind, CallSpec, Expectation};
use crate::rpc::engine::Engine;
use crate::rpc::pending::{SettledResult, SettledStream};
use crate::value::Value;
use crate::{ConnectionId, ResourceId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Shared identity of one remote resource. When the last handle drops, a
/// fire-and-forget release notification goes to the owning connection;
/// connection cleanup pre-empts that by neutralizing the core first.
pub struct ProxyCore {
    resource: ResourceId,
    source: ConnectionId,
    engine: Weak<Engine>,
    released: AtomicBool,
}

impl ProxyCore {
    pub(crate) fn new(resource: ResourceId, source: ConnectionId, engine: Weak<Engine>) -> Arc<ProxyCore> {
        Arc::new(ProxyCore {
            resource,
            source,
            engine,
            released: AtomicBool::new(false),
        })
    }

    /// Marks the core released without notifying the peer. Used when the
    /// source connection is already gone.
    pub fn neutralize(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn release_now(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(engine) = self.engine.upgrade() {
            engine.release_remote(self.source, self.resource);
        }
    }
}

impl Drop for ProxyCore {
    fn drop(&mut self) {
        self.release_now();
    }
}

/// Proxy for a remote callback or ref-wrapped object. Clones share one
/// release identity; `at` extends the path without affecting it.
#[derive(Clone)]
pub struct ResourceProxy {
    core: Arc<ProxyCore>,
    path: Vec<String>,
    timeout: Option<Duration>,
}

impl ResourceProxy {
    pub(crate) fn new(core: Arc<ProxyCore>) -> ResourceProxy {
        ResourceProxy {
            core,
            path: Vec::new(),
            timeout: None,
        }
    }

    #[inline]
    pub fn resource_id(&self) -> ResourceId {
        self.core.resource
    }

    #[inline]
    pub fn source(&self) -> ConnectionId {
        self.core.source
    }

    /// Extends the access path by one segment.
    pub fn at<S: Into<String>>(&self, segment: S) -> ResourceProxy {
        let mut path = self.path.clone();
        path.push(segment.into());

        ResourceProxy {
            core: self.core.clone(),
            path,
            timeout: self.timeout,
        }
    }

    /// Per-proxy default timeout, overriding the instance default.
    pub fn with_timeout(&self, timeout: Duration) -> ResourceProxy {
        ResourceProxy {
            core: self.core.clone(),
            path: self.path.clone(),
            timeout: Some(timeout),
        }
    }

    /// Reads the value at the current path.
    pub async fn get(&self) -> NexusResult<Value> {
        self.dispatch(CallKind::Get).await
    }

    /// Assigns at the current path. The root itself cannot be assigned.
    pub async fn set(&self, value: Value) -> NexusResult<()> {
        if self.path.is_empty() {
            return Err(ResourceFault::EmptyAssignment.into());
        }

        self.dispatch(CallKind::Set(value)).await.map(|_| ())
    }

    /// Invokes the callable at the current path.
    pub async fn call(&self, args: Vec<Value>) -> NexusResult<Value> {
        self.dispatch(CallKind::Apply(args)).await
    }

    /// Releases the remote resource deterministically. Idempotent; later
    /// calls through this proxy fail at the owner with a resource error.
    pub fn release(&self) {
        self.core.release_now();
    }

    async fn dispatch(&self, kind: CallKind) -> NexusResult<Value> {
        let engine = self
            .core
            .engine
            .upgrade()
            .ok_or_else(|| NexusError::disconnected(Some(self.core.source)))?;

        engine
            .call_processor()
            .unicast(
                self.core.source,
                CallSpec {
                    kind,
                    resource: Some(self.core.resource),
                    path: self.path.clone(),
                    timeout: self.timeout,
                },
                Expectation::One,
            )
            .await
    }
}

impl fmt::Debug for ResourceProxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<proxy r{}@c{}:{}>", self.core.resource, self.core.source, self.path.join("."))
    }
}

/// Proxy for an exposed service on one specific connection. The base path
/// is the service name; there is no assignment surface.
#[derive(Clone)]
pub struct ServiceProxy {
    engine: Weak<Engine>,
    connection: ConnectionId,
    path: Vec<String>,
    expects: Expectation,
    timeout: Option<Duration>,
}

impl ServiceProxy {
    pub(crate) fn new(
        engine: Weak<Engine>,
        connection: ConnectionId,
        service: String,
        expects: Expectation,
        timeout: Option<Duration>,
    ) -> ServiceProxy {
        ServiceProxy {
            engine,
            connection,
            path: vec![service],
            expects,
            timeout,
        }
    }

    #[inline]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn at<S: Into<String>>(&self, segment: S) -> ServiceProxy {
        let mut path = self.path.clone();
        path.push(segment.into());

        ServiceProxy {
            engine: self.engine.clone(),
            connection: self.connection,
            path,
            expects: self.expects,
            timeout: self.timeout,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> ServiceProxy {
        ServiceProxy {
            engine: self.engine.clone(),
            connection: self.connection,
            path: self.path.clone(),
            expects: self.expects,
            timeout: Some(timeout),
        }
    }

    /// Reads a service property. The service root itself is not readable.
    pub async fn get(&self) -> NexusResult<Value> {
        if self.path.len() < 2 {
            return Err(NexusError::usage("reading the service root is not supported"));
        }

        self.dispatch(CallKind::Get).await
    }

    /// Invokes the method at the current path.
    pub async fn call(&self, args: Vec<Value>) -> NexusResult<Value> {
        if self.path.len() < 2 {
            return Err(NexusError::usage("the service root is not callable"));
        }

        self.dispatch(CallKind::Apply(args)).await
    }

    async fn dispatch(&self, kind: CallKind) -> NexusResult<Value> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| NexusError::disconnected(Some(self.connection)))?;

        engine
            .call_processor()
            .unicast(
                self.connection,
                CallSpec {
                    kind,
                    resource: None,
                    path: self.path.clone(),
                    timeout: self.timeout,
                },
                self.expects,
            )
            .await
    }
}

impl fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<service c{}:{}>", self.connection, self.path.join("."))
    }
}

/// Proxy fanning one call out to every connection its target selects.
/// `call` collects a settled-result array; `stream` yields results as they
/// arrive. An empty selection is not an error.
#[derive(Clone)]
pub struct MulticastProxy {
    engine: Weak<Engine>,
    target: Target,
    path: Vec<String>,
    timeout: Option<Duration>,
}

impl MulticastProxy {
    pub(crate) fn new(
        engine: Weak<Engine>,
        target: Target,
        service: String,
        timeout: Option<Duration>,
    ) -> MulticastProxy {
        MulticastProxy {
            engine,
            target,
            path: vec![service],
            timeout,
        }
    }

    pub fn at<S: Into<String>>(&self, segment: S) -> MulticastProxy {
        let mut path = self.path.clone();
        path.push(segment.into());

        MulticastProxy {
            engine: self.engine.clone(),
            target: self.target.clone(),
            path,
            timeout: self.timeout,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> MulticastProxy {
        MulticastProxy {
            engine: self.engine.clone(),
            target: self.target.clone(),
            path: self.path.clone(),
            timeout: Some(timeout),
        }
    }

    /// Invokes on every selected connection and resolves with all settled
    /// results; partial on deadline.
    pub async fn call(&self, args: Vec<Value>) -> NexusResult<Vec<SettledResult>> {
        if self.path.len() < 2 {
            return Err(NexusError::usage("the service root is not callable"));
        }

        let engine = self.engine()?;
        engine
            .call_processor()
            .collect(&self.target, self.spec(CallKind::Apply(args)))
            .await
    }

    /// Invokes on every selected connection and streams settled results in
    /// arrival order.
    pub fn stream(&self, args: Vec<Value>) -> NexusResult<SettledStream> {
        if self.path.len() < 2 {
            return Err(NexusError::usage("the service root is not callable"));
        }

        let engine = self.engine()?;
        engine
            .call_processor()
            .stream(&self.target, self.spec(CallKind::Apply(args)))
    }

    fn spec(&self, kind: CallKind) -> CallSpec {
        CallSpec {
            kind,
            resource: None,
            path: self.path.clone(),
            timeout: self.timeout,
        }
    }

    fn engine(&self) -> NexusResult<Arc<Engine>> {
        self.engine
            .upgrade()
            .ok_or_else(|| NexusError::disconnected(None))
    }
}

impl fmt::Debug for MulticastProxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<multicast {}>", self.path.join("."))
    }
}
