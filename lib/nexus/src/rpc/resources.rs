//! The three resource registries: exposed services, locally held resources
//! (callbacks and ref-wrapped objects), and remote-proxy records. All
//! lookups are O(1); ids come from a process-wide monotonic counter and are
//! never reused.

use crate::value::{ObjectRef, Value};
use crate::{ConnectionId, ResourceId};
use hashbrown::HashMap;
use lattice::logging::{self, Logger};
use lattice::sequence::Sequence;
use std::sync::{Mutex, Weak};

static RESOURCE_IDS: Sequence = Sequence::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    Function,
    RefObject,
}

/// A callback or ref-object made addressable to exactly one peer.
#[derive(Clone)]
pub struct LocalResource {
    pub value: Value,
    pub owner: ConnectionId,
    pub kind: ResourceKind,
}

/// The mirror of a remote resource on this side. Holds the proxy weakly so
/// the registry never keeps a proxy reachable.
pub struct ProxyRecord {
    pub source: ConnectionId,
    pub core: Weak<crate::rpc::proxy::ProxyCore>,
}

pub struct ResourceManager {
    services: Mutex<HashMap<String, ObjectRef>>,
    locals: Mutex<HashMap<ResourceId, LocalResource>>,
    proxies: Mutex<HashMap<ResourceId, ProxyRecord>>,
    log: Logger,
}

impl ResourceManager {
    pub fn new(log: &Logger) -> ResourceManager {
        ResourceManager {
            services: Mutex::new(HashMap::new()),
            locals: Mutex::new(HashMap::new()),
            proxies: Mutex::new(HashMap::new()),
            log: log.new(logging::o!()),
        }
    }

    /// Registers an exposed service. Duplicate names warn and overwrite.
    pub fn register_service<S: Into<String>>(&self, name: S, root: Value) {
        let name = name.into();
        let mut services = self.services.lock().expect("Services poisoned");

        if services.contains_key(&name) {
            logging::warn!(self.log, "service overwritten"; "context" => "register", "service" => &name);
        }

        services.insert(name, ObjectRef::new(root));
    }

    pub fn service(&self, name: &str) -> Option<ObjectRef> {
        self.services.lock().expect("Services poisoned").get(name).cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.lock().expect("Services poisoned").keys().cloned().collect()
    }

    /// Interns a local value for the given owner and returns its fresh id.
    pub fn mint(&self, value: Value, owner: ConnectionId, kind: ResourceKind) -> ResourceId {
        let id = RESOURCE_IDS.next();

        self.locals
            .lock()
            .expect("Locals poisoned")
            .insert(id, LocalResource { value, owner, kind });

        logging::trace!(self.log, "local resource minted";
                        "context" => "mint", "resource_id" => id, "owner" => owner);

        id
    }

    pub fn local(&self, id: ResourceId) -> Option<LocalResource> {
        self.locals.lock().expect("Locals poisoned").get(&id).cloned()
    }

    /// Drops a local resource. Idempotent.
    pub fn release_local(&self, id: ResourceId) -> bool {
        self.locals.lock().expect("Locals poisoned").remove(&id).is_some()
    }

    /// Records the proxy minted for a remote resource.
    pub fn register_proxy(&self, id: ResourceId, record: ProxyRecord) {
        self.proxies.lock().expect("Proxies poisoned").insert(id, record);
    }

    /// Forgets a proxy record. Idempotent.
    pub fn release_proxy(&self, id: ResourceId) -> bool {
        self.proxies.lock().expect("Proxies poisoned").remove(&id).is_some()
    }

    /// Removes every entry owned by or sourced from the connection. Local
    /// resources go first so no release attempt is made for entries the
    /// peer can no longer observe.
    pub fn cleanup_connection(&self, connection: ConnectionId) {
        let dropped_locals = {
            let mut locals = self.locals.lock().expect("Locals poisoned");
            let before = locals.len();
            locals.retain(|_, resource| resource.owner != connection);
            before - locals.len()
        };

        let dropped_proxies = {
            let mut proxies = self.proxies.lock().expect("Proxies poisoned");
            let mut dropped = Vec::new();

            proxies.retain(|id, record| {
                if record.source != connection {
                    return true;
                }
                dropped.push((*id, record.core.clone()));
                false
            });

            // Mark survivors outside the registry so a later drop does not
            // fire a release at a dead connection.
            for (_, core) in &dropped {
                if let Some(core) = core.upgrade() {
                    core.neutralize();
                }
            }

            dropped.len()
        };

        logging::debug!(self.log, "connection resources cleaned";
                        "context" => "cleanup",
                        "connection_id" => connection,
                        "locals" => dropped_locals,
                        "proxies" => dropped_proxies);
    }

    /// Registry sizes, exposed for tests and diagnostics:
    /// (services, locals, proxies).
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.services.lock().expect("Services poisoned").len(),
            self.locals.lock().expect("Locals poisoned").len(),
            self.proxies.lock().expect("Proxies poisoned").len(),
        )
    }

    /// True when no entry references the connection.
    pub fn is_clean(&self, connection: ConnectionId) -> bool {
        let locals = self.locals.lock().expect("Locals poisoned");
        let proxies = self.proxies.lock().expect("Proxies poisoned");

        locals.values().all(|resource| resource.owner != connection)
            && proxies.values().all(|record| record.source != connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ResourceManager {
        ResourceManager::new(&logging::discard())
    }

    #[test]
    fn test_service_registration_overwrites() {
        let resources = manager();

        resources.register_service("calc", Value::object(vec![("version", Value::from(1))]));
        resources.register_service("calc", Value::object(vec![("version", Value::from(2))]));

        let service = resources.service("calc").unwrap();
        assert_eq!(
            service.snapshot().walk(&["version".to_string()]),
            Some(&Value::from(2))
        );
        assert_eq!(resources.counts().0, 1);
    }

    #[test]
    fn test_mint_ids_never_reused() {
        let resources = manager();

        let first = resources.mint(Value::Null, 1, ResourceKind::Function);
        assert!(resources.release_local(first));

        let second = resources.mint(Value::Null, 1, ResourceKind::Function);
        assert_ne!(first, second);
    }

    #[test]
    fn test_release_local_idempotent() {
        let resources = manager();

        let id = resources.mint(Value::Null, 1, ResourceKind::RefObject);
        assert!(resources.release_local(id));
        assert!(!resources.release_local(id));
        assert!(resources.local(id).is_none());
    }

    #[test]
    fn test_cleanup_connection_scoped() {
        let resources = manager();

        let keep = resources.mint(Value::Null, 1, ResourceKind::Function);
        let drop_a = resources.mint(Value::Null, 2, ResourceKind::Function);
        let drop_b = resources.mint(Value::Null, 2, ResourceKind::RefObject);

        resources.cleanup_connection(2);

        assert!(resources.local(keep).is_some());
        assert!(resources.local(drop_a).is_none());
        assert!(resources.local(drop_b).is_none());
        assert!(resources.is_clean(2));
        assert!(!resources.is_clean(1));
    }
}
