//! Instance configuration: the endpoint adapter, the local identity,
//! exposed services, configured connections, named matchers/descriptors,
//! the policy hook and the tuning knobs. Configurations merge; the facade
//! snapshots the merged state when it builds the engine.

use crate::identity::{Descriptor, Identity, Matcher, Policy};
use crate::link::connection::LinkSettings;
use crate::net::port::PlatformEndpoint;
use crate::rpc::engine::EngineSettings;
use crate::value::Value;
use crate::ConnectionId;
use hashbrown::HashMap;
use lattice::logging::Logger;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CHUNK_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque service handle: the stable id names the exposed service, the
/// optional default target addresses calls that carry no explicit target.
#[derive(Clone, Debug)]
pub struct ServiceToken {
    id: String,
    default_target: Option<TargetSpec>,
}

impl ServiceToken {
    pub fn new<S: Into<String>>(id: S) -> ServiceToken {
        ServiceToken {
            id: id.into(),
            default_target: None,
        }
    }

    pub fn with_default_target(mut self, target: TargetSpec) -> ServiceToken {
        self.default_target = Some(target);
        self
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn default_target(&self) -> Option<&TargetSpec> {
        self.default_target.as_ref()
    }
}

/// User-facing addressing record. Named entries are resolved against the
/// instance registries when the target is materialized.
#[derive(Clone, Debug, Default)]
pub struct TargetSpec {
    pub connection: Option<ConnectionId>,
    pub descriptor: Option<Descriptor>,
    pub descriptor_name: Option<String>,
    pub matcher: Option<Matcher>,
    pub matcher_name: Option<String>,
    pub group: Option<String>,
}

impl TargetSpec {
    pub fn connection(id: ConnectionId) -> TargetSpec {
        TargetSpec {
            connection: Some(id),
            ..TargetSpec::default()
        }
    }

    pub fn descriptor(descriptor: Descriptor) -> TargetSpec {
        TargetSpec {
            descriptor: Some(descriptor),
            ..TargetSpec::default()
        }
    }

    pub fn named_descriptor<S: Into<String>>(name: S) -> TargetSpec {
        TargetSpec {
            descriptor_name: Some(name.into()),
            ..TargetSpec::default()
        }
    }

    pub fn matcher(matcher: Matcher) -> TargetSpec {
        TargetSpec {
            matcher: Some(matcher),
            ..TargetSpec::default()
        }
    }

    pub fn named_matcher<S: Into<String>>(name: S) -> TargetSpec {
        TargetSpec {
            matcher_name: Some(name.into()),
            ..TargetSpec::default()
        }
    }

    pub fn group<S: Into<String>>(name: S) -> TargetSpec {
        TargetSpec {
            group: Some(name.into()),
            ..TargetSpec::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connection.is_none()
            && self.descriptor.is_none()
            && self.descriptor_name.is_none()
            && self.matcher.is_none()
            && self.matcher_name.is_none()
            && self.group.is_none()
    }
}

/// Accumulating configuration. Every `configure` call merges another one of
/// these into the instance.
#[derive(Default)]
pub struct NexusConfig {
    pub(crate) endpoint: Option<Arc<dyn PlatformEndpoint>>,
    pub(crate) identity: Identity,
    pub(crate) connect_to: Vec<Descriptor>,
    pub(crate) services: Vec<(String, Value)>,
    pub(crate) matchers: HashMap<String, Matcher>,
    pub(crate) descriptors: HashMap<String, Descriptor>,
    pub(crate) policy: Option<Arc<dyn Policy>>,
    pub(crate) logger: Option<Logger>,
    pub(crate) chunk_size: Option<usize>,
    pub(crate) call_timeout: Option<Duration>,
    pub(crate) handshake_timeout: Option<Duration>,
    pub(crate) chunk_session_timeout: Option<Duration>,
}

impl NexusConfig {
    pub fn new() -> NexusConfig {
        NexusConfig::default()
    }

    pub fn endpoint(mut self, endpoint: Arc<dyn PlatformEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        crate::identity::merge_identity(&mut self.identity, &identity);
        self
    }

    pub fn connect_to(mut self, descriptor: Descriptor) -> Self {
        self.connect_to.push(descriptor);
        self
    }

    /// Exposes a service object under the token's id.
    pub fn expose(mut self, token: &ServiceToken, root: Value) -> Self {
        self.services.push((token.id().to_string(), root));
        self
    }

    pub fn named_matcher<S: Into<String>>(mut self, name: S, matcher: Matcher) -> Self {
        self.matchers.insert(name.into(), matcher);
        self
    }

    pub fn named_descriptor<S: Into<String>>(mut self, name: S, descriptor: Descriptor) -> Self {
        self.descriptors.insert(name.into(), descriptor);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn chunk_session_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_session_timeout = Some(timeout);
        self
    }

    /// Merges `other` into this configuration in place. Scalars overwrite
    /// when present, collections extend.
    pub(crate) fn merge(&mut self, other: NexusConfig) {
        if other.endpoint.is_some() {
            self.endpoint = other.endpoint;
        }
        if other.policy.is_some() {
            self.policy = other.policy;
        }
        if other.logger.is_some() {
            self.logger = other.logger;
        }
        if other.chunk_size.is_some() {
            self.chunk_size = other.chunk_size;
        }
        if other.call_timeout.is_some() {
            self.call_timeout = other.call_timeout;
        }
        if other.handshake_timeout.is_some() {
            self.handshake_timeout = other.handshake_timeout;
        }
        if other.chunk_session_timeout.is_some() {
            self.chunk_session_timeout = other.chunk_session_timeout;
        }

        crate::identity::merge_identity(&mut self.identity, &other.identity);
        self.connect_to.extend(other.connect_to);
        self.services.extend(other.services);
        self.matchers.extend(other.matchers);
        self.descriptors.extend(other.descriptors);
    }

    pub(crate) fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            link: LinkSettings {
                chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
                chunk_session_timeout: self.chunk_session_timeout.unwrap_or(DEFAULT_CHUNK_SESSION_TIMEOUT),
                handshake_timeout: self.handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
            },
            call_timeout: self.call_timeout.unwrap_or(DEFAULT_CALL_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::identity_from;
    use serde_json::json;

    #[test]
    fn test_merge_overwrites_scalars_extends_collections() {
        let mut base = NexusConfig::new()
            .identity(identity_from(vec![("context", json!("host"))]))
            .connect_to(identity_from(vec![("context", json!("a"))]))
            .chunk_size(1024);

        let patch = NexusConfig::new()
            .identity(identity_from(vec![("tab_id", json!(1))]))
            .connect_to(identity_from(vec![("context", json!("b"))]))
            .chunk_size(2048);

        base.merge(patch);

        assert_eq!(base.identity.get("context"), Some(&json!("host")));
        assert_eq!(base.identity.get("tab_id"), Some(&json!(1)));
        assert_eq!(base.connect_to.len(), 2);
        assert_eq!(base.chunk_size, Some(2048));
    }

    #[test]
    fn test_engine_settings_defaults() {
        let settings = NexusConfig::new().engine_settings();

        assert_eq!(settings.link.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.call_timeout, DEFAULT_CALL_TIMEOUT);
    }

    #[test]
    fn test_token_carries_default_target() {
        let token = ServiceToken::new("calc")
            .with_default_target(TargetSpec::named_descriptor("host"));

        assert_eq!(token.id(), "calc");
        assert_eq!(
            token.default_target().unwrap().descriptor_name.as_deref(),
            Some("host")
        );
    }

    #[test]
    fn test_target_spec_emptiness() {
        assert!(TargetSpec::default().is_empty());
        assert!(!TargetSpec::connection(3).is_empty());
        assert!(!TargetSpec::group("tabs").is_empty());
    }
}
