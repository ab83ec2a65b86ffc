//! Identity records, descriptors, matchers and addressing targets. The core
//! never interprets identity fields; it only compares them structurally or
//! feeds them to user-supplied predicates.

use crate::ConnectionId;
use std::fmt;
use std::sync::Arc;

/// Application-defined identity record, e.g. `{"context": "content-script",
/// "tab_id": 7}`.
pub type Identity = serde_json::Map<String, serde_json::Value>;

/// Structural subset of an identity used to find or create a connection.
pub type Descriptor = serde_json::Map<String, serde_json::Value>;

/// Channel-level provenance attached by the platform adapter on handshake.
pub type PlatformInfo = serde_json::Map<String, serde_json::Value>;

/// Predicate on identities used to select among existing connections.
#[derive(Clone)]
pub struct Matcher {
    func: Arc<dyn Fn(&Identity) -> bool + Send + Sync>,
}

impl Matcher {
    pub fn new<F>(func: F) -> Matcher
    where
        F: Fn(&Identity) -> bool + Send + Sync + 'static,
    {
        Matcher { func: Arc::new(func) }
    }

    #[inline]
    pub fn test(&self, identity: &Identity) -> bool {
        (self.func)(identity)
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<matcher>")
    }
}

/// Two records match iff every key in the descriptor equals the
/// corresponding key of the candidate identity.
pub fn descriptor_matches(descriptor: &Descriptor, identity: &Identity) -> bool {
    descriptor
        .iter()
        .all(|(key, expected)| identity.get(key) == Some(expected))
}

/// Merges `patch` into `base`, replacing existing fields.
pub fn merge_identity(base: &mut Identity, patch: &Identity) {
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
}

/// Group membership: either a `group` string field or a `groups` string
/// array on the identity.
pub fn in_group(identity: &Identity, group: &str) -> bool {
    match identity.get("group") {
        Some(serde_json::Value::String(name)) if name == group => return true,
        _ => (),
    }

    match identity.get("groups") {
        Some(serde_json::Value::Array(names)) => names
            .iter()
            .any(|name| name.as_str() == Some(group)),
        _ => false,
    }
}

/// Authorization hooks consulted on connection acceptance and on every
/// remote invocation. The default allows everything.
pub trait Policy: Send + Sync {
    fn can_connect(&self, _identity: &Identity, _platform: &PlatformInfo) -> bool {
        true
    }

    fn can_call(&self, _caller: &Identity, _service: &str, _method: &str) -> bool {
        true
    }
}

/// The default policy: every peer may connect and call.
pub struct AllowAll;

impl Policy for AllowAll {}

/// Addressing record understood by the connection manager. An empty target
/// addresses every ready connection (broadcast only).
#[derive(Clone, Debug, Default)]
pub struct Target {
    pub connection: Option<ConnectionId>,
    pub descriptor: Option<Descriptor>,
    pub matcher: Option<Matcher>,
    pub group: Option<String>,
}

impl Target {
    #[inline]
    pub fn to_connection(id: ConnectionId) -> Target {
        Target {
            connection: Some(id),
            ..Target::default()
        }
    }

    #[inline]
    pub fn to_descriptor(descriptor: Descriptor) -> Target {
        Target {
            descriptor: Some(descriptor),
            ..Target::default()
        }
    }

    #[inline]
    pub fn to_matcher(matcher: Matcher) -> Target {
        Target {
            matcher: Some(matcher),
            ..Target::default()
        }
    }

    #[inline]
    pub fn to_group<S: Into<String>>(name: S) -> Target {
        Target {
            group: Some(name.into()),
            ..Target::default()
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.connection.is_none() && self.descriptor.is_none() && self.matcher.is_none() && self.group.is_none()
    }

    /// True when the target selects the given identity. The connection-id
    /// dimension is resolved by the manager, not here.
    pub fn selects(&self, identity: &Identity) -> bool {
        if let Some(descriptor) = &self.descriptor {
            if !descriptor_matches(descriptor, identity) {
                return false;
            }
        }

        if let Some(matcher) = &self.matcher {
            if !matcher.test(identity) {
                return false;
            }
        }

        if let Some(group) = &self.group {
            if !in_group(identity, group) {
                return false;
            }
        }

        true
    }
}

/// Builds an identity map from JSON-compatible pairs.
pub fn identity_from<I>(entries: I) -> Identity
where
    I: IntoIterator<Item = (&'static str, serde_json::Value)>,
{
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content_script() -> Identity {
        identity_from(vec![
            ("context", json!("content-script")),
            ("tab_id", json!(7)),
            ("groups", json!(["tabs", "scripts"])),
        ])
    }

    #[test]
    fn test_descriptor_subset_matches() {
        let descriptor = identity_from(vec![("context", json!("content-script"))]);

        assert!(descriptor_matches(&descriptor, &content_script()));
    }

    #[test]
    fn test_descriptor_mismatch() {
        let descriptor = identity_from(vec![("context", json!("popup"))]);

        assert!(!descriptor_matches(&descriptor, &content_script()));
    }

    #[test]
    fn test_descriptor_missing_key() {
        let descriptor = identity_from(vec![("frame_id", json!(0))]);

        assert!(!descriptor_matches(&descriptor, &content_script()));
    }

    #[test]
    fn test_empty_descriptor_matches_all() {
        assert!(descriptor_matches(&Descriptor::new(), &content_script()));
    }

    #[test]
    fn test_merge_replaces_fields() {
        let mut identity = content_script();
        let patch = identity_from(vec![("tab_id", json!(9)), ("is_active", json!(true))]);

        merge_identity(&mut identity, &patch);

        assert_eq!(identity.get("tab_id"), Some(&json!(9)));
        assert_eq!(identity.get("is_active"), Some(&json!(true)));
        assert_eq!(identity.get("context"), Some(&json!("content-script")));
    }

    #[test]
    fn test_group_membership() {
        assert!(in_group(&content_script(), "tabs"));
        assert!(!in_group(&content_script(), "popups"));

        let single = identity_from(vec![("group", json!("tabs"))]);
        assert!(in_group(&single, "tabs"));
    }

    #[test]
    fn test_target_selects_by_all_dimensions() {
        let target = Target {
            descriptor: Some(identity_from(vec![("context", json!("content-script"))])),
            matcher: Some(Matcher::new(|identity| {
                identity.get("tab_id") == Some(&json!(7))
            })),
            group: Some("tabs".to_string()),
            connection: None,
        };

        assert!(target.selects(&content_script()));

        let target = Target {
            matcher: Some(Matcher::new(|_| false)),
            ..target
        };
        assert!(!target.selects(&content_script()));
    }
}
