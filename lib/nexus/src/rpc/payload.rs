//! The reference-passing algebra: `sanitize` turns an in-memory value into
//! a wire tree, interning callbacks and ref-wrapped objects as resources
//! owned by the target connection; `revive` is the inverse, minting proxies
//! for resource placeholders against the source connection.

use crate::error::{NexusError, NexusResult, ProtocolError, ResourceFault};
use crate::message::WireValue;
use crate::rpc::engine::Engine;
use crate::rpc::proxy::{ProxyCore, ResourceProxy};
use crate::rpc::resources::{ProxyRecord, ResourceKind, ResourceManager};
use crate::value::Value;
use crate::{ConnectionId, ResourceId};
use lattice::logging::{self, Logger};
use serde_json::Value as Json;
use std::sync::{Arc, Weak};

/// Reserved non-printable marker opening every placeholder.
pub const PLACEHOLDER_PREFIX: char = '\u{10}';

/// Strings beginning with either reserved character are escaped with this.
pub const ESCAPE_PREFIX: char = '\u{1b}';

const KIND_RESOURCE: char = 'R';
const KIND_UNDEFINED: char = 'U';
const KIND_MAP: char = 'M';
const KIND_SET: char = 'S';
const KIND_BIGINT: char = 'N';

pub struct PayloadProcessor {
    resources: Arc<ResourceManager>,
    engine: Weak<Engine>,
    log: Logger,
}

impl PayloadProcessor {
    pub fn new(resources: Arc<ResourceManager>, engine: Weak<Engine>, log: &Logger) -> PayloadProcessor {
        PayloadProcessor {
            resources,
            engine,
            log: log.new(logging::o!()),
        }
    }

    /// Encodes a value for transmission to `target`. Freshly minted
    /// resource ids are appended to `minted` so a failed send can reclaim
    /// them.
    pub fn sanitize(
        &self,
        value: &Value,
        target: ConnectionId,
        minted: &mut Vec<ResourceId>,
    ) -> NexusResult<WireValue> {
        let wire = match value {
            Value::Null => Json::Null,
            Value::Undefined => placeholder(KIND_UNDEFINED, None),
            Value::Bool(flag) => Json::Bool(*flag),
            Value::Number(number) => serde_json::Number::from_f64(*number)
                .map(Json::Number)
                .ok_or(ProtocolError::UnsupportedValue("non-finite number"))?,
            Value::String(text) => Json::String(escape(text)),
            Value::BigInt(digits) => placeholder(KIND_BIGINT, Some(digits.clone())),
            Value::Array(items) => Json::Array(
                items
                    .iter()
                    .map(|item| self.sanitize(item, target, minted))
                    .collect::<NexusResult<Vec<_>>>()?,
            ),
            Value::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (key, field) in fields {
                    map.insert(key.clone(), self.sanitize(field, target, minted)?);
                }
                Json::Object(map)
            }
            Value::Map(entries) => {
                let mut wire_entries = Vec::with_capacity(entries.len());
                for (key, entry) in entries {
                    wire_entries.push(Json::Array(vec![
                        self.sanitize(key, target, minted)?,
                        self.sanitize(entry, target, minted)?,
                    ]));
                }
                placeholder(KIND_MAP, Some(to_compact_json(&Json::Array(wire_entries))?))
            }
            Value::Set(members) => {
                let wire_members = members
                    .iter()
                    .map(|member| self.sanitize(member, target, minted))
                    .collect::<NexusResult<Vec<_>>>()?;
                placeholder(KIND_SET, Some(to_compact_json(&Json::Array(wire_members))?))
            }
            Value::Callback(_) => {
                let id = self.resources.mint(value.clone(), target, ResourceKind::Function);
                minted.push(id);
                placeholder(KIND_RESOURCE, Some(id.to_string()))
            }
            Value::Ref(_) => {
                let id = self.resources.mint(value.clone(), target, ResourceKind::RefObject);
                minted.push(id);
                placeholder(KIND_RESOURCE, Some(id.to_string()))
            }
            Value::Proxy(_) => return Err(ResourceFault::ProxyForwarded.into()),
        };

        Ok(wire)
    }

    /// Decodes a wire tree received from `source`, minting proxies for
    /// resource placeholders.
    pub fn revive(&self, wire: &WireValue, source: ConnectionId) -> NexusResult<Value> {
        let value = match wire {
            Json::Null => Value::Null,
            Json::Bool(flag) => Value::Bool(*flag),
            Json::Number(number) => Value::Number(
                number
                    .as_f64()
                    .ok_or(ProtocolError::UnsupportedValue("non-finite number"))?,
            ),
            Json::String(text) => self.revive_string(text, source)?,
            Json::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.revive(item, source))
                    .collect::<NexusResult<Vec<_>>>()?,
            ),
            Json::Object(fields) => {
                let mut map = indexmap::IndexMap::with_capacity(fields.len());
                for (key, field) in fields {
                    map.insert(key.clone(), self.revive(field, source)?);
                }
                Value::Object(map)
            }
        };

        Ok(value)
    }

    /// Reclaims resources minted for a message that never reached the wire.
    pub fn reclaim(&self, minted: &[ResourceId]) {
        for id in minted {
            self.resources.release_local(*id);
        }

        if !minted.is_empty() {
            logging::debug!(self.log, "reclaimed unsent resources";
                            "context" => "reclaim", "count" => minted.len());
        }
    }

    fn revive_string(&self, text: &str, source: ConnectionId) -> NexusResult<Value> {
        let mut chars = text.chars();

        match chars.next() {
            Some(ESCAPE_PREFIX) => Ok(Value::String(chars.as_str().to_string())),
            Some(PLACEHOLDER_PREFIX) => self.revive_placeholder(chars.as_str(), source),
            _ => Ok(Value::String(text.to_string())),
        }
    }

    fn revive_placeholder(&self, body: &str, source: ConnectionId) -> NexusResult<Value> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ProtocolError::MalformedPacket("empty placeholder".to_string()))?;

        let payload = match chars.next() {
            None => None,
            Some(':') => Some(chars.as_str()),
            Some(_) => {
                return Err(ProtocolError::MalformedPacket("placeholder missing separator".to_string()).into())
            }
        };

        match (kind, payload) {
            (KIND_UNDEFINED, None) => Ok(Value::Undefined),
            (KIND_BIGINT, Some(digits)) => Ok(Value::BigInt(digits.to_string())),
            (KIND_RESOURCE, Some(digits)) => {
                let resource: ResourceId = digits
                    .parse()
                    .map_err(|_| ProtocolError::MalformedPacket("invalid resource id".to_string()))?;
                self.mint_proxy(resource, source)
            }
            (KIND_MAP, Some(entries)) => {
                let wire: Json = serde_json::from_str(entries).map_err(ProtocolError::from)?;
                let items = wire
                    .as_array()
                    .ok_or_else(|| ProtocolError::MalformedPacket("map payload is not an array".to_string()))?;

                let mut pairs = Vec::with_capacity(items.len());
                for item in items {
                    let entry = item.as_array().filter(|entry| entry.len() == 2).ok_or_else(|| {
                        ProtocolError::MalformedPacket("map entry is not a pair".to_string())
                    })?;
                    pairs.push((self.revive(&entry[0], source)?, self.revive(&entry[1], source)?));
                }
                Ok(Value::Map(pairs))
            }
            (KIND_SET, Some(members)) => {
                let wire: Json = serde_json::from_str(members).map_err(ProtocolError::from)?;
                let items = wire
                    .as_array()
                    .ok_or_else(|| ProtocolError::MalformedPacket("set payload is not an array".to_string()))?;

                items
                    .iter()
                    .map(|item| self.revive(item, source))
                    .collect::<NexusResult<Vec<_>>>()
                    .map(Value::Set)
            }
            (kind, _) => {
                Err(ProtocolError::MalformedPacket(format!("unknown placeholder kind '{}'", kind)).into())
            }
        }
    }

    fn mint_proxy(&self, resource: ResourceId, source: ConnectionId) -> NexusResult<Value> {
        if self.engine.upgrade().is_none() {
            return Err(NexusError::disconnected(Some(source)));
        }

        let core = ProxyCore::new(resource, source, self.engine.clone());
        self.resources.register_proxy(
            resource,
            ProxyRecord {
                source,
                core: Arc::downgrade(&core),
            },
        );

        Ok(Value::Proxy(ResourceProxy::new(core)))
    }
}

fn placeholder(kind: char, payload: Option<String>) -> Json {
    let mut text = String::with_capacity(3 + payload.as_ref().map_or(0, String::len));
    text.push(PLACEHOLDER_PREFIX);
    text.push(kind);

    if let Some(payload) = payload {
        text.push(':');
        text.push_str(&payload);
    }

    Json::String(text)
}

fn escape(text: &str) -> String {
    match text.chars().next() {
        Some(PLACEHOLDER_PREFIX) | Some(ESCAPE_PREFIX) => {
            let mut escaped = String::with_capacity(text.len() + 1);
            escaped.push(ESCAPE_PREFIX);
            escaped.push_str(text);
            escaped
        }
        _ => text.to_string(),
    }
}

fn to_compact_json(value: &Json) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Callback;

    fn processor() -> PayloadProcessor {
        PayloadProcessor::new(
            Arc::new(ResourceManager::new(&logging::discard())),
            Weak::new(),
            &logging::discard(),
        )
    }

    fn round_trip(processor: &PayloadProcessor, value: &Value) -> Value {
        let mut minted = Vec::new();
        let wire = processor.sanitize(value, 1, &mut minted).unwrap();
        processor.revive(&wire, 1).unwrap()
    }

    #[test]
    fn test_identity_on_plain_values() {
        let processor = processor();

        let probes = vec![
            Value::Null,
            Value::Undefined,
            Value::Bool(true),
            Value::Number(0.5),
            Value::from("plain text"),
            Value::BigInt("123456789012345678901234567890".to_string()),
            Value::Array(vec![Value::from(1), Value::Undefined, Value::from("x")]),
            Value::object(vec![
                ("nested", Value::object(vec![("deep", Value::Null)])),
                ("list", Value::Array(vec![Value::from(false)])),
            ]),
            Value::Map(vec![
                (Value::from("k"), Value::from(1)),
                (Value::from(2), Value::Undefined),
            ]),
            Value::Set(vec![Value::from("a"), Value::from("b")]),
        ];

        for probe in probes {
            assert_eq!(round_trip(&processor, &probe), probe);
        }
    }

    #[test]
    fn test_escape_law() {
        let processor = processor();

        let tricky = vec![
            format!("{}R:42", PLACEHOLDER_PREFIX),
            format!("{}already escaped", ESCAPE_PREFIX),
            format!("{}{}double", ESCAPE_PREFIX, PLACEHOLDER_PREFIX),
        ];

        for text in tricky {
            let probe = Value::String(text.clone());
            assert_eq!(round_trip(&processor, &probe), probe);
        }
    }

    #[test]
    fn test_escaped_string_is_prefixed_on_wire() {
        let processor = processor();
        let mut minted = Vec::new();

        let text = format!("{}U", PLACEHOLDER_PREFIX);
        let wire = processor
            .sanitize(&Value::String(text.clone()), 1, &mut minted)
            .unwrap();

        match wire {
            Json::String(on_wire) => {
                assert!(on_wire.starts_with(ESCAPE_PREFIX));
                assert_eq!(&on_wire[ESCAPE_PREFIX.len_utf8()..], text);
            }
            other => panic!("Expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_callback_interned_as_owned_resource() {
        let processor = processor();
        let mut minted = Vec::new();

        let wire = processor
            .sanitize(&Value::Callback(Callback::new(|_| Ok(Value::Null))), 7, &mut minted)
            .unwrap();

        assert_eq!(minted.len(), 1);

        let local = processor.resources.local(minted[0]).unwrap();
        assert_eq!(local.owner, 7);
        assert_eq!(local.kind, ResourceKind::Function);

        match wire {
            Json::String(text) => {
                assert!(text.starts_with(PLACEHOLDER_PREFIX));
                assert!(text.contains(&format!("R:{}", minted[0])));
            }
            other => panic!("Expected placeholder, got {:?}", other),
        }
    }

    #[test]
    fn test_ref_interned_as_ref_object() {
        let processor = processor();
        let mut minted = Vec::new();

        processor
            .sanitize(
                &Value::reference(Value::object(vec![("count", Value::from(0))])),
                3,
                &mut minted,
            )
            .unwrap();

        let local = processor.resources.local(minted[0]).unwrap();
        assert_eq!(local.kind, ResourceKind::RefObject);
        assert_eq!(local.owner, 3);
    }

    #[test]
    fn test_non_finite_number_is_protocol_error() {
        let processor = processor();
        let mut minted = Vec::new();

        assert!(processor.sanitize(&Value::Number(f64::NAN), 1, &mut minted).is_err());
    }

    #[test]
    fn test_proxy_cannot_be_forwarded() {
        let processor = processor();
        let mut minted = Vec::new();

        let wire = placeholder(KIND_RESOURCE, Some("55".to_string()));
        // Without a live engine a resource placeholder cannot be revived,
        // which doubles as the forwarding guard probe here.
        assert!(processor.revive(&wire, 1).is_err());

        let probe = Value::Map(vec![(Value::from("k"), Value::Undefined)]);
        assert!(processor.sanitize(&probe, 1, &mut minted).is_ok());
    }

    #[test]
    fn test_reclaim_releases_minted() {
        let processor = processor();
        let mut minted = Vec::new();

        processor
            .sanitize(&Value::callback(|_| Ok(Value::Null)), 1, &mut minted)
            .unwrap();
        assert_eq!(processor.resources.counts().1, 1);

        processor.reclaim(&minted);
        assert_eq!(processor.resources.counts().1, 0);
    }

    #[test]
    fn test_unknown_placeholder_kind_rejected() {
        let processor = processor();

        let wire = placeholder('Z', Some("x".to_string()));
        assert!(processor.revive(&wire, 1).is_err());
    }
}
