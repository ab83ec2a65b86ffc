//! Inbound dispatch. GET/SET/APPLY execute against a local resource or an
//! exposed service after an ownership check; responses and errors feed the
//! pending-call manager; release drops the referenced resource. Failures
//! inside a handler are serialized back on the originating message id.

use crate::error::{NexusError, NexusResult, ResourceFault};
use crate::identity::{Identity, Policy};
use crate::message::{Message, WireValue};
use crate::rpc::payload::PayloadProcessor;
use crate::rpc::pending::SettledResult;
use crate::rpc::resources::{ResourceKind, ResourceManager};
use crate::value::{Callback, ObjectRef, Value};
use crate::{ConnectionId, MessageId, ResourceId};
use lattice::logging::{self, Logger};
use std::sync::Arc;

/// The small interface the engine injects; the handler never sees the
/// engine itself.
pub struct HandlerLinks {
    pub send: Box<dyn Fn(ConnectionId, Message) + Send + Sync>,
    pub settle: Box<dyn Fn(MessageId, ConnectionId, SettledResult) + Send + Sync>,
    pub caller_identity: Box<dyn Fn(ConnectionId) -> Option<Identity> + Send + Sync>,
}

pub struct MessageHandler {
    resources: Arc<ResourceManager>,
    payload: Arc<PayloadProcessor>,
    policy: Arc<dyn Policy>,
    links: HandlerLinks,
    log: Logger,
}

enum ExecutionRoot {
    /// A service or ref-object tree, walked under its cell lock.
    Cell(ObjectRef),
    /// A function resource; callable only at the empty path.
    Direct(Value),
}

impl MessageHandler {
    pub fn new(
        resources: Arc<ResourceManager>,
        payload: Arc<PayloadProcessor>,
        policy: Arc<dyn Policy>,
        links: HandlerLinks,
        log: &Logger,
    ) -> MessageHandler {
        MessageHandler {
            resources,
            payload,
            policy,
            links,
            log: log.new(logging::o!()),
        }
    }

    pub fn handle(&self, source: ConnectionId, message: Message) {
        match message {
            Message::Get { id, resource, path } => {
                let result = self.execute_get(source, resource, &path);
                self.respond(source, id, result);
            }
            Message::Set {
                id,
                resource,
                path,
                value,
            } => {
                let result = self.execute_set(source, resource, &path, &value);
                self.respond(source, id, result);
            }
            Message::Apply {
                id,
                resource,
                path,
                args,
            } => {
                let result = self.execute_apply(source, resource, &path, &args);
                self.respond(source, id, result);
            }
            Message::Response { id, result } => match self.payload.revive(&result, source) {
                Ok(value) => (self.links.settle)(id, source, SettledResult::Fulfilled { value, from: source }),
                Err(err) => (self.links.settle)(
                    id,
                    source,
                    SettledResult::Rejected {
                        reason: err.serialize(),
                        from: source,
                    },
                ),
            },
            Message::Error { id, error } => {
                (self.links.settle)(id, source, SettledResult::Rejected { reason: error, from: source })
            }
            Message::Release { resource } => {
                // The sender owns the resource by the access check on every
                // other path; release is idempotent by design.
                self.resources.release_local(resource);
            }
            Message::Batch { id, .. } => {
                logging::debug!(self.log, "batch message refused"; "context" => "handle", "message_id" => id);
                self.respond(
                    source,
                    id,
                    Err(NexusError::Protocol(crate::error::ProtocolError::MalformedPacket(
                        "batch messages are reserved".to_string(),
                    ))),
                );
            }
            Message::BatchResponse { id, .. } => {
                logging::warn!(self.log, "uncorrelated batch response dropped";
                               "context" => "handle", "message_id" => id);
            }
            other => {
                logging::warn!(self.log, "message type not valid at this layer";
                               "context" => "handle", "message_type" => other.type_code());
            }
        }
    }

    fn respond(&self, source: ConnectionId, id: MessageId, result: NexusResult<WireValue>) {
        let message = match result {
            Ok(result) => Message::Response { id, result },
            Err(err) => Message::Error {
                id,
                error: err.serialize(),
            },
        };

        (self.links.send)(source, message);
    }

    fn execute_get(
        &self,
        source: ConnectionId,
        resource: Option<ResourceId>,
        path: &[String],
    ) -> NexusResult<WireValue> {
        let (root, path) = self.resolve_root(source, resource, path)?;

        let value = match root {
            ExecutionRoot::Cell(cell) => cell.with(|tree| {
                tree.walk(&path)
                    .cloned()
                    .ok_or_else(|| ResourceFault::PathUnresolved(path.join(".")))
            })?,
            ExecutionRoot::Direct(value) => {
                if path.is_empty() {
                    value
                } else {
                    return Err(ResourceFault::PathUnresolved(path.join(".")).into());
                }
            }
        };

        let mut minted = Vec::new();
        self.payload.sanitize(&value, source, &mut minted)
    }

    fn execute_set(
        &self,
        source: ConnectionId,
        resource: Option<ResourceId>,
        path: &[String],
        value: &WireValue,
    ) -> NexusResult<WireValue> {
        let (root, path) = self.resolve_root(source, resource, path)?;

        if path.is_empty() {
            return Err(ResourceFault::EmptyAssignment.into());
        }

        let value = self.payload.revive(value, source)?;

        match root {
            ExecutionRoot::Cell(cell) => cell.with(|tree| {
                if tree.assign(&path, value) {
                    Ok(())
                } else {
                    Err(ResourceFault::PathUnresolved(path.join(".")))
                }
            })?,
            ExecutionRoot::Direct(_) => return Err(ResourceFault::PathUnresolved(path.join(".")).into()),
        }

        Ok(WireValue::Null)
    }

    fn execute_apply(
        &self,
        source: ConnectionId,
        resource: Option<ResourceId>,
        path: &[String],
        args: &[WireValue],
    ) -> NexusResult<WireValue> {
        self.authorize(source, resource, path)?;

        let (root, path) = self.resolve_root(source, resource, path)?;

        let callee = match root {
            ExecutionRoot::Cell(cell) => cell.with(|tree| match tree.walk(&path) {
                Some(Value::Callback(callback)) => Ok(callback.clone()),
                Some(_) => Err(ResourceFault::NotCallable(path.join("."))),
                None => Err(ResourceFault::PathUnresolved(path.join("."))),
            })?,
            ExecutionRoot::Direct(value) => {
                if !path.is_empty() {
                    return Err(ResourceFault::PathUnresolved(path.join(".")).into());
                }

                match value {
                    Value::Callback(callback) => callback,
                    _ => return Err(ResourceFault::NotCallable("<resource>".to_string()).into()),
                }
            }
        };

        let args = args
            .iter()
            .map(|arg| self.payload.revive(arg, source))
            .collect::<NexusResult<Vec<_>>>()?;

        let result = self.invoke(callee, args)?;

        let mut minted = Vec::new();
        self.payload.sanitize(&result, source, &mut minted)
    }

    /// Invoked outside every registry and cell lock so the callee may
    /// re-enter the runtime freely.
    fn invoke(&self, callee: Callback, args: Vec<Value>) -> NexusResult<Value> {
        callee.invoke(args).map_err(NexusError::Remote)
    }

    fn authorize(
        &self,
        source: ConnectionId,
        resource: Option<ResourceId>,
        path: &[String],
    ) -> NexusResult<()> {
        let caller = (self.links.caller_identity)(source).unwrap_or_default();

        let service = match resource {
            Some(id) => format!("resource#{}", id),
            None => path.first().cloned().unwrap_or_default(),
        };
        let method = path.last().cloned().unwrap_or_default();

        if self.policy.can_call(&caller, &service, &method) {
            Ok(())
        } else {
            Err(ResourceFault::PolicyDenied(format!("{}.{}", service, method)).into())
        }
    }

    /// Resolves the execution root and the remaining path: a local resource
    /// after the ownership check, or the exposed service named by the first
    /// path segment.
    fn resolve_root(
        &self,
        source: ConnectionId,
        resource: Option<ResourceId>,
        path: &[String],
    ) -> NexusResult<(ExecutionRoot, Vec<String>)> {
        if let Some(id) = resource {
            let local = self
                .resources
                .local(id)
                .ok_or(ResourceFault::NotFound(id))?;

            if local.owner != source {
                logging::warn!(self.log, "resource access denied";
                               "context" => "resolve",
                               "resource_id" => id,
                               "owner" => local.owner,
                               "caller" => source);
                return Err(ResourceFault::AccessDenied(id).into());
            }

            let root = match (local.kind, &local.value) {
                (ResourceKind::RefObject, Value::Ref(cell)) => ExecutionRoot::Cell(cell.clone()),
                _ => ExecutionRoot::Direct(local.value.clone()),
            };

            return Ok((root, path.to_vec()));
        }

        let service_name = path
            .first()
            .ok_or_else(|| ResourceFault::PathUnresolved(String::new()))?;

        let service = self
            .resources
            .service(service_name)
            .ok_or_else(|| ResourceFault::ServiceNotFound(service_name.clone()))?;

        Ok((ExecutionRoot::Cell(service), path[1..].to_vec()))
    }
}
