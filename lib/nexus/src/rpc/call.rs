//! One outbound call's lifecycle: sanitize against each target, send,
//! register the pending call, and adapt the settled outcome to the caller's
//! expectation.

use crate::error::{NexusError, NexusResult, SerializedError};
use crate::identity::Target;
use crate::link::manager::ConnectionManager;
use crate::message::{next_message_id, Message};
use crate::rpc::payload::PayloadProcessor;
use crate::rpc::pending::{CollectOutcome, FinishReason, PendingCallManager, SettledResult, SettledStream};
use crate::value::Value;
use crate::{ConnectionId, MessageId, ResourceId};
use lattice::logging::{self, Logger};
use std::sync::Arc;
use std::time::Duration;

/// Unicast adaptation: `One` demands exactly one settlement and surfaces
/// its rejection; `First` takes the first fulfilled value and degrades to
/// undefined when nothing settles fulfilled or rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expectation {
    One,
    First,
}

#[derive(Clone, Debug)]
pub enum CallKind {
    Get,
    Set(Value),
    Apply(Vec<Value>),
}

#[derive(Clone, Debug)]
pub struct CallSpec {
    pub kind: CallKind,
    pub resource: Option<ResourceId>,
    pub path: Vec<String>,
    pub timeout: Option<Duration>,
}

pub struct CallProcessor {
    manager: Arc<ConnectionManager>,
    pending: Arc<PendingCallManager>,
    payload: Arc<PayloadProcessor>,
    default_timeout: Duration,
    log: Logger,
}

impl CallProcessor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        pending: Arc<PendingCallManager>,
        payload: Arc<PayloadProcessor>,
        default_timeout: Duration,
        log: &Logger,
    ) -> CallProcessor {
        CallProcessor {
            manager,
            pending,
            payload,
            default_timeout,
            log: log.new(logging::o!()),
        }
    }

    /// Dispatches to one connection and adapts the single settlement.
    pub async fn unicast(
        &self,
        connection: ConnectionId,
        spec: CallSpec,
        expects: Expectation,
    ) -> NexusResult<Value> {
        let id = next_message_id();
        let timeout = spec.timeout.unwrap_or(self.default_timeout);

        let rx = self.pending.register_collect(id, vec![connection], true, timeout);

        self.send_one(id, &spec, connection);

        let outcome = rx
            .await
            .map_err(|_| NexusError::disconnected(Some(connection)))?;

        adapt_unicast(outcome, expects, timeout)
    }

    /// Fans out to every connection the target selects and collects all
    /// settled results; partial on deadline, empty on empty selection.
    pub async fn collect(&self, target: &Target, spec: CallSpec) -> NexusResult<Vec<SettledResult>> {
        let targets = self.selected_ids(target);

        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let id = next_message_id();
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let rx = self.pending.register_collect(id, targets.clone(), false, timeout);

        for connection in targets {
            self.send_one(id, &spec, connection);
        }

        let outcome = rx.await.map_err(|_| NexusError::disconnected(None))?;
        Ok(outcome.settled)
    }

    /// Fans out like `collect` but yields settled results as they arrive.
    pub fn stream(&self, target: &Target, spec: CallSpec) -> NexusResult<SettledStream> {
        let targets = self.selected_ids(target);

        if targets.is_empty() {
            return Ok(SettledStream::ended());
        }

        let id = next_message_id();
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let stream = self.pending.register_stream(id, targets.clone(), timeout);

        for connection in targets {
            self.send_one(id, &spec, connection);
        }

        Ok(stream)
    }

    fn selected_ids(&self, target: &Target) -> Vec<ConnectionId> {
        self.manager
            .resolve_targets(target)
            .into_iter()
            .filter_map(|connection| connection.id())
            .collect()
    }

    /// Builds, sanitizes and sends the message for one target. Failures
    /// settle the target immediately and reclaim any freshly minted
    /// resources; the pending call keeps its accounting consistent.
    fn send_one(&self, id: MessageId, spec: &CallSpec, connection: ConnectionId) {
        let mut minted = Vec::new();

        let message = match self.build_message(id, spec, connection, &mut minted) {
            Ok(message) => message,
            Err(err) => {
                logging::warn!(self.log, "call payload rejected";
                               "context" => "dispatch", "connection_id" => connection, "error" => %err);
                self.payload.reclaim(&minted);
                self.pending.settle(
                    id,
                    connection,
                    SettledResult::Rejected {
                        reason: err.serialize(),
                        from: connection,
                    },
                );
                return;
            }
        };

        if let Err(err) = self.manager.send_to(connection, &message) {
            logging::debug!(self.log, "call target unreachable";
                            "context" => "dispatch", "connection_id" => connection, "error" => %err);
            self.payload.reclaim(&minted);
            self.pending.settle(
                id,
                connection,
                SettledResult::Rejected {
                    reason: err.serialize(),
                    from: connection,
                },
            );
        }
    }

    fn build_message(
        &self,
        id: MessageId,
        spec: &CallSpec,
        connection: ConnectionId,
        minted: &mut Vec<ResourceId>,
    ) -> NexusResult<Message> {
        let message = match &spec.kind {
            CallKind::Get => Message::Get {
                id,
                resource: spec.resource,
                path: spec.path.clone(),
            },
            CallKind::Set(value) => Message::Set {
                id,
                resource: spec.resource,
                path: spec.path.clone(),
                value: self.payload.sanitize(value, connection, minted)?,
            },
            CallKind::Apply(args) => Message::Apply {
                id,
                resource: spec.resource,
                path: spec.path.clone(),
                args: args
                    .iter()
                    .map(|arg| self.payload.sanitize(arg, connection, minted))
                    .collect::<NexusResult<Vec<_>>>()?,
            },
        };

        Ok(message)
    }
}

fn adapt_unicast(outcome: CollectOutcome, expects: Expectation, timeout: Duration) -> NexusResult<Value> {
    if outcome.reason == FinishReason::Deadline {
        return Err(NexusError::Timeout {
            elapsed_ms: timeout.as_millis() as u64,
        });
    }

    match expects {
        Expectation::One => {
            if outcome.settled.len() != 1 {
                return Err(NexusError::targeting(format!(
                    "expected exactly one settlement, got {}",
                    outcome.settled.len()
                )));
            }

            match outcome.settled.into_iter().next().expect("One settlement") {
                SettledResult::Fulfilled { value, .. } => Ok(value),
                SettledResult::Rejected { reason, from } => Err(remote_error(reason, from)),
            }
        }
        Expectation::First => {
            let mut first_rejection = None;

            for settled in outcome.settled {
                match settled {
                    SettledResult::Fulfilled { value, .. } => return Ok(value),
                    SettledResult::Rejected { reason, from } => {
                        first_rejection.get_or_insert((reason, from));
                    }
                }
            }

            match first_rejection {
                Some((reason, from)) => Err(remote_error(reason, from)),
                None => Ok(Value::Undefined),
            }
        }
    }
}

/// Locally minted disconnection rejections surface as disconnected errors,
/// everything else as the remote failure it is.
fn remote_error(reason: SerializedError, from: ConnectionId) -> NexusError {
    if reason.code == "ERR_DISCONNECTED" && reason.name == "NexusError" {
        NexusError::disconnected(Some(from))
    } else {
        NexusError::Remote(reason)
    }
}
