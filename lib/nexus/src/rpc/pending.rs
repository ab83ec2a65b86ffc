//! Pending-call accounting. A registered call lives until exactly one of:
//! full settlement, deadline, or loss of every remaining target. Collect
//! calls resolve with the settled array; stream calls feed an async
//! iterator in arrival order.

use crate::error::SerializedError;
use crate::value::Value;
use crate::{ConnectionId, MessageId};
use futures::Stream;
use hashbrown::HashMap;
use lattice::logging::{self, Logger};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// The unit of broadcast accounting.
#[derive(Clone, Debug, PartialEq)]
pub enum SettledResult {
    Fulfilled { value: Value, from: ConnectionId },
    Rejected { reason: SerializedError, from: ConnectionId },
}

impl SettledResult {
    #[inline]
    pub fn from(&self) -> ConnectionId {
        match self {
            SettledResult::Fulfilled { from, .. } | SettledResult::Rejected { from, .. } => *from,
        }
    }

    #[inline]
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, SettledResult::Fulfilled { .. })
    }
}

/// Why a collect call finished; unicast adaptation needs to tell a deadline
/// apart from an empty-but-complete settlement.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinishReason {
    Complete,
    Deadline,
}

#[derive(Debug)]
pub struct CollectOutcome {
    pub settled: Vec<SettledResult>,
    pub reason: FinishReason,
}

/// Async iterator over settled results, ending when the call completes,
/// the deadline fires, or every target disconnects.
pub struct SettledStream {
    rx: mpsc::UnboundedReceiver<SettledResult>,
}

impl SettledStream {
    /// A stream that ends immediately; the empty-selection result.
    pub(crate) fn ended() -> SettledStream {
        let (_, rx) = mpsc::unbounded_channel();
        SettledStream { rx }
    }
}

impl Stream for SettledStream {
    type Item = SettledResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SettledResult>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

enum Sink {
    Collect(oneshot::Sender<CollectOutcome>),
    Stream(mpsc::UnboundedSender<SettledResult>),
}

struct PendingCall {
    remaining: Vec<ConnectionId>,
    collected: Vec<SettledResult>,
    unicast: bool,
    sink: Sink,
}

pub struct PendingCallManager {
    calls: Mutex<HashMap<MessageId, PendingCall>>,
    log: Logger,
}

impl PendingCallManager {
    pub fn new(log: &Logger) -> Arc<PendingCallManager> {
        Arc::new(PendingCallManager {
            calls: Mutex::new(HashMap::new()),
            log: log.new(logging::o!()),
        })
    }

    /// Registers a collect-strategy call expecting one response per target.
    pub fn register_collect(
        self: &Arc<Self>,
        id: MessageId,
        targets: Vec<ConnectionId>,
        unicast: bool,
        timeout: Duration,
    ) -> oneshot::Receiver<CollectOutcome> {
        let (tx, rx) = oneshot::channel();

        self.insert(
            id,
            PendingCall {
                remaining: targets,
                collected: Vec::new(),
                unicast,
                sink: Sink::Collect(tx),
            },
            timeout,
        );

        rx
    }

    /// Registers a stream-strategy call.
    pub fn register_stream(
        self: &Arc<Self>,
        id: MessageId,
        targets: Vec<ConnectionId>,
        timeout: Duration,
    ) -> SettledStream {
        let (tx, rx) = mpsc::unbounded_channel();

        self.insert(
            id,
            PendingCall {
                remaining: targets,
                collected: Vec::new(),
                unicast: false,
                sink: Sink::Stream(tx),
            },
            timeout,
        );

        SettledStream { rx }
    }

    /// Feeds one settled response. Unknown or already-settled sources are
    /// dropped; arrival past completion cannot grow the collected set.
    pub fn settle(&self, id: MessageId, from: ConnectionId, settled: SettledResult) {
        let mut calls = self.calls.lock().expect("Calls poisoned");

        let call = match calls.get_mut(&id) {
            Some(call) => call,
            None => {
                logging::debug!(self.log, "uncorrelated response dropped";
                                "context" => "settle", "message_id" => id, "from" => from);
                return;
            }
        };

        let position = match call.remaining.iter().position(|target| *target == from) {
            Some(position) => position,
            None => {
                logging::debug!(self.log, "duplicate response dropped";
                                "context" => "settle", "message_id" => id, "from" => from);
                return;
            }
        };

        call.remaining.remove(position);
        call.push(settled);

        if call.remaining.is_empty() {
            let call = calls.remove(&id).expect("Call present");
            call.finish(FinishReason::Complete);
        }
    }

    /// Removes the connection from every outstanding call. Single-target
    /// unicast calls settle rejected immediately; multi-target calls shrink
    /// their expectation and may complete early.
    pub fn on_disconnect(&self, connection: ConnectionId) {
        let mut calls = self.calls.lock().expect("Calls poisoned");

        let affected: Vec<MessageId> = calls
            .iter()
            .filter(|(_, call)| call.remaining.contains(&connection))
            .map(|(id, _)| *id)
            .collect();

        for id in affected {
            let mut call = calls.remove(&id).expect("Call present");
            call.remaining.retain(|target| *target != connection);

            if call.unicast {
                call.push(SettledResult::Rejected {
                    reason: SerializedError::new(
                        "NexusError",
                        "ERR_DISCONNECTED",
                        format!("connection {} closed before completion", connection),
                    ),
                    from: connection,
                });
            }

            if call.remaining.is_empty() {
                call.finish(FinishReason::Complete);
            } else {
                calls.insert(id, call);
            }
        }
    }

    /// Fails every outstanding call, used on shutdown.
    pub fn fail_all_disconnected(&self) {
        let mut calls = self.calls.lock().expect("Calls poisoned");

        for (_, mut call) in calls.drain() {
            let remaining = std::mem::replace(&mut call.remaining, Vec::new());
            for from in remaining {
                call.push(SettledResult::Rejected {
                    reason: SerializedError::new("NexusError", "ERR_DISCONNECTED", "instance shut down"),
                    from,
                });
            }
            call.finish(FinishReason::Complete);
        }
    }

    /// Number of calls awaiting settlement.
    pub fn outstanding(&self) -> usize {
        self.calls.lock().expect("Calls poisoned").len()
    }

    fn insert(self: &Arc<Self>, id: MessageId, call: PendingCall, timeout: Duration) {
        self.calls.lock().expect("Calls poisoned").insert(id, call);

        let manager: Weak<PendingCallManager> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.on_deadline(id);
            }
        });
    }

    fn on_deadline(&self, id: MessageId) {
        let call = self.calls.lock().expect("Calls poisoned").remove(&id);

        if let Some(call) = call {
            logging::debug!(self.log, "pending call deadline fired";
                            "context" => "deadline", "message_id" => id);
            call.finish(FinishReason::Deadline);
        }
    }
}

impl PendingCall {
    fn push(&mut self, settled: SettledResult) {
        match &self.sink {
            Sink::Stream(tx) => {
                drop(tx.send(settled));
            }
            Sink::Collect(_) => self.collected.push(settled),
        }
    }

    fn finish(self, reason: FinishReason) {
        match self.sink {
            Sink::Collect(tx) => {
                drop(tx.send(CollectOutcome {
                    settled: self.collected,
                    reason,
                }));
            }
            // Dropping the sender ends the stream.
            Sink::Stream(_) => (),
        }
    }
}
