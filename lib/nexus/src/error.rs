use crate::{ConnectionId, ResourceId};
use serde_derive::{Deserialize, Serialize};
use std::error;
use std::fmt;

/// Cause chains are cut at this depth when an error is prepared for the
/// wire; the remainder collapses into a `CircularCauseError` sentinel.
pub const MAX_CAUSE_DEPTH: usize = 8;

pub const CIRCULAR_CAUSE_NAME: &str = "CircularCauseError";

pub type NexusResult<T> = Result<T, NexusError>;

/// Top level error taxonomy. Every fallible public operation reports through
/// this enum; nothing in the runtime panics on a runtime fault.
#[derive(Debug, Clone, PartialEq)]
pub enum NexusError {
    /// Invalid API input. Surfaced synchronously, never sent on the wire.
    Usage(String),
    /// Missing endpoint, unresolvable named entity, ambiguous connect-to.
    Configuration(String),
    /// The call's expectation could not be met (`one` with 0 or >1, ...).
    Targeting(String),
    /// The target connection closed before the operation completed.
    Disconnected { connection: Option<ConnectionId> },
    /// The call deadline elapsed.
    Timeout { elapsed_ms: u64 },
    /// Malformed packet, unknown message type, serializer failure.
    Protocol(ProtocolError),
    /// The remote side reported a failure.
    Remote(SerializedError),
    /// Resource registry faults and execution-path faults.
    Resource(ResourceFault),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    UnknownMessageType(u8),
    MalformedPacket(String),
    Serialization(String),
    UnsupportedValue(&'static str),
    ChunkSession(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceFault {
    NotFound(ResourceId),
    AccessDenied(ResourceId),
    ServiceNotFound(String),
    PathUnresolved(String),
    NotCallable(String),
    EmptyAssignment,
    PolicyDenied(String),
    ProxyForwarded,
}

impl NexusError {
    #[inline]
    pub fn usage<S: Into<String>>(message: S) -> NexusError {
        NexusError::Usage(message.into())
    }

    #[inline]
    pub fn configuration<S: Into<String>>(message: S) -> NexusError {
        NexusError::Configuration(message.into())
    }

    #[inline]
    pub fn targeting<S: Into<String>>(message: S) -> NexusError {
        NexusError::Targeting(message.into())
    }

    #[inline]
    pub fn disconnected(connection: Option<ConnectionId>) -> NexusError {
        NexusError::Disconnected { connection }
    }

    /// Stable wire code for the error category.
    pub fn code(&self) -> &'static str {
        match self {
            NexusError::Usage(_) => "ERR_USAGE",
            NexusError::Configuration(_) => "ERR_CONFIGURATION",
            NexusError::Targeting(_) => "ERR_TARGETING",
            NexusError::Disconnected { .. } => "ERR_DISCONNECTED",
            NexusError::Timeout { .. } => "ERR_TIMEOUT",
            NexusError::Protocol(_) => "ERR_PROTOCOL",
            NexusError::Remote(_) => "ERR_REMOTE",
            NexusError::Resource(fault) => fault.code(),
        }
    }

    /// Prepares the error for transmission. Remote errors pass through
    /// unchanged so the original cause chain survives relaying.
    pub fn serialize(&self) -> SerializedError {
        match self {
            NexusError::Remote(inner) => inner.clone().capped(MAX_CAUSE_DEPTH),
            other => SerializedError::new("NexusError", other.code(), other.to_string()),
        }
    }
}

impl ResourceFault {
    pub fn code(&self) -> &'static str {
        match self {
            ResourceFault::NotFound(_) => "ERR_RESOURCE_NOT_FOUND",
            ResourceFault::AccessDenied(_) => "ERR_RESOURCE_ACCESS_DENIED",
            ResourceFault::ServiceNotFound(_) => "ERR_SERVICE_NOT_FOUND",
            ResourceFault::PathUnresolved(_) => "ERR_PATH_UNRESOLVED",
            ResourceFault::NotCallable(_) => "ERR_NOT_CALLABLE",
            ResourceFault::EmptyAssignment => "ERR_EMPTY_ASSIGNMENT",
            ResourceFault::PolicyDenied(_) => "ERR_POLICY_DENIED",
            ResourceFault::ProxyForwarded => "ERR_PROXY_FORWARDED",
        }
    }
}

impl fmt::Display for NexusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NexusError::Usage(message) => write!(f, "usage error: {}", message),
            NexusError::Configuration(message) => write!(f, "configuration error: {}", message),
            NexusError::Targeting(message) => write!(f, "targeting error: {}", message),
            NexusError::Disconnected { connection: Some(id) } => {
                write!(f, "connection {} closed before completion", id)
            }
            NexusError::Disconnected { connection: None } => {
                write!(f, "connection closed before completion")
            }
            NexusError::Timeout { elapsed_ms } => write!(f, "call timed out after {}ms", elapsed_ms),
            NexusError::Protocol(err) => write!(f, "protocol error: {}", err),
            NexusError::Remote(err) => write!(f, "remote error [{}]: {}", err.code, err.message),
            NexusError::Resource(fault) => write!(f, "resource error: {}", fault),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::UnknownMessageType(code) => write!(f, "unknown message type {}", code),
            ProtocolError::MalformedPacket(detail) => write!(f, "malformed packet: {}", detail),
            ProtocolError::Serialization(detail) => write!(f, "serialization failed: {}", detail),
            ProtocolError::UnsupportedValue(kind) => write!(f, "unsupported value: {}", kind),
            ProtocolError::ChunkSession(detail) => write!(f, "chunk session: {}", detail),
        }
    }
}

impl fmt::Display for ResourceFault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResourceFault::NotFound(id) => write!(f, "resource {} not found", id),
            ResourceFault::AccessDenied(id) => write!(f, "resource {} access denied", id),
            ResourceFault::ServiceNotFound(name) => write!(f, "service '{}' not found", name),
            ResourceFault::PathUnresolved(path) => write!(f, "path '{}' does not resolve", path),
            ResourceFault::NotCallable(path) => write!(f, "'{}' is not callable", path),
            ResourceFault::EmptyAssignment => write!(f, "assignment requires a non-empty path"),
            ResourceFault::PolicyDenied(detail) => write!(f, "denied by policy: {}", detail),
            ResourceFault::ProxyForwarded => write!(f, "a received proxy cannot be forwarded"),
        }
    }
}

impl error::Error for NexusError {}

impl From<ProtocolError> for NexusError {
    #[inline]
    fn from(err: ProtocolError) -> Self {
        NexusError::Protocol(err)
    }
}

impl From<ResourceFault> for NexusError {
    #[inline]
    fn from(fault: ResourceFault) -> Self {
        NexusError::Resource(fault)
    }
}

impl From<std::io::Error> for ProtocolError {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        ProtocolError::MalformedPacket(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    #[inline]
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Wire shape of a failure. `cause` nests recursively; chains deeper than
/// `MAX_CAUSE_DEPTH` end in a `CircularCauseError` sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    pub fn new<N, C, M>(name: N, code: C, message: M) -> SerializedError
    where
        N: Into<String>,
        C: Into<String>,
        M: Into<String>,
    {
        SerializedError {
            name: name.into(),
            code: code.into(),
            message: message.into(),
            cause: None,
            stack: None,
        }
    }

    pub fn with_cause(mut self, cause: SerializedError) -> SerializedError {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Cuts the cause chain at `depth`, replacing the remainder with the
    /// circular-cause sentinel.
    pub fn capped(mut self, depth: usize) -> SerializedError {
        if depth == 0 {
            return SerializedError::new(CIRCULAR_CAUSE_NAME, "ERR_CIRCULAR_CAUSE", "cause chain truncated");
        }

        self.cause = self.cause.take().map(|cause| Box::new(cause.capped(depth - 1)));
        self
    }

    /// Depth of the cause chain including this error.
    pub fn chain_len(&self) -> usize {
        match &self.cause {
            Some(cause) => 1 + cause.chain_len(),
            None => 1,
        }
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.name, self.code, self.message)
    }
}

impl From<SerializedError> for NexusError {
    #[inline]
    fn from(err: SerializedError) -> Self {
        NexusError::Remote(err)
    }
}
