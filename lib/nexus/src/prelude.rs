pub use crate::config::{NexusConfig, ServiceToken, TargetSpec};
pub use crate::error::{NexusError, NexusResult, SerializedError};
pub use crate::identity::{identity_from, Descriptor, Identity, Matcher, Policy, Target};
pub use crate::nexus::{CreateOptions, MulticastOptions, Nexus};
pub use crate::rpc::call::Expectation;
pub use crate::rpc::pending::{SettledResult, SettledStream};
pub use crate::rpc::proxy::{MulticastProxy, ResourceProxy, ServiceProxy};
pub use crate::value::{Callback, ObjectRef, Value};
pub use crate::{ConnectionId, MessageId, ResourceId};
