//! Session lifecycle and bulk dispatch over an automated chat client.

pub mod actions;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod resolver;

pub use actions::{compose_message, mention_everyone, Messenger, DEFAULT_TAG_MESSAGE};
pub use config::{DispatchSettings, EngineConfig, Persistence, SessionConfig};
pub use dispatch::{dispatch, DeliveryOutcome, SkipReason};
pub use error::SessionError;
pub use lifecycle::{
    ConnectionHandle, ConnectionManager, ConnectionState, ReadinessArbiter, ReadinessEvent,
    ReadinessGoal, ReadinessOutcome, ReadyConnection,
};
pub use registry::{SessionEvent, SessionRegistry};
pub use resolver::{ExclusionSet, ResolvedEntry};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
