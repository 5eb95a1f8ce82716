//! Peer supervision for toolmux.
//!
//! - [`PeerChannel`]: request/response correlation over one peer's stdio
//! - [`PeerHandle`]: a running peer, its channel, and its teardown ladder
//! - [`Supervisor`]: spawns a peer set all-or-nothing and tracks it
//! - [`ToolRegistry`] / [`Dispatcher`]: route a tool name to its owning peer
//! - [`LifecycleCoordinator`]: the single, exactly-once teardown entry point

pub mod channel;
pub mod dispatcher;
pub mod handle;
pub mod lifecycle;
pub mod registry;
pub mod supervisor;

#[cfg(all(test, unix))]
mod test_support;

pub use channel::{ChannelError, PeerChannel};
pub use dispatcher::Dispatcher;
pub use handle::{PeerHandle, PeerState, PeerTermination, TerminationOutcome, TerminationReport};
pub use lifecycle::{LifecycleCoordinator, ShutdownOutcome, ShutdownTrigger};
pub use registry::{RegisteredTool, RegistryError, ToolRegistry};
pub use supervisor::{Supervisor, SupervisorError, SupervisorOptions};
