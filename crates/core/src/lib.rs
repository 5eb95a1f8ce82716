//! # toolmux core
//!
//! Domain types, traits, and error definitions shared by every toolmux crate.
//! This crate defines the domain model (messages, tools, the reasoning
//! provider, the peer wire protocol) that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every seam is a trait here. Implementations live in their respective
//! crates, so the reasoning loop can run against a scripted provider and a
//! fake tool invoker in tests, and against real peer processes in production.

pub mod error;
pub mod event;
pub mod message;
pub mod protocol;
pub mod provider;
pub mod shutdown;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{DispatchError, Error, ProtocolError, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{NextAction, Provider, ProviderRequest, ProviderResponse, ToolDefinition};
pub use shutdown::ShutdownFlag;
pub use tool::{Tool, ToolCall, ToolInvoker, ToolResult, ToolSchema, ToolSet};
