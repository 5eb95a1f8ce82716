//! The peer runtime.
//!
//! Every tool-provider process is the same program shape: register some
//! tools, answer the handshake, run calls, refuse new work once shutdown is
//! requested, exit when the orchestrator closes the channel. [`PeerServer`]
//! is that shape, parameterized only by the [`ToolSet`](toolmux_core::ToolSet)
//! it hosts.

pub mod server;

pub use server::{PeerServer, ServeSummary};
