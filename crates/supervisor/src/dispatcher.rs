//! Routes tool calls to the peer that owns them.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use toolmux_core::error::DispatchError;
use toolmux_core::event::{DomainEvent, EventBus};
use toolmux_core::protocol::{methods, CallToolResult};
use toolmux_core::provider::ToolDefinition;
use toolmux_core::shutdown::ShutdownFlag;
use toolmux_core::tool::ToolInvoker;
use tracing::{debug, warn};

use crate::channel::ChannelError;
use crate::registry::ToolRegistry;

pub struct Dispatcher {
    registry: ToolRegistry,
    shutdown: ShutdownFlag,
    events: Arc<EventBus>,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, shutdown: ShutdownFlag, events: Arc<EventBus>) -> Self {
        Self {
            registry,
            shutdown,
            events,
            call_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// True when peers were registered and every one of their channels is closed.
    pub fn all_peers_unavailable(&self) -> bool {
        let peers = self.registry.peers();
        !peers.is_empty() && peers.iter().all(|peer| peer.channel().is_closed())
    }
}

#[async_trait]
impl ToolInvoker for Dispatcher {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    async fn invoke(&self, tool_name: &str, arguments: serde_json::Value) -> Result<CallToolResult, DispatchError> {
        if self.shutdown.is_set() {
            return Err(DispatchError::ShuttingDown(tool_name.to_string()));
        }
        let entry = self
            .registry
            .resolve(tool_name)
            .ok_or_else(|| DispatchError::UnknownTool(tool_name.to_string()))?;
        let peer = &entry.peer;
        if peer.channel().is_closed() {
            return Err(DispatchError::PeerUnavailable {
                peer: peer.name().to_string(),
                reason: "channel closed".into(),
            });
        }

        debug!(tool = tool_name, peer = peer.name(), "Dispatching tool call");
        let start = Instant::now();
        peer.mark_busy();
        let response = peer
            .channel()
            .request(
                methods::CALL_TOOL,
                serde_json::json!({ "name": tool_name, "arguments": arguments }),
                self.call_timeout,
            )
            .await;
        peer.mark_ready();
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match response {
            Ok(value) => serde_json::from_value::<CallToolResult>(value).map_err(|e| DispatchError::ToolExecution {
                tool: tool_name.to_string(),
                message: format!("malformed result: {e}"),
            }),
            Err(ChannelError::Remote(e)) => Err(DispatchError::ToolExecution {
                tool: tool_name.to_string(),
                message: e.message,
            }),
            Err(ChannelError::Timeout(_)) => Err(DispatchError::TransportTimeout {
                tool: tool_name.to_string(),
                peer: peer.name().to_string(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
            Err(ChannelError::Closed) => Err(DispatchError::PeerUnavailable {
                peer: peer.name().to_string(),
                reason: "channel closed".into(),
            }),
            Err(ChannelError::Protocol(reason)) => Err(DispatchError::PeerUnavailable {
                peer: peer.name().to_string(),
                reason,
            }),
        };

        match &result {
            Ok(_) => debug!(tool = tool_name, peer = peer.name(), duration_ms, "Tool call succeeded"),
            Err(e) => warn!(tool = tool_name, peer = peer.name(), duration_ms, "Tool call failed: {e}"),
        }
        self.events.publish(DomainEvent::ToolDispatched {
            tool: tool_name.to_string(),
            peer: peer.name().to_string(),
            success: result.is_ok(),
            duration_ms,
            timestamp: chrono::Utc::now(),
        });
        result
    }

    fn is_exhausted(&self) -> bool {
        self.all_peers_unavailable()
    }
}
