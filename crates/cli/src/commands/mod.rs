pub mod ask;
pub mod doctor;
pub mod peer;
pub mod tools;

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use toolmux_config::AppConfig;
use toolmux_core::event::{DomainEvent, EventBus};
use tokio::task::JoinHandle;

/// Load the config from `path` (or the default location) with environment
/// overrides applied.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(AppConfig::config_path);
    AppConfig::load_with_env(&path).with_context(|| format!("Failed to load config from {}", path.display()))
}

/// Render peer and tool activity on stderr until the bus closes.
pub fn render_events(events: &Arc<EventBus>) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event.as_ref() {
                DomainEvent::PeerReady { peer, tools, .. } => {
                    eprintln!("  ✓ {peer} ready: {}", tools.join(", "));
                }
                DomainEvent::ToolDispatched { tool, peer, success, duration_ms, .. } => {
                    let mark = if *success { "→" } else { "✗" };
                    eprintln!("  {mark} {tool} ({peer}, {duration_ms} ms)");
                }
                _ => {}
            }
        }
    })
}
