//! `toolmux peer`: serve one builtin peer on stdio.
//!
//! This is the launch command the orchestrator uses for its builtin peers.
//! Settings arrive through the environment the supervisor passes down.

use clap::ValueEnum;
use std::time::Duration;
use toolmux_config::{SEARCH_API_KEY_ENV, SEARCH_TIMEOUT_ENV, SEARCH_URL_ENV};
use toolmux_core::tool::ToolSet;
use toolmux_peer::PeerServer;
use toolmux_tools::search::DEFAULT_SEARCH_URL;
use toolmux_tools::weather::DEFAULT_DELAY;
use toolmux_tools::SearchClient;
use tracing::{info, warn};

/// Simulated weather lookup latency, in milliseconds.
pub const WEATHER_DELAY_ENV: &str = "TOOLMUX_WEATHER_DELAY_MS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PeerKind {
    Math,
    Weather,
    Search,
}

impl PeerKind {
    pub fn name(self) -> &'static str {
        match self {
            PeerKind::Math => "math",
            PeerKind::Weather => "weather",
            PeerKind::Search => "search",
        }
    }

    fn tools(self, env: impl Fn(&str) -> Option<String>) -> ToolSet {
        match self {
            PeerKind::Math => toolmux_tools::math_tools(),
            PeerKind::Weather => {
                let delay = env(WEATHER_DELAY_ENV)
                    .and_then(|ms| ms.trim().parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_DELAY);
                toolmux_tools::weather_tools(delay)
            }
            PeerKind::Search => toolmux_tools::search_tools(search_client(env)),
        }
    }
}

fn search_client(env: impl Fn(&str) -> Option<String>) -> SearchClient {
    let url = env(SEARCH_URL_ENV).unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string());
    let key = env(SEARCH_API_KEY_ENV).filter(|k| !k.trim().is_empty());
    if key.is_none() {
        warn!("{SEARCH_API_KEY_ENV} is not set; search calls will fail");
    }
    let client = SearchClient::new(url, key);
    match env(SEARCH_TIMEOUT_ENV).and_then(|secs| secs.trim().parse::<u64>().ok()) {
        Some(secs) if secs > 0 => client.with_timeout(Duration::from_secs(secs)),
        _ => client,
    }
}

pub async fn run(kind: PeerKind) -> anyhow::Result<u8> {
    let tools = kind.tools(|key| std::env::var(key).ok());
    let server = PeerServer::new(kind.name(), tools);
    let summary = server.serve_stdio().await?;
    info!(
        peer = kind.name(),
        calls = summary.calls,
        refused = summary.refused,
        abandoned = summary.abandoned,
        "Peer stopped"
    );
    Ok(0)
}
