//! `toolmux ask`: answer one query.

use anyhow::Context;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use toolmux_agent::{run_session, SessionParams, CANCELLED_MESSAGE};
use toolmux_core::event::EventBus;
use toolmux_core::shutdown::wait_for_signal;
use toolmux_providers::router::{build_from_config, default_model};
use toolmux_supervisor::SupervisorOptions;
use tracing::{info, warn};

use super::{load_config, render_events};

pub async fn run(config_path: Option<&Path>, query: Option<String>) -> anyhow::Result<u8> {
    let config = load_config(config_path)?;

    if !config.has_api_key() && config.default_provider != "ollama" {
        println!("Error: no API key configured. Set OPENAI_API_KEY (or TOOLMUX_API_KEY) or add api_key to the config file.");
        return Ok(1);
    }

    let query = match query {
        Some(query) => query,
        None => match prompt().await? {
            Some(query) => query,
            None => {
                eprintln!("\nQuery input interrupted. Shutting down...");
                println!("{CANCELLED_MESSAGE}");
                return Ok(130);
            }
        },
    };
    let query = query.trim().to_string();
    if query.is_empty() {
        println!("Error: the query is empty");
        return Ok(1);
    }

    let router = build_from_config(&config);
    let provider = router.require_default()?;
    let exe = std::env::current_exe().context("Cannot locate the toolmux executable")?;
    let peers = config.resolve_peers(&exe);
    info!(
        provider = provider.name(),
        peers = ?peers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        "Starting session"
    );

    let events = Arc::new(EventBus::default());
    let renderer = render_events(&events);

    let mut params = SessionParams::new(query, peers, provider, default_model(&config));
    params.temperature = config.default_temperature;
    params.max_tokens = Some(config.default_max_tokens);
    params.agent = config.agent.clone();
    params.supervisor = SupervisorOptions::from(&config.supervisor);
    params.events = events;
    params.watch_signals = true;

    eprintln!("Processing your query. This may take a moment...");
    let report = run_session(params).await;
    renderer.abort();

    println!("{}", report.message);
    Ok(report.exit_code() as u8)
}

/// Ask for the query on stdin. `None` when input ends or a signal arrives
/// before a line is read.
async fn prompt() -> anyhow::Result<Option<String>> {
    print!("Query: ");
    std::io::stdout().flush()?;

    let interrupted = async {
        match wait_for_signal().await {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Cannot install signal handlers: {e}");
                std::future::pending().await
            }
        }
    };

    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let read = tokio::select! {
        read = stdin.read_line(&mut line) => read?,
        signal = interrupted => {
            warn!(signal, "Interrupted while waiting for a query");
            return Ok(None);
        }
    };
    Ok((read > 0).then_some(line))
}
