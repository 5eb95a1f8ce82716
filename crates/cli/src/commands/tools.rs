//! `toolmux tools`: spawn the peers, print what they advertise, tear down.

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use toolmux_core::event::EventBus;
use toolmux_core::shutdown::ShutdownFlag;
use toolmux_supervisor::{LifecycleCoordinator, ShutdownTrigger, Supervisor, SupervisorOptions};

use super::load_config;

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<u8> {
    let config = load_config(config_path)?;
    let exe = std::env::current_exe().context("Cannot locate the toolmux executable")?;
    let peers = config.resolve_peers(&exe);

    let options = SupervisorOptions::from(&config.supervisor);
    let shutdown = ShutdownFlag::new();
    let supervisor = Arc::new(Supervisor::new(options.clone(), shutdown.clone(), Arc::new(EventBus::default())));
    let coordinator = Arc::new(LifecycleCoordinator::new(Arc::clone(&supervisor), shutdown, options.shutdown_grace));
    let watcher = coordinator.spawn_signal_watcher();

    let spawned = supervisor.spawn(&peers).await;
    let code = match &spawned {
        Ok(registry) => {
            println!("{} tools from {} peers", registry.len(), registry.peers().len());
            println!();
            for schema in registry.schemas() {
                println!("  {:<14} {:<10} {}", schema.name, schema.peer, schema.description);
            }
            0
        }
        Err(e) => {
            println!("Error: {e}");
            1
        }
    };

    let trigger = if code == 0 { ShutdownTrigger::Completed } else { ShutdownTrigger::Error };
    coordinator.request_shutdown(trigger).await;
    watcher.abort();
    Ok(code)
}
