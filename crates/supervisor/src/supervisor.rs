//! Spawning and tracking the peer set.
//!
//! A spawn attempt is all-or-nothing: if any peer fails to launch, fails
//! its handshake, or collides with another peer's tool names, every peer
//! started by that attempt is torn down before the error is returned.

use futures::future::join_all;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use toolmux_config::{validate_peers, PeerConfig, SupervisorConfig};
use toolmux_core::event::{DomainEvent, EventBus};
use toolmux_core::shutdown::ShutdownFlag;
use tracing::{debug, info, warn};

use crate::channel::PeerChannel;
use crate::handle::{PeerHandle, PeerState, PeerTermination, TerminationReport};
use crate::registry::ToolRegistry;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub discovery_timeout: Duration,
    pub call_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl From<&SupervisorConfig> for SupervisorOptions {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            discovery_timeout: config.discovery_timeout(),
            call_timeout: config.call_timeout(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// A failed spawn attempt. Every variant carries the teardown report of
/// the peers that attempt had already started.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Invalid peer configuration: {reason}")]
    Config {
        reason: String,
        rolled_back: TerminationReport,
    },

    #[error("Failed to start peer '{peer}': {reason}")]
    Spawn {
        peer: String,
        reason: String,
        rolled_back: TerminationReport,
    },

    #[error("Discovery failed for peer '{peer}': {reason}")]
    Discovery {
        peer: String,
        reason: String,
        rolled_back: TerminationReport,
    },

    #[error("Shutdown in progress, not starting peers")]
    ShuttingDown { rolled_back: TerminationReport },
}

impl SupervisorError {
    pub fn rolled_back(&self) -> &TerminationReport {
        match self {
            SupervisorError::Config { rolled_back, .. }
            | SupervisorError::Spawn { rolled_back, .. }
            | SupervisorError::Discovery { rolled_back, .. }
            | SupervisorError::ShuttingDown { rolled_back } => rolled_back,
        }
    }
}

enum StartFailure {
    Config(String),
    Spawn { peer: String, reason: String },
    Discovery { peer: String, reason: String },
    ShuttingDown,
}

impl StartFailure {
    fn into_error(self, rolled_back: TerminationReport) -> SupervisorError {
        match self {
            StartFailure::Config(reason) => SupervisorError::Config { reason, rolled_back },
            StartFailure::Spawn { peer, reason } => SupervisorError::Spawn { peer, reason, rolled_back },
            StartFailure::Discovery { peer, reason } => SupervisorError::Discovery { peer, reason, rolled_back },
            StartFailure::ShuttingDown => SupervisorError::ShuttingDown { rolled_back },
        }
    }
}

/// Owns the set of running peers for one orchestrator process.
pub struct Supervisor {
    options: SupervisorOptions,
    shutdown: ShutdownFlag,
    events: Arc<EventBus>,
    tracked: tokio::sync::Mutex<Vec<Arc<PeerHandle>>>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions, shutdown: ShutdownFlag, events: Arc<EventBus>) -> Self {
        Self {
            options,
            shutdown,
            events,
            tracked: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Start every peer in `configs` and aggregate their tools.
    pub async fn spawn(&self, configs: &[PeerConfig]) -> Result<ToolRegistry, SupervisorError> {
        validate_peers(configs).map_err(|e| SupervisorError::Config {
            reason: e.to_string(),
            rolled_back: TerminationReport::default(),
        })?;
        if self.shutdown.is_set() {
            return Err(SupervisorError::ShuttingDown { rolled_back: TerminationReport::default() });
        }

        let mut started = Vec::new();
        let mut registry = ToolRegistry::new();
        for config in configs {
            if let Err(failure) = self.start_peer(config, &mut started, &mut registry).await {
                let rolled_back = self.roll_back(&started).await;
                let err = failure.into_error(rolled_back);
                warn!("Peer startup failed, rolled back {} peer(s): {err}", started.len());
                return Err(err);
            }
        }

        info!(peers = started.len(), tools = registry.len(), "Peer set ready");
        Ok(registry)
    }

    async fn start_peer(
        &self,
        config: &PeerConfig,
        started: &mut Vec<Arc<PeerHandle>>,
        registry: &mut ToolRegistry,
    ) -> Result<(), StartFailure> {
        let handle = Arc::new(launch(config)?);
        started.push(Arc::clone(&handle));
        {
            // Checked under the lock so a concurrent terminate_all either
            // sees this peer or we see its flag.
            let mut tracked = self.tracked.lock().await;
            if self.shutdown.is_set() {
                return Err(StartFailure::ShuttingDown);
            }
            tracked.push(Arc::clone(&handle));
        }
        debug!(peer = %config.name, pid = ?handle.pid(), "Peer spawned");
        self.events.publish(DomainEvent::PeerSpawned {
            peer: config.name.clone(),
            pid: handle.pid(),
            timestamp: chrono::Utc::now(),
        });

        let init = handle
            .initialize(self.options.discovery_timeout)
            .await
            .map_err(|reason| StartFailure::Discovery { peer: config.name.clone(), reason })?;
        if init.peer_name != config.name {
            debug!(peer = %config.name, advertised = %init.peer_name, "Peer advertises a different name");
        }

        registry
            .register_peer(Arc::clone(&handle), init.tools)
            .map_err(|e| StartFailure::Config(e.to_string()))?;

        let tools = handle.tools();
        info!(peer = %config.name, tools = ?tools, "Peer ready");
        self.events.publish(DomainEvent::PeerReady {
            peer: config.name.clone(),
            tools,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn roll_back(&self, started: &[Arc<PeerHandle>]) -> TerminationReport {
        let report = self.terminate(started, self.options.shutdown_grace).await;
        self.tracked
            .lock()
            .await
            .retain(|tracked| !started.iter().any(|s| Arc::ptr_eq(s, tracked)));
        report
    }

    /// Terminate every tracked peer concurrently.
    pub async fn terminate_all(&self, grace: Duration) -> TerminationReport {
        let peers: Vec<_> = self.tracked.lock().await.clone();
        info!(peers = peers.len(), "Terminating peers");
        self.terminate(&peers, grace).await
    }

    async fn terminate(&self, peers: &[Arc<PeerHandle>], grace: Duration) -> TerminationReport {
        let outcomes = join_all(peers.iter().map(|peer| async move {
            PeerTermination {
                peer: peer.name().to_string(),
                outcome: peer.terminate(grace).await,
            }
        }))
        .await;

        for termination in &outcomes {
            self.events.publish(DomainEvent::PeerTerminated {
                peer: termination.peer.clone(),
                outcome: termination.outcome.to_string(),
                timestamp: chrono::Utc::now(),
            });
        }
        TerminationReport { peers: outcomes }
    }

    pub async fn peer_states(&self) -> Vec<(String, PeerState)> {
        self.tracked
            .lock()
            .await
            .iter()
            .map(|p| (p.name().to_string(), p.state()))
            .collect()
    }
}

/// Launch one peer process with a minimal, explicit environment.
fn launch(config: &PeerConfig) -> Result<PeerHandle, StartFailure> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args).env_clear();
    for key in &config.inherit_env {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }
    cmd.envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Linux: have the kernel SIGTERM the peer if we die without cleaning up.
    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| StartFailure::Spawn {
        peer: config.name.clone(),
        reason: format!("{}: {e}", config.command),
    })?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(StartFailure::Spawn {
            peer: config.name.clone(),
            reason: "stdio was not captured".into(),
        });
    };
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(config.name.clone(), stderr));
    }

    let channel = PeerChannel::new(config.name.clone(), stdout, stdin);
    Ok(PeerHandle::process(config.name.clone(), child, channel))
}

/// Re-log a peer's stderr under its name.
async fn forward_stderr(peer: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => info!(peer = %peer, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer, "stderr closed: {e}");
                break;
            }
        }
    }
}
