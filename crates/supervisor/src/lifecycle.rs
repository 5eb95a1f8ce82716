//! Exactly-once teardown.
//!
//! Normal completion, a fatal error, and a signal all funnel into
//! [`LifecycleCoordinator::request_shutdown`]. The first caller flips the
//! shutdown flag and runs the termination sequence; everyone else waits for
//! that run and gets the same report.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use toolmux_core::event::DomainEvent;
use toolmux_core::shutdown::{wait_for_signal, ShutdownFlag};
use tracing::{info, warn};

use crate::handle::TerminationReport;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Completed,
    Signal(&'static str),
    Error,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Completed => f.write_str("completed"),
            ShutdownTrigger::Signal(name) => write!(f, "signal {name}"),
            ShutdownTrigger::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownOutcome {
    /// Whether this call ran the termination sequence
    pub performed: bool,
    /// The trigger of the call that ran it
    pub trigger: ShutdownTrigger,
    pub report: Arc<TerminationReport>,
}

pub struct LifecycleCoordinator {
    supervisor: Arc<Supervisor>,
    shutdown: ShutdownFlag,
    grace: Duration,
    teardown: OnceCell<(ShutdownTrigger, Arc<TerminationReport>)>,
}

impl LifecycleCoordinator {
    pub fn new(supervisor: Arc<Supervisor>, shutdown: ShutdownFlag, grace: Duration) -> Self {
        Self {
            supervisor,
            shutdown,
            grace,
            teardown: OnceCell::new(),
        }
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    /// Whether teardown has finished.
    pub fn is_terminated(&self) -> bool {
        self.teardown.initialized()
    }

    /// Flip the shutdown flag and terminate every peer, once.
    pub async fn request_shutdown(&self, trigger: ShutdownTrigger) -> ShutdownOutcome {
        if self.shutdown.trigger() {
            info!(trigger = %trigger, "Shutdown requested");
            self.supervisor.events().publish(DomainEvent::ShutdownRequested {
                trigger: trigger.to_string(),
                timestamp: chrono::Utc::now(),
            });
        }

        let ran = AtomicBool::new(false);
        let (ran_ref, supervisor, grace) = (&ran, &self.supervisor, self.grace);
        let (winner, report) = self
            .teardown
            .get_or_init(move || async move {
                ran_ref.store(true, Ordering::SeqCst);
                let report = supervisor.terminate_all(grace).await;
                info!(trigger = %trigger, peers = %report, "Teardown complete");
                (trigger, Arc::new(report))
            })
            .await
            .clone();

        ShutdownOutcome {
            performed: ran.load(Ordering::SeqCst),
            trigger: winner,
            report,
        }
    }

    /// Route SIGINT/SIGTERM into [`request_shutdown`](Self::request_shutdown).
    /// Signals after the first are logged and ignored.
    pub fn spawn_signal_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(signal) => {
                    this.request_shutdown(ShutdownTrigger::Signal(signal)).await;
                }
                Err(e) => {
                    warn!("Cannot install signal handlers: {e}");
                    return;
                }
            }
            while let Ok(signal) = wait_for_signal().await {
                warn!(signal, "Shutdown already in progress, ignoring signal");
            }
        })
    }
}
