//! A running peer and its teardown ladder.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Child;
use toolmux_core::protocol::{methods, InitializeResult, PROTOCOL_VERSION};
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, PeerChannel};

/// Lifecycle of one peer as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Starting,
    Ready,
    Busy,
    Terminating,
    Terminated,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Starting => "starting",
            PeerState::Ready => "ready",
            PeerState::Busy => "busy",
            PeerState::Terminating => "terminating",
            PeerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// How a peer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Exited on its own after its input closed
    Exited(i32),
    /// Ended by a signal (usually our SIGTERM)
    Signalled(i32),
    /// Did not respond to EOF or SIGTERM and was killed
    Killed,
    /// Was already gone, or was torn down by an earlier call
    AlreadyTerminated,
    Failed(String),
}

impl fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationOutcome::Exited(code) => write!(f, "exited with code {code}"),
            TerminationOutcome::Signalled(sig) => write!(f, "terminated by signal {sig}"),
            TerminationOutcome::Killed => f.write_str("killed"),
            TerminationOutcome::AlreadyTerminated => f.write_str("already terminated"),
            TerminationOutcome::Failed(reason) => write!(f, "termination failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTermination {
    pub peer: String,
    pub outcome: TerminationOutcome,
}

/// Per-peer outcomes of one teardown pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    pub peers: Vec<PeerTermination>,
}

impl TerminationReport {
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn outcome(&self, peer: &str) -> Option<&TerminationOutcome> {
        self.peers.iter().find(|p| p.peer == peer).map(|p| &p.outcome)
    }
}

impl fmt::Display for TerminationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.peers.is_empty() {
            return f.write_str("no peers");
        }
        let parts: Vec<String> = self.peers.iter().map(|p| format!("{}: {}", p.peer, p.outcome)).collect();
        f.write_str(&parts.join(", "))
    }
}

/// One peer: its name, its channel, and (for real processes) its child.
pub struct PeerHandle {
    name: String,
    pid: Option<u32>,
    channel: PeerChannel,
    child: tokio::sync::Mutex<Option<Child>>,
    state: Mutex<PeerState>,
    tools: Mutex<Vec<String>>,
    terminated: AtomicBool,
}

impl PeerHandle {
    /// A peer running as a child process.
    pub fn process(name: impl Into<String>, child: Child, channel: PeerChannel) -> Self {
        let pid = child.id();
        Self::build(name.into(), pid, channel, Some(child))
    }

    /// A peer served in-process over an arbitrary stream pair. Closing its
    /// channel counts as a clean exit.
    pub fn in_process(name: impl Into<String>, channel: PeerChannel) -> Self {
        Self::build(name.into(), None, channel, None)
    }

    fn build(name: String, pid: Option<u32>, channel: PeerChannel, child: Option<Child>) -> Self {
        Self {
            name,
            pid,
            channel,
            child: tokio::sync::Mutex::new(child),
            state: Mutex::new(PeerState::Starting),
            tools: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn channel(&self) -> &PeerChannel {
        &self.channel
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names of the tools this peer advertised during the handshake.
    pub fn tools(&self) -> Vec<String> {
        self.tools.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ready → Busy. Teardown states are never overwritten.
    pub fn mark_busy(&self) {
        self.transition(PeerState::Ready, PeerState::Busy);
    }

    /// Busy → Ready.
    pub fn mark_ready(&self) {
        self.transition(PeerState::Busy, PeerState::Ready);
    }

    fn transition(&self, from: PeerState, to: PeerState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
        }
    }

    fn set_state(&self, to: PeerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    /// Run the `initialize` handshake and move to `Ready`.
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult, String> {
        let params = serde_json::json!({
            "client": "toolmux",
            "protocol_version": PROTOCOL_VERSION,
        });
        let value = self
            .channel
            .request(methods::INITIALIZE, params, timeout)
            .await
            .map_err(|e| match e {
                ChannelError::Timeout(_) => format!("no handshake within {}s", timeout.as_secs_f32()),
                ChannelError::Closed => "peer closed the channel during the handshake".to_string(),
                other => other.to_string(),
            })?;

        let init: InitializeResult =
            serde_json::from_value(value).map_err(|e| format!("malformed handshake: {e}"))?;
        if init.protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "unsupported protocol version '{}', expected '{PROTOCOL_VERSION}'",
                init.protocol_version
            ));
        }

        *self.tools.lock().unwrap_or_else(|e| e.into_inner()) =
            init.tools.iter().map(|t| t.name.clone()).collect();
        self.transition(PeerState::Starting, PeerState::Ready);
        Ok(init)
    }

    /// Tear the peer down: EOF, then SIGTERM, then SIGKILL, waiting `grace`
    /// between steps. Only the first call does anything.
    pub async fn terminate(&self, grace: Duration) -> TerminationOutcome {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return TerminationOutcome::AlreadyTerminated;
        }
        self.set_state(PeerState::Terminating);

        let mut child = self.child.lock().await;
        let outcome = match child.as_mut() {
            None => {
                self.channel.close().await;
                TerminationOutcome::Exited(0)
            }
            Some(child) => self.stop_child(child, grace).await,
        };

        self.set_state(PeerState::Terminated);
        info!(peer = %self.name, outcome = %outcome, "Peer terminated");
        outcome
    }

    async fn stop_child(&self, child: &mut Child, grace: Duration) -> TerminationOutcome {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(peer = %self.name, %status, "Peer had already exited");
                self.channel.close().await;
                return TerminationOutcome::AlreadyTerminated;
            }
            Ok(None) => {}
            Err(e) => return TerminationOutcome::Failed(e.to_string()),
        }

        self.channel.close().await;
        if let Some(outcome) = wait_for_exit(child, grace).await {
            return outcome;
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            debug!(peer = %self.name, pid, "Peer ignored EOF, sending SIGTERM");
            // SAFETY: plain syscall on a pid we spawned and have not reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if let Some(outcome) = wait_for_exit(child, grace).await {
                return outcome;
            }
        }

        warn!(peer = %self.name, "Peer did not stop, killing");
        match child.kill().await {
            Ok(()) => TerminationOutcome::Killed,
            Err(e) => TerminationOutcome::Failed(e.to_string()),
        }
    }
}

async fn wait_for_exit(child: &mut Child, grace: Duration) -> Option<TerminationOutcome> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(outcome_of(status)),
        Ok(Err(e)) => Some(TerminationOutcome::Failed(e.to_string())),
        Err(_) => None,
    }
}

fn outcome_of(status: std::process::ExitStatus) -> TerminationOutcome {
    if let Some(code) = status.code() {
        return TerminationOutcome::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return TerminationOutcome::Signalled(sig);
        }
    }
    TerminationOutcome::Failed(format!("unrecognized exit status: {status}"))
}
