//! One end-to-end session: spawn peers, answer one query, tear down.
//!
//! Whatever happens in between, [`run_session`] produces exactly one
//! terminal message and runs teardown exactly once before returning.

use std::fmt;
use std::sync::Arc;
use toolmux_config::{AgentConfig, PeerConfig};
use toolmux_core::event::EventBus;
use toolmux_core::provider::Provider;
use toolmux_core::shutdown::ShutdownFlag;
use toolmux_supervisor::{
    Dispatcher, LifecycleCoordinator, ShutdownOutcome, ShutdownTrigger, Supervisor, SupervisorError,
    SupervisorOptions,
};
use tracing::{error, info};

use crate::loop_runner::{AgentLoop, LoopError, LoopOutcome};

/// The terminal message for a session stopped by the user.
pub const CANCELLED_MESSAGE: &str = "Operation cancelled by user.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    /// Process exit status for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            SessionStatus::Completed => 0,
            SessionStatus::Cancelled => 130,
            SessionStatus::Failed => 1,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Completed => f.write_str("completed"),
            SessionStatus::Cancelled => f.write_str("cancelled"),
            SessionStatus::Failed => f.write_str("failed"),
        }
    }
}

pub struct SessionParams {
    pub query: String,
    pub peers: Vec<PeerConfig>,
    pub provider: Arc<dyn Provider>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub agent: AgentConfig,
    pub supervisor: SupervisorOptions,
    pub shutdown: ShutdownFlag,
    pub events: Arc<EventBus>,
    /// Route SIGINT/SIGTERM into teardown for the lifetime of the session
    pub watch_signals: bool,
}

impl SessionParams {
    pub fn new(
        query: impl Into<String>,
        peers: Vec<PeerConfig>,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            peers,
            provider,
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
            agent: AgentConfig::default(),
            supervisor: SupervisorOptions::default(),
            shutdown: ShutdownFlag::new(),
            events: Arc::new(EventBus::default()),
            watch_signals: false,
        }
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub status: SessionStatus,
    /// The one message shown to the user
    pub message: String,
    /// Present when the loop produced an answer
    pub outcome: Option<LoopOutcome>,
    pub teardown: ShutdownOutcome,
}

impl SessionReport {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

enum Ending {
    Answered(LoopOutcome),
    Cancelled,
    Failed(String),
}

/// Run one query through a fresh set of peers.
pub async fn run_session(params: SessionParams) -> SessionReport {
    let supervisor = Arc::new(Supervisor::new(
        params.supervisor.clone(),
        params.shutdown.clone(),
        Arc::clone(&params.events),
    ));
    let coordinator = Arc::new(LifecycleCoordinator::new(
        Arc::clone(&supervisor),
        params.shutdown.clone(),
        params.supervisor.shutdown_grace,
    ));
    let watcher = params.watch_signals.then(|| coordinator.spawn_signal_watcher());

    let ending = drive(&params, &supervisor).await;

    let (status, message, outcome, trigger) = match ending {
        Ending::Answered(outcome) => (
            SessionStatus::Completed,
            outcome.answer.clone(),
            Some(outcome),
            ShutdownTrigger::Completed,
        ),
        // Whoever cancelled already flipped the flag; this call only joins
        // (or runs) the teardown.
        Ending::Cancelled => (SessionStatus::Cancelled, CANCELLED_MESSAGE.to_string(), None, ShutdownTrigger::Completed),
        Ending::Failed(message) => (SessionStatus::Failed, message, None, ShutdownTrigger::Error),
    };

    let teardown = coordinator.request_shutdown(trigger).await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    info!(status = %status, peers = %teardown.report, "Session ended");

    SessionReport {
        status,
        message,
        outcome,
        teardown,
    }
}

async fn drive(params: &SessionParams, supervisor: &Supervisor) -> Ending {
    let spawned = tokio::select! {
        biased;
        _ = params.shutdown.wait() => return Ending::Cancelled,
        spawned = supervisor.spawn(&params.peers) => spawned,
    };
    let registry = match spawned {
        Ok(registry) => registry,
        Err(SupervisorError::ShuttingDown { .. }) => return Ending::Cancelled,
        Err(e) => {
            error!(rolled_back = %e.rolled_back(), "Startup failed: {e}");
            return Ending::Failed(format!("Error: {e}"));
        }
    };
    info!(tools = ?registry.names(), "Tools discovered");

    let dispatcher = Dispatcher::new(registry, params.shutdown.clone(), Arc::clone(&params.events))
        .with_call_timeout(params.supervisor.call_timeout);
    let mut agent = AgentLoop::new(
        Arc::clone(&params.provider),
        params.model.clone(),
        Arc::new(dispatcher),
        params.shutdown.clone(),
        Arc::clone(&params.events),
    )
    .with_temperature(params.temperature)
    .with_max_iterations(params.agent.max_iterations)
    .with_time_budget(params.agent.time_budget())
    .with_system_prompt(params.agent.system_prompt.clone());
    if let Some(max) = params.max_tokens {
        agent = agent.with_max_tokens(max);
    }

    match agent.run(&params.query).await {
        Ok(outcome) => Ending::Answered(outcome),
        Err(LoopError::Cancelled) => Ending::Cancelled,
        Err(e) => Ending::Failed(format!("Error: {e}")),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use std::time::Duration;

    /// A peer that serves `calculate` through a shell: it answers the
    /// handshake, then replies 9 to every call.
    const NINE_PEER: &str = r#"
read line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{"peer_name":"math","protocol_version":"toolmux/1","tools":[{"name":"calculate","description":"calc","input_schema":{"type":"object"}}]}}\n' "$id"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"jsonrpc":"2.0","id":%s,"result":{"content":"3 * 3 = 9","data":{"result":9.0}}}\n' "$id"
done
"#;

    /// A peer that answers the handshake and then exits.
    const VANISHING_PEER: &str = r#"
read line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{"peer_name":"math","protocol_version":"toolmux/1","tools":[{"name":"calculate","description":"calc","input_schema":{"type":"object"}}]}}\n' "$id"
"#;

    fn nine_peer() -> PeerConfig {
        PeerConfig::new("math", "sh").with_args(["-c", NINE_PEER])
    }

    fn params(provider: ScriptedProvider, peers: Vec<PeerConfig>) -> SessionParams {
        let mut params = SessionParams::new("What is 3*3?", peers, Arc::new(provider), "mock-model");
        params.supervisor.discovery_timeout = Duration::from_secs(5);
        params.supervisor.shutdown_grace = Duration::from_millis(200);
        params
    }

    #[tokio::test]
    async fn answered_session_completes_and_tears_down() {
        let provider = ScriptedProvider::answers(vec![
            tool_call_response(vec![tool_call("call_1", "calculate", serde_json::json!({"expression": "3*3"}))]),
            text_response("The answer is 9."),
        ]);
        let report = run_session(params(provider, vec![nine_peer()])).await;

        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.exit_code(), 0);
        assert!(report.message.contains('9'));
        assert_eq!(report.outcome.as_ref().unwrap().tool_calls, 1);
        assert!(report.teardown.performed);
        assert_eq!(report.teardown.report.peers.len(), 1);
    }

    #[tokio::test]
    async fn startup_failure_is_one_error_message() {
        let provider = ScriptedProvider::answers(vec![text_response("unused")]);
        let broken = PeerConfig::new("ghost", "/nonexistent/toolmux-peer");
        let report = run_session(params(provider, vec![nine_peer(), broken])).await;

        assert_eq!(report.status, SessionStatus::Failed);
        assert_eq!(report.exit_code(), 1);
        assert!(report.message.starts_with("Error:"));
        assert!(report.message.contains("ghost"));
        assert!(report.outcome.is_none());
    }

    #[tokio::test]
    async fn exhausted_budget_fails_the_session() {
        let provider = ScriptedProvider::answers(vec![tool_call_response(vec![tool_call(
            "call_1",
            "calculate",
            serde_json::json!({"expression": "3*3"}),
        )])]);
        let mut params = params(provider, vec![nine_peer()]);
        params.agent.max_iterations = 2;
        let report = run_session(params).await;

        assert_eq!(report.status, SessionStatus::Failed);
        assert!(report.message.contains("2 iterations"), "{}", report.message);
    }

    #[tokio::test]
    async fn losing_every_peer_fails_without_spending_the_budget() {
        let provider = Arc::new(ScriptedProvider::answers(vec![tool_call_response(vec![tool_call(
            "call_1",
            "calculate",
            serde_json::json!({"expression": "3*3"}),
        )])]));
        let peer = PeerConfig::new("math", "sh").with_args(["-c", VANISHING_PEER]);
        let mut params = SessionParams::new("What is 3*3?", vec![peer], Arc::clone(&provider) as Arc<dyn Provider>, "mock-model");
        params.supervisor.discovery_timeout = Duration::from_secs(5);
        params.supervisor.shutdown_grace = Duration::from_millis(200);
        params.agent.max_iterations = 6;

        let report = run_session(params).await;

        assert_eq!(report.status, SessionStatus::Failed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.message, "Error: Every tool peer is unavailable");
        assert!(provider.calls() <= 1, "provider called {} times", provider.calls());
        assert!(report.teardown.performed);
    }

    #[tokio::test]
    async fn cancellation_mid_loop_exits_130() {
        let provider = ScriptedProvider::answers(vec![text_response("too late")]).with_delay(Duration::from_secs(30));
        let params = params(provider, vec![nine_peer()]);
        let shutdown = params.shutdown.clone();
        let mut events = params.events.subscribe();

        let session = tokio::spawn(run_session(params));
        // Cancel once the loop is thinking.
        loop {
            let event = events.recv().await.unwrap();
            if matches!(event.as_ref(), toolmux_core::event::DomainEvent::LoopIteration { .. }) {
                break;
            }
        }
        shutdown.trigger();

        let report = tokio::time::timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert_eq!(report.status, SessionStatus::Cancelled);
        assert_eq!(report.exit_code(), 130);
        assert_eq!(report.message, CANCELLED_MESSAGE);
        assert!(report.teardown.performed);
    }

    #[tokio::test]
    async fn already_cancelled_session_spawns_nothing() {
        let provider = ScriptedProvider::answers(vec![text_response("unused")]);
        let params = params(provider, vec![nine_peer()]);
        params.shutdown.trigger();

        let report = run_session(params).await;
        assert_eq!(report.status, SessionStatus::Cancelled);
        assert!(report.teardown.report.is_empty());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(SessionStatus::Completed.exit_code(), 0);
        assert_eq!(SessionStatus::Cancelled.exit_code(), 130);
        assert_eq!(SessionStatus::Failed.exit_code(), 1);
    }
}
