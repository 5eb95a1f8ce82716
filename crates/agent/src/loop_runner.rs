//! The reasoning loop implementation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use toolmux_config::DEFAULT_SYSTEM_PROMPT;
use toolmux_core::error::ProviderError;
use toolmux_core::event::{DomainEvent, EventBus};
use toolmux_core::message::{Message, MessageToolCall};
use toolmux_core::provider::{NextAction, Provider, ProviderRequest, ToolDefinition};
use toolmux_core::shutdown::ShutdownFlag;
use toolmux_core::tool::ToolInvoker;
use tracing::{debug, info, warn};

/// Where the loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPhase {
    #[default]
    Init,
    Thinking,
    Acting,
    Done,
    Failed,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopPhase::Init => "init",
            LoopPhase::Thinking => "thinking",
            LoopPhase::Acting => "acting",
            LoopPhase::Done => "done",
            LoopPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The history and progress of one loop run.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub messages: Vec<Message>,
    /// Completed or in-progress Thinking rounds
    pub iteration: u32,
    pub phase: LoopPhase,
    /// Tool calls dispatched so far
    pub tool_calls: u32,
}

impl LoopState {
    /// A fresh history: the system instruction, then the query.
    pub fn seeded(system_prompt: &str, query: &str) -> Self {
        Self {
            messages: vec![Message::system(system_prompt), Message::user(query)],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub answer: String,
    pub state: LoopState,
    pub iterations: u32,
    pub tool_calls: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LoopError {
    #[error("No final answer after {max_iterations} iterations")]
    BudgetExceeded { max_iterations: u32 },

    #[error("No final answer within {}s", .budget.as_secs())]
    TimeBudgetExceeded { budget: Duration },

    #[error("Every tool peer is unavailable")]
    AllPeersLost,

    #[error("Reasoning provider failed: {0}")]
    Reasoning(#[from] ProviderError),

    #[error("Cancelled")]
    Cancelled,
}

/// Drives the Think → Act → Observe cycle for one query.
pub struct AgentLoop {
    /// The reasoning provider
    provider: Arc<dyn Provider>,

    /// The model to ask for
    model: String,

    temperature: f32,

    max_tokens: Option<u32>,

    /// Where tool calls go
    invoker: Arc<dyn ToolInvoker>,

    /// Seen at every suspension point
    shutdown: ShutdownFlag,

    event_bus: Arc<EventBus>,

    /// Maximum Thinking rounds per query
    max_iterations: u32,

    /// Wall-clock budget for the whole run
    time_budget: Option<Duration>,

    system_prompt: String,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        invoker: Arc<dyn ToolInvoker>,
        shutdown: ShutdownFlag,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
            invoker,
            shutdown,
            event_bus,
            max_iterations: 10,
            time_budget: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set the maximum number of Thinking rounds.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Answer `query`, calling tools as the provider asks for them.
    pub async fn run(&self, query: &str) -> Result<LoopOutcome, LoopError> {
        let mut state = LoopState::seeded(&self.system_prompt, query);
        let answer = self.run_in(&mut state).await?;
        Ok(LoopOutcome {
            answer,
            iterations: state.iteration,
            tool_calls: state.tool_calls,
            state,
        })
    }

    /// Run the loop over an already seeded history.
    ///
    /// `state.phase` ends as `Done` or `Failed`, so callers can inspect how
    /// far a failed run got.
    pub async fn run_in(&self, state: &mut LoopState) -> Result<String, LoopError> {
        let result = self.drive(state).await;
        match &result {
            Ok(_) => {
                state.phase = LoopPhase::Done;
                info!(iterations = state.iteration, tool_calls = state.tool_calls, "Loop finished");
            }
            Err(e) => {
                state.phase = LoopPhase::Failed;
                warn!(iterations = state.iteration, tool_calls = state.tool_calls, "Loop failed: {e}");
            }
        }
        result
    }

    async fn drive(&self, state: &mut LoopState) -> Result<String, LoopError> {
        let deadline = self.time_budget.map(|budget| (Instant::now() + budget, budget));
        let tools = self.invoker.definitions();
        debug!(tools = tools.len(), model = %self.model, "Starting loop");

        loop {
            if self.shutdown.is_set() {
                return Err(LoopError::Cancelled);
            }
            if self.invoker.is_exhausted() {
                return Err(LoopError::AllPeersLost);
            }
            if state.iteration >= self.max_iterations {
                return Err(LoopError::BudgetExceeded {
                    max_iterations: self.max_iterations,
                });
            }

            state.iteration += 1;
            state.phase = LoopPhase::Thinking;
            debug!(iteration = state.iteration, "Loop iteration");
            self.event_bus.publish(DomainEvent::LoopIteration {
                iteration: state.iteration,
                timestamp: chrono::Utc::now(),
            });

            let request = self.request(&state.messages, &tools);
            let response = self.bounded(self.provider.complete(request), deadline).await??;

            match response.next_action() {
                NextAction::FinalAnswer(answer) => {
                    state.messages.push(response.message);
                    return Ok(answer);
                }
                NextAction::ToolCalls(calls) => {
                    debug!(iteration = state.iteration, count = calls.len(), "Executing tool calls");
                    state.messages.push(response.message);
                    state.phase = LoopPhase::Acting;

                    for call in &calls {
                        let observation = self.bounded(self.act(call), deadline).await?;
                        state.tool_calls += 1;
                        state.messages.push(Message::tool_result(&call.id, observation));
                    }
                }
            }
        }
    }

    fn request(&self, messages: &[Message], tools: &[ToolDefinition]) -> ProviderRequest {
        ProviderRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tools.to_vec(),
            stop: vec![],
        }
    }

    /// Dispatch one call. Every failure becomes an observation for the model.
    async fn act(&self, call: &MessageToolCall) -> String {
        let arguments = if call.arguments.trim().is_empty() {
            Ok(serde_json::json!({}))
        } else {
            serde_json::from_str::<serde_json::Value>(&call.arguments)
        };
        let arguments = match arguments {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, "Unparseable tool arguments: {e}");
                return format!("Error: invalid arguments for '{}': {e}", call.name);
            }
        };

        let start = std::time::Instant::now();
        let result = self.invoker.invoke(&call.name, arguments).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(result) => {
                debug!(tool = %call.name, call_id = %call.id, duration_ms, "Tool call observed");
                result.observation()
            }
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, duration_ms, "Tool call failed: {e}");
                format!("Error: {e}")
            }
        }
    }

    /// Race `work` against shutdown and the time budget.
    async fn bounded<F: Future>(&self, work: F, deadline: Option<(Instant, Duration)>) -> Result<F::Output, LoopError> {
        let budget = async {
            match deadline {
                Some((at, budget)) => {
                    tokio::time::sleep_until(at).await;
                    budget
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.shutdown.wait() => Err(LoopError::Cancelled),
            budget = budget => Err(LoopError::TimeBudgetExceeded { budget }),
            output = work => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use toolmux_core::message::Role;

    fn agent(provider: Arc<ScriptedProvider>) -> AgentLoop {
        AgentLoop::new(
            provider,
            "mock-model",
            Arc::new(LocalInvoker::new(toolmux_tools::math_tools())),
            ShutdownFlag::new(),
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn simple_text_response() {
        let provider = Arc::new(ScriptedProvider::answers(vec![text_response("Hello! How can I help?")]));
        let outcome = agent(provider).run("Hello!").await.unwrap();

        assert_eq!(outcome.answer, "Hello! How can I help?");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.tool_calls, 0);
        assert_eq!(outcome.state.phase, LoopPhase::Done);
        // System + User + Assistant
        assert_eq!(outcome.state.messages.len(), 3);
        assert_eq!(outcome.state.messages[0].role, Role::System);
        assert_eq!(outcome.state.messages[0].content, DEFAULT_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn calculator_result_reaches_the_answer() {
        let provider = Arc::new(ScriptedProvider::answers(vec![
            tool_call_response(vec![tool_call("call_1", "calculate", serde_json::json!({"expression": "3*3"}))]),
            text_response("3*3 is 9."),
        ]));
        let outcome = agent(Arc::clone(&provider)).run("What is 3*3?").await.unwrap();

        assert!(outcome.answer.contains('9'));
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls, 1);

        let observation = outcome
            .state
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(observation.tool_call_id.as_deref(), Some("call_1"));
        let data: serde_json::Value = serde_json::from_str(&observation.content).unwrap();
        assert_eq!(data["result"], 9.0);

        // The second Thinking round saw the observation and the tool list.
        let requests = provider.requests();
        assert_eq!(requests[1].messages.len(), 4);
        assert_eq!(requests[1].tools[0].name, "calculate");
    }

    #[tokio::test]
    async fn provider_that_never_answers_exhausts_the_budget() {
        let provider = Arc::new(ScriptedProvider::answers(vec![tool_call_response(vec![tool_call(
            "call_x",
            "calculate",
            serde_json::json!({"expression": "1+1"}),
        )])]));
        let agent = agent(Arc::clone(&provider)).with_max_iterations(4);

        let mut state = LoopState::seeded("sys", "loop forever");
        let err = agent.run_in(&mut state).await.unwrap_err();

        assert!(matches!(err, LoopError::BudgetExceeded { max_iterations: 4 }));
        assert_eq!(provider.calls(), 4);
        assert_eq!(state.iteration, 4);
        assert_eq!(state.phase, LoopPhase::Failed);
    }

    #[tokio::test]
    async fn losing_every_peer_stops_the_loop() {
        let provider = Arc::new(ScriptedProvider::answers(vec![tool_call_response(vec![tool_call(
            "call_x",
            "calculate",
            serde_json::json!({"expression": "1+1"}),
        )])]));
        let agent = AgentLoop::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            "mock-model",
            Arc::new(LocalInvoker::new(toolmux_tools::math_tools()).lost_after(1)),
            ShutdownFlag::new(),
            Arc::new(EventBus::default()),
        )
        .with_max_iterations(6);

        let mut state = LoopState::seeded("sys", "keep calculating");
        let err = agent.run_in(&mut state).await.unwrap_err();

        assert!(matches!(err, LoopError::AllPeersLost));
        // No further Thinking round once nothing can answer.
        assert_eq!(provider.calls(), 1);
        assert_eq!(state.tool_calls, 1);
        assert_eq!(state.phase, LoopPhase::Failed);
    }

    #[tokio::test]
    async fn tool_failures_become_observations() {
        let provider = Arc::new(ScriptedProvider::answers(vec![
            tool_call_response(vec![
                tool_call("call_1", "calculate", serde_json::json!({"expression": "2+a"})),
                tool_call("call_2", "launch_rockets", serde_json::json!({})),
                MessageToolCall {
                    id: "call_3".into(),
                    name: "calculate".into(),
                    arguments: "{not json".into(),
                },
            ]),
            text_response("I could not compute that."),
        ]));
        let outcome = agent(provider).run("break things").await.unwrap();

        let observations: Vec<_> = outcome
            .state
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(observations.len(), 3);
        assert!(observations.iter().all(|o| o.starts_with("Error:")));
        assert!(observations[1].contains("launch_rockets"));
        assert!(observations[2].contains("invalid arguments"));
        assert_eq!(outcome.tool_calls, 3);
    }

    #[tokio::test]
    async fn empty_arguments_mean_no_arguments() {
        let provider = Arc::new(ScriptedProvider::answers(vec![
            tool_call_response(vec![MessageToolCall {
                id: "call_1".into(),
                name: "calculate".into(),
                arguments: String::new(),
            }]),
            text_response("done"),
        ]));
        let outcome = agent(provider).run("q").await.unwrap();
        let observation = &outcome.state.messages[3].content;
        assert!(observation.contains("expression"), "{observation}");
    }

    #[tokio::test]
    async fn provider_error_is_fatal() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::AuthenticationFailed(
            "bad key".into(),
        ))]));
        let err = agent(provider).run("q").await.unwrap_err();
        assert!(matches!(err, LoopError::Reasoning(ProviderError::AuthenticationFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_hits_the_time_budget() {
        let provider = Arc::new(
            ScriptedProvider::answers(vec![text_response("too late")]).with_delay(Duration::from_secs(30)),
        );
        let agent = agent(provider).with_time_budget(Some(Duration::from_secs(5)));

        let err = agent.run("q").await.unwrap_err();
        assert!(matches!(err, LoopError::TimeBudgetExceeded { budget } if budget == Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_a_pending_think() {
        let provider = Arc::new(
            ScriptedProvider::answers(vec![text_response("too late")]).with_delay(Duration::from_secs(30)),
        );
        let shutdown = ShutdownFlag::new();
        let agent = AgentLoop::new(
            provider,
            "mock-model",
            Arc::new(LocalInvoker::new(toolmux_tools::math_tools())),
            shutdown.clone(),
            Arc::new(EventBus::default()),
        );

        let run = tokio::spawn(async move { agent.run("q").await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, LoopError::Cancelled));
    }

    #[tokio::test]
    async fn shutdown_before_start_never_calls_the_provider() {
        let provider = Arc::new(ScriptedProvider::answers(vec![text_response("hi")]));
        let shutdown = ShutdownFlag::new();
        shutdown.trigger();
        let agent = AgentLoop::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            "mock-model",
            Arc::new(LocalInvoker::new(toolmux_tools::math_tools())),
            shutdown,
            Arc::new(EventBus::default()),
        );

        assert!(matches!(agent.run("q").await, Err(LoopError::Cancelled)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn each_iteration_is_published() {
        let provider = Arc::new(ScriptedProvider::answers(vec![
            tool_call_response(vec![tool_call("c", "calculate", serde_json::json!({"expression": "1"}))]),
            text_response("1"),
        ]));
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let agent = AgentLoop::new(
            provider,
            "mock-model",
            Arc::new(LocalInvoker::new(toolmux_tools::math_tools())),
            ShutdownFlag::new(),
            Arc::clone(&events),
        );
        agent.run("q").await.unwrap();

        let mut iterations = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DomainEvent::LoopIteration { iteration, .. } = event.as_ref() {
                iterations.push(*iteration);
            }
        }
        assert_eq!(iterations, vec![1, 2]);
    }

    #[test]
    fn phases_render_lowercase() {
        assert_eq!(LoopPhase::Thinking.to_string(), "thinking");
        assert_eq!(LoopPhase::default(), LoopPhase::Init);
    }
}
