//! Shared test doubles for the loop and session tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use toolmux_core::error::{DispatchError, ProviderError, ToolError};
use toolmux_core::message::{Message, MessageToolCall};
use toolmux_core::protocol::CallToolResult;
use toolmux_core::provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
use toolmux_core::tool::{ToolCall, ToolInvoker, ToolSet};

/// A provider that plays back scripted responses in order.
///
/// Once the script runs out the last response repeats, so a provider that
/// "never answers" is a single tool-call response.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    last: Mutex<Option<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Duration,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn answers(responses: Vec<ProviderResponse>) -> Self {
        Self::new(responses.into_iter().map(Ok).collect())
    }

    /// Sleep this long before every response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(response) => {
                *last = Some(response.clone());
                response
            }
            None => last.clone().expect("ScriptedProvider called with an empty script"),
        }
    }
}

pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

pub fn tool_call_response(calls: Vec<MessageToolCall>) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_tool_calls("", calls),
        usage: None,
        model: "mock-model".into(),
    }
}

pub fn tool_call(id: &str, name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: id.into(),
        name: name.into(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}

/// Runs tools in-process, without a peer in between.
pub struct LocalInvoker {
    tools: ToolSet,
    /// Calls served before the invoker behaves as if its peer died
    lost_after: Option<usize>,
    served: AtomicUsize,
}

impl LocalInvoker {
    pub fn new(tools: ToolSet) -> Self {
        Self {
            tools,
            lost_after: None,
            served: AtomicUsize::new(0),
        }
    }

    pub fn lost_after(mut self, calls: usize) -> Self {
        self.lost_after = Some(calls);
        self
    }

    fn is_lost(&self) -> bool {
        self.lost_after.is_some_and(|n| self.served.load(Ordering::SeqCst) >= n)
    }
}

#[async_trait::async_trait]
impl ToolInvoker for LocalInvoker {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.schemas().iter().map(|s| s.to_definition()).collect()
    }

    async fn invoke(&self, tool_name: &str, arguments: serde_json::Value) -> Result<CallToolResult, DispatchError> {
        if self.is_lost() {
            return Err(DispatchError::PeerUnavailable {
                peer: "local".into(),
                reason: "channel closed".into(),
            });
        }
        self.served.fetch_add(1, Ordering::SeqCst);
        let call = ToolCall {
            id: String::new(),
            name: tool_name.into(),
            arguments,
        };
        match self.tools.execute(&call).await {
            Ok(result) => Ok(CallToolResult {
                content: result.output,
                data: result.data,
            }),
            Err(ToolError::NotFound(name)) => Err(DispatchError::UnknownTool(name)),
            Err(e) => Err(DispatchError::ToolExecution {
                tool: tool_name.into(),
                message: e.to_string(),
            }),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.is_lost()
    }
}
