//! Tool trait: the abstraction over peer capabilities.
//!
//! A peer process hosts a [`ToolSet`]; the orchestrator never sees the tools
//! themselves, only their [`ToolSchema`]s, and reaches them through a
//! [`ToolInvoker`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use crate::error::{DispatchError, ToolError};
use crate::protocol::CallToolResult;
use crate::provider::ToolDefinition;

/// A request to execute a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    /// A successful result carrying both a text rendering and structured data.
    pub fn ok(output: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            call_id: String::new(),
            success: true,
            output: output.into(),
            data: Some(data),
        }
    }
}

/// The advertised shape of one tool.
///
/// Peers send these during the handshake with `peer` left empty; the
/// orchestrator fills in the owning peer when it aggregates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema of the arguments object
    pub input_schema: serde_json::Value,

    /// JSON Schema of the structured result, when the tool declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
}

impl ToolSchema {
    /// Convert into the definition the reasoning provider sees.
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

/// The core Tool trait.
///
/// Each leaf capability (`calculate`, `get_weather`, `search_web`, ...)
/// implements this trait and is hosted by a peer through a [`ToolSet`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "calculate").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// JSON Schema describing the structured result, if any.
    fn output_schema(&self) -> Option<serde_json::Value> {
        None
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<ToolResult, ToolError>;

    /// Describe this tool for the discovery handshake.
    fn to_schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
            output_schema: self.output_schema(),
            peer: String::new(),
        }
    }
}

/// The tools hosted by a single peer.
///
/// Tools are held behind `Arc` so a peer can run each call on its own task.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Builder-style [`ToolSet::register`].
    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Schemas of every hosted tool, ordered by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.to_schema()).collect()
    }

    /// Execute a tool call.
    pub async fn execute(&self, call: &ToolCall) -> std::result::Result<ToolResult, ToolError> {
        let tool = self.get(&call.name).ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let mut result = tool.execute(call.arguments.clone()).await?;
        result.call_id = call.id.clone();
        Ok(result)
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Routes a tool call to whatever actually runs it.
///
/// The supervisor's dispatcher implements this over peer channels; tests
/// implement it in-process.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Definitions of every tool that can currently be invoked.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Invoke `tool_name` with `arguments`.
    async fn invoke(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<CallToolResult, DispatchError>;

    /// True once no tool can be invoked any more, e.g. every peer is gone.
    fn is_exhausted(&self) -> bool {
        false
    }
}
