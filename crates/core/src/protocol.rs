//! Peer wire protocol: JSON-RPC 2.0 over newline-delimited JSON.
//!
//! Both directions use the same framing: one JSON object per line, no
//! embedded newlines (serde_json never emits them in compact mode).
//!
//! | Method | Params | Result |
//! |--------|--------|--------|
//! | `initialize` | `{}` | [`InitializeResult`] |
//! | `tools/list` | `{}` | [`ListToolsResult`] |
//! | `tools/call` | [`CallToolParams`] | [`CallToolResult`] |
//! | `ping` | `{}` | `{}` |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::error::ProtocolError;
use crate::tool::ToolSchema;

pub const JSONRPC_VERSION: &str = "2.0";

/// Version string exchanged during `initialize`.
pub const PROTOCOL_VERSION: &str = "toolmux/1";

/// Upper bound for a single frame, newline included.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const LIST_TOOLS: &str = "tools/list";
    pub const CALL_TOOL: &str = "tools/call";
    pub const PING: &str = "ping";
}

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    /// The tool ran and reported a failure.
    pub const TOOL_FAILED: i64 = -32000;
    /// The peer refused the call because it is shutting down.
    pub const SHUTTING_DOWN: i64 = -32001;
}

/// JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response
///
/// `id` is `None` only when the request could not be parsed far enough to
/// recover one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Split into the result payload or the remote error.
    pub fn into_result(self) -> Result<serde_json::Value, RpcError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(err),
            (None, Some(value)) => Ok(value),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    pub fn tool_failed(message: impl Into<String>) -> Self {
        Self::new(codes::TOOL_FAILED, message)
    }

    pub fn shutting_down() -> Self {
        Self::new(codes::SHUTTING_DOWN, "Server is shutting down")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// `initialize` result: the peer's identity and everything it hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    pub peer_name: String,
    pub protocol_version: String,
    pub tools: Vec<ToolSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// `tools/call` success payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    /// Human-readable rendering of the result
    pub content: String,

    /// Structured result, shaped by the tool's output schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CallToolResult {
    /// The text the reasoning loop records as the observation.
    ///
    /// Structured data wins when present so the model sees exact values.
    pub fn observation(&self) -> String {
        match &self.data {
            Some(data) => data.to_string(),
            None => self.content.clone(),
        }
    }
}

/// Reads newline-delimited frames from a buffered byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_len(inner, MAX_FRAME_LEN)
    }

    pub fn with_max_len(inner: R, max_len: usize) -> Self {
        Self { inner, buf: Vec::new(), max_len }
    }

    /// Next non-empty line, without its terminator. `None` on clean EOF.
    ///
    /// An oversized frame leaves the stream unsynchronized, so callers
    /// should treat [`ProtocolError::FrameTooLarge`] as fatal.
    pub async fn next_line(&mut self) -> Result<Option<String>, ProtocolError> {
        loop {
            self.buf.clear();
            let limit = (self.max_len + 1) as u64;
            let n = (&mut self.inner).take(limit).read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            if self.buf.last() != Some(&b'\n') && n as u64 == limit {
                return Err(ProtocolError::FrameTooLarge { max: self.max_len });
            }
            let line = std::str::from_utf8(&self.buf)
                .map_err(|e| ProtocolError::Malformed(format!("invalid UTF-8: {e}")))?
                .trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(line.to_string()));
        }
    }

    /// Next frame decoded as `T`. `None` on clean EOF.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        match self.next_line().await? {
            Some(line) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| ProtocolError::Malformed(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Writes newline-delimited frames to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Serialize `message` as one line and flush it.
    pub async fn write<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        let mut bytes =
            serde_json::to_vec(message).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        bytes.push(b'\n');
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and close the underlying stream so the other side sees EOF.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
