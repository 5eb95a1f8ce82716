//! JSON-RPC request handling for a single peer.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use toolmux_core::error::{ProtocolError, ToolError};
use toolmux_core::protocol::{
    codes, methods, CallToolParams, CallToolResult, FrameReader, FrameWriter, InitializeResult,
    ListToolsResult, RpcError, RpcRequest, RpcResponse, PROTOCOL_VERSION,
};
use toolmux_core::shutdown::{wait_for_signal, ShutdownFlag};
use toolmux_core::tool::{ToolCall, ToolSet};
use tracing::{debug, info, warn};

/// How long a peer keeps answering after shutdown is requested, and how long
/// it waits for in-flight calls on the way out.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Counters reported when [`PeerServer::serve`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeSummary {
    /// `tools/call` requests that were started
    pub calls: u64,
    /// `tools/call` requests refused because shutdown was in progress
    pub refused: u64,
    /// Calls still running when the drain timeout expired
    pub abandoned: u64,
}

/// Serves one [`ToolSet`] over a framed byte stream.
pub struct PeerServer {
    name: String,
    tools: Arc<ToolSet>,
    shutdown: ShutdownFlag,
    drain_timeout: Duration,
}

impl PeerServer {
    pub fn new(name: impl Into<String>, tools: ToolSet) -> Self {
        Self {
            name: name.into(),
            tools: Arc::new(tools),
            shutdown: ShutdownFlag::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Share an existing flag instead of owning a fresh one.
    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Serve on this process's stdin/stdout, with SIGINT/SIGTERM wired to
    /// the shutdown flag.
    pub async fn serve_stdio(self) -> Result<ServeSummary, ProtocolError> {
        let flag = self.shutdown.clone();
        let peer = self.name.clone();
        tokio::spawn(async move {
            loop {
                match wait_for_signal().await {
                    Ok(signal) => {
                        if flag.trigger() {
                            info!(peer = %peer, signal, "Shutdown requested, refusing new calls");
                        } else {
                            debug!(peer = %peer, signal, "Shutdown already in progress");
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer, "Cannot install signal handlers: {e}");
                        break;
                    }
                }
            }
        });

        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Run the protocol until the reader hits EOF, or until the drain
    /// timeout elapses after shutdown was requested.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<ServeSummary, ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!(peer = %self.name, tools = ?self.tools.names(), "Peer serving");

        let (tx, mut rx) = mpsc::channel::<RpcResponse>(64);
        let peer = self.name.clone();
        let writer_task = tokio::spawn(async move {
            let mut frames = FrameWriter::new(writer);
            while let Some(response) = rx.recv().await {
                if let Err(e) = frames.write(&response).await {
                    warn!(peer = %peer, "Failed to write response: {e}");
                    break;
                }
            }
        });

        let mut frames = FrameReader::new(BufReader::new(reader));
        let mut inflight = JoinSet::new();
        let mut summary = ServeSummary::default();
        let mut outcome = Ok(());

        let drain = {
            let flag = self.shutdown.clone();
            let timeout = self.drain_timeout;
            async move {
                flag.wait().await;
                tokio::time::sleep(timeout).await;
            }
        };
        tokio::pin!(drain);

        loop {
            tokio::select! {
                line = frames.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line, &tx, &mut inflight, &mut summary).await,
                    Ok(None) => {
                        debug!(peer = %self.name, "Input closed");
                        break;
                    }
                    Err(ProtocolError::Malformed(reason)) => {
                        send(&tx, RpcResponse::failure(None, RpcError::new(codes::PARSE_ERROR, reason))).await;
                    }
                    Err(e) => {
                        warn!(peer = %self.name, "Input failed: {e}");
                        outcome = Err(e);
                        break;
                    }
                },
                _ = &mut drain => {
                    info!(peer = %self.name, "Drain period over, exiting");
                    break;
                }
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            }
        }

        if !inflight.is_empty() {
            let pending = inflight.len();
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while inflight.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                summary.abandoned = inflight.len() as u64;
                warn!(peer = %self.name, pending, abandoned = summary.abandoned, "Abandoning in-flight calls");
                inflight.abort_all();
            }
        }

        drop(tx);
        let _ = writer_task.await;
        info!(peer = %self.name, calls = summary.calls, refused = summary.refused, "Peer stopped");
        outcome.map(|_| summary)
    }

    async fn handle_line(
        &self,
        line: &str,
        tx: &mpsc::Sender<RpcResponse>,
        inflight: &mut JoinSet<()>,
        summary: &mut ServeSummary,
    ) {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                let err = RpcError::new(codes::PARSE_ERROR, format!("Parse error: {e}"));
                send(tx, RpcResponse::failure(None, err)).await;
                return;
            }
        };

        let request: RpcRequest = match serde_json::from_value(value.clone()) {
            Ok(r) => r,
            Err(e) => {
                let id = value.get("id").and_then(|v| v.as_u64());
                let err = RpcError::new(codes::INVALID_REQUEST, format!("Invalid request: {e}"));
                send(tx, RpcResponse::failure(id, err)).await;
                return;
            }
        };

        let id = request.id;
        let response = match request.method.as_str() {
            methods::INITIALIZE => to_response(
                id,
                &InitializeResult {
                    peer_name: self.name.clone(),
                    protocol_version: PROTOCOL_VERSION.into(),
                    tools: self.tools.schemas(),
                },
            ),
            methods::LIST_TOOLS => to_response(id, &ListToolsResult { tools: self.tools.schemas() }),
            methods::PING => RpcResponse::success(id, serde_json::json!({})),
            methods::CALL_TOOL => match self.start_call(id, request.params, tx, inflight) {
                Ok(()) => {
                    summary.calls += 1;
                    return;
                }
                Err(err) => {
                    if err.code == codes::SHUTTING_DOWN {
                        summary.refused += 1;
                    }
                    RpcResponse::failure(Some(id), err)
                }
            },
            other => RpcResponse::failure(Some(id), RpcError::method_not_found(other)),
        };

        send(tx, response).await;
    }

    /// Validate a `tools/call` and run it on its own task.
    fn start_call(
        &self,
        id: u64,
        params: serde_json::Value,
        tx: &mpsc::Sender<RpcResponse>,
        inflight: &mut JoinSet<()>,
    ) -> Result<(), RpcError> {
        if self.shutdown.is_set() {
            debug!(peer = %self.name, call_id = id, "Refusing call during shutdown");
            return Err(RpcError::shutting_down());
        }

        let params: CallToolParams = serde_json::from_value(params).map_err(RpcError::invalid_params)?;
        if self.tools.get(&params.name).is_none() {
            return Err(RpcError::invalid_params(format!("Unknown tool: {}", params.name)));
        }

        let tools = Arc::clone(&self.tools);
        let tx = tx.clone();
        let peer = self.name.clone();
        inflight.spawn(async move {
            let call = ToolCall {
                id: id.to_string(),
                name: params.name,
                arguments: params.arguments,
            };
            let tool = call.name.clone();
            let start = std::time::Instant::now();

            // A nested task turns a panicking tool into a JoinError instead of
            // taking this handler down with it.
            let joined = tokio::spawn(async move { tools.execute(&call).await }).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let response = match joined {
                Ok(Ok(result)) if result.success => {
                    debug!(peer = %peer, tool = %tool, call_id = id, duration_ms, "Tool succeeded");
                    to_response(id, &CallToolResult { content: result.output, data: result.data })
                }
                Ok(Ok(result)) => {
                    debug!(peer = %peer, tool = %tool, call_id = id, duration_ms, "Tool reported failure");
                    RpcResponse::failure(Some(id), RpcError::tool_failed(result.output))
                }
                Ok(Err(ToolError::ShuttingDown)) => RpcResponse::failure(Some(id), RpcError::shutting_down()),
                Ok(Err(e)) => {
                    debug!(peer = %peer, tool = %tool, call_id = id, error = %e, "Tool failed");
                    RpcResponse::failure(Some(id), RpcError::tool_failed(e.to_string()))
                }
                Err(join_err) => {
                    warn!(peer = %peer, tool = %tool, call_id = id, "Tool task died: {join_err}");
                    RpcResponse::failure(
                        Some(id),
                        RpcError::tool_failed(format!("Tool '{tool}' crashed while handling the call")),
                    )
                }
            };
            send(&tx, response).await;
        });
        Ok(())
    }
}

fn to_response<T: serde::Serialize>(id: u64, result: &T) -> RpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => RpcResponse::success(id, value),
        Err(e) => RpcResponse::failure(
            Some(id),
            RpcError::new(codes::TOOL_FAILED, format!("Failed to encode result: {e}")),
        ),
    }
}

async fn send(tx: &mpsc::Sender<RpcResponse>, response: RpcResponse) {
    if tx.send(response).await.is_err() {
        debug!("Response dropped, writer is gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use toolmux_core::tool::{Tool, ToolResult};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str { "echo" }
        fn description(&self) -> &str { "Echoes back the input" }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            let text = arguments["text"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments("Missing 'text' argument".into()))?;
            Ok(ToolResult::ok(text, serde_json::json!({ "text": text })))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str { "explode" }
        fn description(&self) -> &str { "Always panics" }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            panic!("boom");
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str { "slow" }
        fn description(&self) -> &str { "Sleeps before answering" }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ToolResult::ok("done", serde_json::json!({})))
        }
    }

    struct Client {
        writer: FrameWriter<WriteHalf<DuplexStream>>,
        reader: FrameReader<BufReader<ReadHalf<DuplexStream>>>,
    }

    impl Client {
        async fn send(&mut self, id: u64, method: &str, params: serde_json::Value) {
            self.writer.write(&RpcRequest::new(id, method, params)).await.unwrap();
        }

        async fn recv(&mut self) -> RpcResponse {
            tokio::time::timeout(Duration::from_secs(5), self.reader.read())
                .await
                .expect("peer should answer")
                .unwrap()
                .expect("peer closed early")
        }
    }

    fn start(server: PeerServer) -> (Client, tokio::task::JoinHandle<Result<ServeSummary, ProtocolError>>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let handle = tokio::spawn(server.serve(server_read, server_write));
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = Client {
            writer: FrameWriter::new(client_write),
            reader: FrameReader::new(BufReader::new(client_read)),
        };
        (client, handle)
    }

    fn tools() -> ToolSet {
        ToolSet::new()
            .with(Arc::new(EchoTool))
            .with(Arc::new(PanicTool))
            .with(Arc::new(SlowTool))
    }

    #[tokio::test]
    async fn initialize_advertises_tools() {
        let (mut client, _handle) = start(PeerServer::new("echo-peer", tools()));
        client.send(1, methods::INITIALIZE, serde_json::json!({})).await;

        let resp = client.recv().await;
        assert_eq!(resp.id, Some(1));
        let init: InitializeResult = serde_json::from_value(resp.into_result().unwrap()).unwrap();
        assert_eq!(init.peer_name, "echo-peer");
        assert_eq!(init.protocol_version, PROTOCOL_VERSION);
        let names: Vec<_> = init.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "explode", "slow"]);
    }

    #[tokio::test]
    async fn call_returns_structured_result() {
        let (mut client, _handle) = start(PeerServer::new("p", tools()));
        client
            .send(2, methods::CALL_TOOL, serde_json::json!({"name": "echo", "arguments": {"text": "hi"}}))
            .await;

        let result: CallToolResult =
            serde_json::from_value(client.recv().await.into_result().unwrap()).unwrap();
        assert_eq!(result.content, "hi");
        assert_eq!(result.data.unwrap()["text"], "hi");
    }

    #[tokio::test]
    async fn tool_error_becomes_failure_response() {
        let (mut client, _handle) = start(PeerServer::new("p", tools()));
        client
            .send(3, methods::CALL_TOOL, serde_json::json!({"name": "echo", "arguments": {}}))
            .await;

        let err = client.recv().await.into_result().unwrap_err();
        assert_eq!(err.code, codes::TOOL_FAILED);
        assert!(err.message.contains("Missing 'text'"));
    }

    #[tokio::test]
    async fn panicking_tool_does_not_take_the_peer_down() {
        let (mut client, _handle) = start(PeerServer::new("p", tools()));
        client
            .send(4, methods::CALL_TOOL, serde_json::json!({"name": "explode", "arguments": {}}))
            .await;
        let err = client.recv().await.into_result().unwrap_err();
        assert_eq!(err.code, codes::TOOL_FAILED);
        assert!(err.message.contains("crashed"));

        client
            .send(5, methods::CALL_TOOL, serde_json::json!({"name": "echo", "arguments": {"text": "still here"}}))
            .await;
        let resp = client.recv().await;
        assert_eq!(resp.id, Some(5));
        assert!(resp.into_result().is_ok());
    }

    #[tokio::test]
    async fn unknown_method_and_tool_are_rejected() {
        let (mut client, _handle) = start(PeerServer::new("p", tools()));
        client.send(6, "tools/destroy", serde_json::json!({})).await;
        assert_eq!(client.recv().await.into_result().unwrap_err().code, codes::METHOD_NOT_FOUND);

        client
            .send(7, methods::CALL_TOOL, serde_json::json!({"name": "nope", "arguments": {}}))
            .await;
        assert_eq!(client.recv().await.into_result().unwrap_err().code, codes::INVALID_PARAMS);

        client.send(8, methods::CALL_TOOL, serde_json::json!({"arguments": {}})).await;
        assert_eq!(client.recv().await.into_result().unwrap_err().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn json_that_is_not_a_request_is_invalid() {
        let (mut client, _handle) = start(PeerServer::new("p", tools()));
        client.writer.write(&"not a request").await.unwrap();
        let resp = client.recv().await;
        assert_eq!(resp.id, None);
        assert_eq!(resp.into_result().unwrap_err().code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn non_json_line_gets_parse_error() {
        use tokio::io::AsyncWriteExt;

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let _handle = tokio::spawn(PeerServer::new("p", tools()).serve(server_read, server_write));
        let (client_read, mut client_write) = tokio::io::split(client_io);
        let mut reader = FrameReader::new(BufReader::new(client_read));

        client_write.write_all(b"{this is not json\n").await.unwrap();
        let resp: RpcResponse = reader.read().await.unwrap().expect("parse error response");
        assert_eq!(resp.id, None);
        assert_eq!(resp.into_result().unwrap_err().code, codes::PARSE_ERROR);

        // The connection survives and serves the next request.
        let mut writer = FrameWriter::new(client_write);
        writer.write(&RpcRequest::new(1, methods::PING, serde_json::json!({}))).await.unwrap();
        let resp: RpcResponse = reader.read().await.unwrap().expect("ping response");
        assert_eq!(resp.id, Some(1));
        assert!(resp.into_result().is_ok());
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail_fast() {
        let server = PeerServer::new("p", tools());
        let flag = server.shutdown_flag();
        let (mut client, _handle) = start(server);

        flag.trigger();
        client
            .send(9, methods::CALL_TOOL, serde_json::json!({"name": "echo", "arguments": {"text": "x"}}))
            .await;
        let err = client.recv().await.into_result().unwrap_err();
        assert_eq!(err.code, codes::SHUTTING_DOWN);
        assert_eq!(err.message, "Server is shutting down");
    }

    #[tokio::test]
    async fn in_flight_call_finishes_after_shutdown() {
        let server = PeerServer::new("p", tools());
        let flag = server.shutdown_flag();
        let (mut client, handle) = start(server);

        client
            .send(10, methods::CALL_TOOL, serde_json::json!({"name": "slow", "arguments": {}}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.trigger();

        let resp = client.recv().await;
        assert_eq!(resp.id, Some(10));
        assert!(resp.into_result().is_ok());

        client.writer.shutdown().await.unwrap();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.calls, 1);
        assert_eq!(summary.abandoned, 0);
    }

    #[tokio::test]
    async fn eof_ends_serving() {
        let (mut client, handle) = start(PeerServer::new("p", tools()));
        client.send(11, methods::PING, serde_json::json!({})).await;
        assert!(client.recv().await.into_result().is_ok());

        client.writer.shutdown().await.unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("serve should return on EOF")
            .unwrap()
            .unwrap();
        assert_eq!(summary, ServeSummary::default());
    }

    #[tokio::test]
    async fn drain_deadline_ends_serving_without_eof() {
        let server = PeerServer::new("p", tools()).with_drain_timeout(Duration::from_millis(50));
        let flag = server.shutdown_flag();
        let (_client, handle) = start(server);

        flag.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("serve should stop after the drain period")
            .unwrap()
            .unwrap();
    }
}
