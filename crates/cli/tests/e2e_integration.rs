//! End-to-end tests for the toolmux binary.
//!
//! These launch the real executable: as a builtin peer spoken to over
//! stdio, and as an orchestrator that spawns itself as peers and talks to a
//! mock chat-completions endpoint.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;

use serde_json::{json, Value};

const BIN: &str = env!("CARGO_BIN_EXE_toolmux");

/// Environment that would leak the developer's setup into a test.
const SCRUBBED: &[&str] = &[
    "TOOLMUX_API_KEY",
    "OPENAI_API_KEY",
    "OPENROUTER_API_KEY",
    "TOOLMUX_PROVIDER",
    "TOOLMUX_MODEL",
    "TOOLMUX_CONFIG",
    "TAVILY_API_KEY",
];

fn toolmux(config: &Path) -> Command {
    let mut cmd = Command::new(BIN);
    cmd.arg("--config").arg(config);
    for key in SCRUBBED {
        cmd.env_remove(key);
    }
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(&path, body).unwrap();
    path
}

/// Run a builtin peer, feed it `requests`, close its input, and collect the
/// responses by id.
fn converse(kind: &str, envs: &[(&str, &str)], requests: &[Value]) -> HashMap<u64, Value> {
    let mut cmd = Command::new(BIN);
    cmd.args(["peer", kind])
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    for (key, value) in envs {
        cmd.env(key, value);
    }
    let mut child = cmd.spawn().unwrap();

    let mut stdin = child.stdin.take().unwrap();
    for request in requests {
        writeln!(stdin, "{request}").unwrap();
    }
    drop(stdin);

    let stdout = BufReader::new(child.stdout.take().unwrap());
    let mut responses = HashMap::new();
    for line in stdout.lines() {
        let response: Value = serde_json::from_str(&line.unwrap()).unwrap();
        assert_eq!(response["jsonrpc"], "2.0");
        if let Some(id) = response["id"].as_u64() {
            responses.insert(id, response);
        }
    }
    assert!(child.wait().unwrap().success());
    responses
}

fn request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

// ── Peer mode ────────────────────────────────────────────────────────────

#[test]
fn math_peer_speaks_the_protocol() {
    let responses = converse(
        "math",
        &[],
        &[
            request(1, "initialize", json!({})),
            request(2, "tools/call", json!({"name": "calculate", "arguments": {"expression": "2 + 2"}})),
            request(3, "tools/call", json!({"name": "calculate", "arguments": {"expression": "2^3"}})),
            request(4, "tools/call", json!({"name": "calculate", "arguments": {"expression": "2+a"}})),
            request(5, "resources/list", json!({})),
            request(6, "ping", json!({})),
        ],
    );

    let init = &responses[&1]["result"];
    assert_eq!(init["peer_name"], "math");
    assert_eq!(init["protocol_version"], "toolmux/1");
    assert_eq!(init["tools"][0]["name"], "calculate");

    assert_eq!(responses[&2]["result"]["data"]["result"], 4.0);
    assert_eq!(responses[&3]["result"]["data"]["result"], 8.0);
    assert_eq!(responses[&4]["error"]["code"], -32000);
    assert_eq!(responses[&5]["error"]["code"], -32601);
    assert_eq!(responses[&6]["result"], json!({}));
}

#[test]
fn weather_peer_returns_a_fixed_shape_record() {
    let responses = converse(
        "weather",
        &[("TOOLMUX_WEATHER_DELAY_MS", "0")],
        &[request(
            1,
            "tools/call",
            json!({"name": "get_weather", "arguments": {"location": "Lisbon", "units": "metric"}}),
        )],
    );

    let data = &responses[&1]["result"]["data"];
    assert!(data["temperature"].is_number());
    assert!(!data["description"].as_str().unwrap().is_empty());
    assert!(data["humidity"].is_number());
    assert!(data["wind_speed"].is_number());
    assert_eq!(data["location"], "Lisbon");
}

#[test]
fn peer_rejects_an_unknown_kind() {
    let output = Command::new(BIN).args(["peer", "shell"]).output().unwrap();
    assert!(!output.status.success());
}

// ── Orchestrator mode ────────────────────────────────────────────────────

#[test]
fn tools_lists_the_builtin_peers() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[weather]\ndelay_ms = 0\n");

    let output = toolmux(&config).arg("tools").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("calculate"));
    assert!(stdout.contains("get_weather"));
    // No search key, no search peer.
    assert!(!stdout.contains("search_web"));
}

#[test]
fn tools_reports_a_broken_peer_set() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[[peers]]
name = "ghost"
command = "/nonexistent/peer-binary"
"#,
    );

    let output = toolmux(&config).arg("tools").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout.contains("ghost"), "stdout: {stdout}");
}

#[test]
fn ask_without_an_api_key_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    let output = toolmux(&config).args(["ask", "What is 3*3?"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).contains("API key"));
}

#[test]
fn ask_with_closed_input_is_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "api_key = \"sk-test\"\n");

    let output: Output = toolmux(&config)
        .arg("ask")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(130));
    assert!(stdout.contains("Query: "));
    assert!(stdout.contains("Operation cancelled by user."));
}

/// Read one HTTP request (headers plus Content-Length body).
fn read_request(socket: &mut TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw);
        if let Some(idx) = text.find("\r\n\r\n") {
            let content_length = text[..idx]
                .lines()
                .find_map(|l| {
                    let lower = l.to_ascii_lowercase();
                    lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                })
                .unwrap_or(0);
            if raw.len() >= idx + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&raw).into_owned()
}

/// A chat-completions endpoint that serves `bodies` in order, one per
/// connection, and hands back the raw requests.
fn mock_completions(bodies: Vec<Value>) -> (String, thread::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/v1", listener.local_addr().unwrap());
    let handle = thread::spawn(move || {
        let mut requests = Vec::new();
        for body in bodies {
            let (mut socket, _) = listener.accept().unwrap();
            requests.push(read_request(&mut socket));
            let body = body.to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).unwrap();
        }
        requests
    });
    (url, handle)
}

#[test]
fn ask_answers_through_the_math_peer() {
    let (url, server) = mock_completions(vec![
        json!({
            "model": "mock-model",
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "calculate", "arguments": "{\"expression\":\"3*3\"}"}
                }]
            }}]
        }),
        json!({
            "model": "mock-model",
            "choices": [{"message": {"role": "assistant", "content": "3*3 is 9."}}]
        }),
    ]);

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &format!(
            r#"
api_key = "sk-test"

[weather]
delay_ms = 0

[providers.openai]
api_url = "{url}"
"#
        ),
    );

    let output = toolmux(&config).args(["ask", "What is 3*3?"]).output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {stdout}\nstderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.trim_end().ends_with("3*3 is 9."));

    let requests = server.join().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].contains("\"calculate\""));
    assert!(requests[0].contains("\"get_weather\""));
    // The observation went back to the model tied to its call.
    assert!(requests[1].contains("call_1"));
    assert!(requests[1].contains("result"));
}
