//! Scriptable stdio MCP server used by the integration tests.
//!
//! Env:
//! - `MOCK_SERVER_NAME`: reported in `serverInfo` (default `mock`).
//! - `MOCK_FAIL_LIST`: when set, `tools/list` answers with an error.
//! - `MOCK_PAGE_SIZE`: tools per `tools/list` page (default 3).

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::{Mutex, mpsc};

const DEFAULT_PAGE_SIZE: usize = 3;

struct MockState {
    name: String,
    page_size: usize,
    fail_list: bool,
    extra_tools: Mutex<Vec<String>>,
    out: mpsc::UnboundedSender<String>,
}

impl MockState {
    fn send(&self, message: &Value) {
        let _ = self.out.send(message.to_string());
    }

    fn reply(&self, id: &Value, result: Value) {
        self.send(&json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }

    fn reply_error(&self, id: &Value, code: i64, message: &str) {
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        }));
    }
}

fn text(value: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": value.into() }] })
}

fn tool(name: &str, description: &str, properties: &Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": { "type": "object", "properties": properties },
    })
}

async fn all_tools(state: &MockState) -> Vec<Value> {
    let mut tools = vec![
        tool("status", "Report working tree status", &json!({})),
        tool(
            "echo",
            "Echo the arguments back",
            &json!({ "message": { "type": "string" } }),
        ),
        tool(
            "sleep",
            "Sleep before answering",
            &json!({ "ms": { "type": "integer" } }),
        ),
        tool("crash", "Exit the process immediately", &json!({})),
        tool("garbage", "Answer with a malformed message", &json!({})),
        tool("fail", "Answer with a JSON-RPC error", &json!({})),
        tool(
            "env",
            "Read an environment variable",
            &json!({ "var": { "type": "string" } }),
        ),
        tool(
            "add_tool",
            "Register another tool and announce the change",
            &json!({ "name": { "type": "string" } }),
        ),
    ];
    for name in state.extra_tools.lock().await.iter() {
        tools.push(tool(name, "Dynamically added tool", &json!({})));
    }
    tools
}

async fn handle_request(state: Arc<MockState>, id: Value, method: String, params: Value) {
    match method.as_str() {
        "initialize" => state.reply(
            &id,
            json!({
                "protocolVersion": params
                    .get("protocolVersion")
                    .cloned()
                    .unwrap_or_else(|| json!("2025-06-18")),
                "capabilities": { "tools": { "listChanged": true } },
                "serverInfo": { "name": state.name, "version": "0.0.1" },
            }),
        ),
        "ping" => state.reply(&id, json!({})),
        "tools/list" => {
            if state.fail_list {
                state.reply_error(&id, -32603, "tool listing unavailable");
                return;
            }
            let tools = all_tools(&state).await;
            let start = params
                .get("cursor")
                .and_then(Value::as_str)
                .and_then(|c| c.parse::<usize>().ok())
                .unwrap_or(0);
            let end = (start + state.page_size).min(tools.len());
            let mut result = json!({ "tools": tools[start.min(end)..end] });
            if end < tools.len() {
                result["nextCursor"] = json!(end.to_string());
            }
            state.reply(&id, result);
        }
        "tools/call" => call_tool(&state, &id, &params).await,
        other => state.reply_error(&id, -32601, &format!("Method not found: {other}")),
    }
}

async fn call_tool(state: &MockState, id: &Value, params: &Value) {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let is_extra = state.extra_tools.lock().await.iter().any(|t| t == name);

    match name {
        "status" => state.reply(id, text("clean")),
        "echo" => {
            let mut result = text(args.to_string());
            result["structuredContent"] = args;
            state.reply(id, result);
        }
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            state.reply(id, text(format!("slept {ms}")));
        }
        "crash" => std::process::exit(1),
        "garbage" => {
            let _ = state.out.send("this is not json".to_string());
            state.send(&json!({ "jsonrpc": "2.0", "id": id }));
        }
        "fail" => state.reply_error(id, -32050, "tool failed on purpose"),
        "env" => {
            let var = args.get("var").and_then(Value::as_str).unwrap_or("");
            match std::env::var(var) {
                Ok(value) => state.reply(id, text(value)),
                Err(_) => state.reply(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": format!("{var} is not set") }],
                        "isError": true,
                    }),
                ),
            }
        }
        "add_tool" => {
            let new_name = args
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("extra")
                .to_string();
            state.extra_tools.lock().await.push(new_name.clone());
            state.reply(id, text(format!("added {new_name}")));
            state.send(&json!({
                "jsonrpc": "2.0",
                "method": "notifications/tools/list_changed",
            }));
        }
        _ if is_extra => {
            state.reply(id, text(format!("{name} ok")));
        }
        other => state.reply_error(id, -32602, &format!("Unknown tool: {other}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let state = Arc::new(MockState {
        name: std::env::var("MOCK_SERVER_NAME").unwrap_or_else(|_| "mock".to_string()),
        page_size: std::env::var("MOCK_PAGE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE),
        fail_list: std::env::var_os("MOCK_FAIL_LIST").is_some(),
        extra_tools: Mutex::new(Vec::new()),
        out: out_tx,
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock: ignoring unparseable line");
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        match message.get("id").cloned() {
            Some(id) => {
                tokio::spawn(handle_request(
                    Arc::clone(&state),
                    id,
                    method.to_string(),
                    params,
                ));
            }
            None => eprintln!("mock: notification {method}"),
        }
    }

    drop(state);
    let _ = writer.await;
    Ok(())
}
