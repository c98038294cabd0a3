#![allow(dead_code)]

use anyhow::Context as _;
use serde_json::{Value, json};
use std::io::BufRead as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

pub const MOCK_BIN: &str = env!("CARGO_BIN_EXE_mock-tool-server");

/// Kills the child process when dropped.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

pub async fn wait_http_ok(url: &str, timeout_dur: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if let Ok(resp) = client.get(url).send().await
            && resp.status().is_success()
        {
            return Ok(());
        }
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {url}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn eventually<F, Fut>(timeout_dur: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<bool>>,
{
    let start = Instant::now();
    loop {
        if check().await? {
            return Ok(());
        }
        if start.elapsed() > timeout_dur {
            anyhow::bail!("condition not met within {timeout_dur:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ============================================================================
// Config
// ============================================================================

/// A `mcpServers` entry running the mock tool server.
pub fn mock_server(name: &str) -> Value {
    json!({
        "command": MOCK_BIN,
        "env": { "MOCK_SERVER_NAME": name },
    })
}

pub fn write_config(dir: &Path, servers: &[(&str, Value)]) -> anyhow::Result<PathBuf> {
    let servers: serde_json::Map<String, Value> = servers
        .iter()
        .map(|(id, server)| ((*id).to_string(), server.clone()))
        .collect();
    let path = dir.join("mcp_servers.json");
    std::fs::write(
        &path,
        serde_json::to_vec_pretty(&json!({ "mcpServers": servers }))?,
    )
    .context("write config")?;
    Ok(path)
}

// ============================================================================
// Bridge process
// ============================================================================

pub struct SpawnedBridge {
    pub child: KillOnDrop,
    pub base: String,
    /// Output lines up to and including the listen line.
    pub startup_log: Vec<String>,
}

impl SpawnedBridge {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Poll `/api/servers/{id}` until `check` accepts the status; returns that status.
    pub async fn wait_for_server<F>(&self, id: &str, mut check: F) -> anyhow::Result<Value>
    where
        F: FnMut(&Value) -> bool,
    {
        let client = reqwest::Client::new();
        let url = self.url(&format!("/api/servers/{id}"));
        let start = Instant::now();
        loop {
            let status: Value = client.get(&url).send().await?.json().await?;
            if check(&status) {
                return Ok(status);
            }
            if start.elapsed() > Duration::from_secs(20) {
                anyhow::bail!("server {id} never reached the expected state: {status}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn parse_listen_addr(line: &str, marker: &str) -> Option<String> {
    let idx = line.find(marker)?;
    let rest = &line[idx + marker.len()..];
    // Logs are JSON and the address ends before the next quote or brace.
    let end = rest
        .find('"')
        .or_else(|| rest.find('}'))
        .unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

fn wait_for_listen_addr(mut child: Child, timeout: Duration) -> anyhow::Result<SpawnedBridge> {
    let stdout = child.stdout.take().context("missing child stdout")?;
    let stderr = child.stderr.take().context("missing child stderr")?;

    // Keep draining both pipes for the lifetime of the child.
    let (tx, rx) = mpsc::channel::<String>();
    let tx_out = tx.clone();
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx_out.send(line);
        }
    });
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });

    let mut child = KillOnDrop(child);
    let start = Instant::now();
    let mut startup_log: Vec<String> = Vec::new();

    while start.elapsed() < timeout {
        if let Ok(Some(status)) = child.0.try_wait() {
            anyhow::bail!(
                "bridge exited early: {status}; output:\n{}",
                startup_log.join("\n")
            );
        }

        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                let addr = parse_listen_addr(&line, "Starting HTTP server on ");
                startup_log.push(line);
                if let Some(addr) = addr {
                    return Ok(SpawnedBridge {
                        child,
                        base: format!("http://{addr}"),
                        startup_log,
                    });
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    anyhow::bail!(
        "timed out waiting for listen address; output:\n{}",
        startup_log.join("\n")
    );
}

pub fn spawn_bridge(config_path: &Path, extra_args: &[&str]) -> anyhow::Result<SpawnedBridge> {
    let bin = env!("CARGO_BIN_EXE_mcp-bridge");
    let mut cmd = Command::new(bin);
    cmd.arg("--bind")
        .arg("127.0.0.1:0")
        .arg("--config")
        .arg(config_path)
        .arg("--auto-enable")
        .arg("*")
        .arg("--log-level")
        .arg("info")
        .args(extra_args)
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let child = cmd.spawn().context("spawn bridge")?;
    wait_for_listen_addr(child, Duration::from_secs(20))
}

/// Spawn a bridge and wait until `/ready` reports every enabled backend ready.
pub async fn spawn_ready_bridge(
    config_path: &Path,
    extra_args: &[&str],
) -> anyhow::Result<SpawnedBridge> {
    let bridge = spawn_bridge(config_path, extra_args)?;
    wait_http_ok(&bridge.url("/ready"), Duration::from_secs(20)).await?;
    Ok(bridge)
}

// ============================================================================
// Streaming client
// ============================================================================

pub struct McpClient {
    pub http: reqwest::Client,
    pub url: String,
    pub session_id: Option<String>,
    next_id: u64,
}

impl McpClient {
    pub fn new(bridge: &SpawnedBridge) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: bridge.url("/mcp"),
            session_id: None,
            next_id: 1,
        }
    }

    pub async fn post(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut req = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        if let Some(session_id) = &self.session_id {
            req = req.header("Mcp-Session-Id", session_id);
        }
        req.send().await.context("POST /mcp")
    }

    /// Send a request and return `(status, body)`.
    pub async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<(u16, Value)> {
        let id = self.next_id;
        self.next_id += 1;
        let resp = self
            .post(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.context("decode /mcp reply")?;
        Ok((status, body))
    }

    pub async fn initialize(&mut self) -> anyhow::Result<Value> {
        let resp = self
            .post(&json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": {},
                    "clientInfo": { "name": "integration-test", "version": "0" },
                },
            }))
            .await?;
        anyhow::ensure!(resp.status().is_success(), "initialize failed: {}", resp.status());
        let session_id = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .context("missing Mcp-Session-Id")?
            .to_string();
        self.session_id = Some(session_id);
        let body: Value = resp.json().await?;

        let note = self
            .post(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await?;
        anyhow::ensure!(note.status().as_u16() == 202, "initialized notification rejected");
        Ok(body)
    }
}
