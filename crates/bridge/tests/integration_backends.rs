mod common;

use common::{eventually, mock_server, spawn_bridge, spawn_ready_bridge, write_config};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tempfile::tempdir;

async fn get_json(client: &reqwest::Client, url: &str) -> anyhow::Result<Value> {
    Ok(client.get(url).send().await?.json().await?)
}

#[tokio::test]
async fn concurrent_calls_complete_out_of_order() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), &[("git", mock_server("git"))])?;
    let bridge = spawn_ready_bridge(&config, &[]).await?;
    let client = reqwest::Client::new();

    let slow_url = bridge.url("/tools/git/sleep");
    let fast_url = bridge.url("/tools/git/sleep");
    let started = Instant::now();

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            let body: Value = client
                .post(slow_url)
                .json(&json!({"ms": 800}))
                .send()
                .await?
                .json()
                .await?;
            anyhow::Ok((body, started.elapsed()))
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast: Value = client
        .post(fast_url)
        .json(&json!({"ms": 50}))
        .send()
        .await?
        .json()
        .await?;
    let fast_elapsed = started.elapsed();

    let (slow, slow_elapsed) = slow.await??;
    assert_eq!(fast["content"][0]["text"], "slept 50");
    assert_eq!(slow["content"][0]["text"], "slept 800");
    assert!(fast_elapsed < slow_elapsed, "{fast_elapsed:?} vs {slow_elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn backend_killed_mid_call_fails_only_its_callers() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_config(
        dir.path(),
        &[("git", mock_server("git")), ("fs", mock_server("fs"))],
    )?;
    let bridge = spawn_ready_bridge(&config, &[]).await?;
    let client = reqwest::Client::new();

    let pending = {
        let client = client.clone();
        let url = bridge.url("/tools/git/sleep");
        tokio::spawn(async move {
            let resp = client.post(url).json(&json!({"ms": 10_000})).send().await?;
            let status = resp.status().as_u16();
            let body: Value = resp.json().await?;
            anyhow::Ok((status, body))
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Crash the process; the crash call itself never gets a reply either.
    let crash = client.post(bridge.url("/tools/git/crash")).send().await?;
    assert_eq!(crash.status(), 503);

    let (status, body) = tokio::time::timeout(Duration::from_secs(5), pending).await???;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["kind"], "BackendUnavailable");

    // The other backend is untouched.
    let resp = client.post(bridge.url("/tools/fs/status")).send().await?;
    assert_eq!(resp.status(), 200);

    // The crashed backend's tools leave the catalog.
    let tools_url = bridge.url("/api/tools");
    eventually(Duration::from_secs(5), || {
        let client = client.clone();
        let url = tools_url.clone();
        async move {
            let tools = get_json(&client, &url).await?;
            Ok(tools
                .as_array()
                .is_some_and(|t| t.iter().all(|t| t["serverId"] == "fs")))
        }
    })
    .await?;

    let resp = client.post(bridge.url("/tools/git/status")).send().await?;
    assert_eq!(resp.status(), 404);

    let server = get_json(&client, &bridge.url("/api/servers/git")).await?;
    assert_eq!(server["state"], "stopped");
    assert!(server["lastError"].as_str().is_some());

    let ready = client.get(bridge.url("/ready")).send().await?;
    assert_eq!(ready.status(), 503);
    Ok(())
}

#[tokio::test]
async fn call_timeout_leaves_backend_running() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), &[("git", mock_server("git"))])?;
    let bridge = spawn_ready_bridge(&config, &["--call-timeout", "1"]).await?;
    let client = reqwest::Client::new();

    let resp = client
        .post(bridge.url("/tools/git/sleep"))
        .json(&json!({"ms": 3000}))
        .send()
        .await?;
    assert_eq!(resp.status(), 504);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"]["kind"], "CallTimeout");

    let resp = client.post(bridge.url("/tools/git/status")).send().await?;
    assert_eq!(resp.status(), 200);
    let server = get_json(&client, &bridge.url("/api/servers/git")).await?;
    assert_eq!(server["state"], "ready");
    assert_eq!(server["generation"], 1);
    Ok(())
}

#[tokio::test]
async fn secret_failure_isolates_one_backend() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut vault = mock_server("vault");
    vault["secretCommands"] = json!({ "VAULT_TOKEN": ["false"] });
    let mut gh = mock_server("gh");
    gh["secretCommands"] = json!({ "GH_TOKEN": ["sh", "-c", "echo '  s3cret  '"] });
    let config = write_config(
        dir.path(),
        &[("vault", vault), ("gh", gh), ("git", mock_server("git"))],
    )?;
    let bridge = spawn_bridge(&config, &[])?;
    let client = reqwest::Client::new();

    let vault = bridge
        .wait_for_server("vault", |s| s["lastError"].is_string())
        .await?;
    assert_eq!(vault["state"], "stopped");
    assert!(
        vault["lastError"]
            .as_str()
            .is_some_and(|e| e.contains("VAULT_TOKEN"))
    );
    bridge.wait_for_server("gh", |s| s["state"] == "ready").await?;
    bridge.wait_for_server("git", |s| s["state"] == "ready").await?;

    // The resolved secret is visible to the backend, trimmed.
    let body: Value = client
        .post(bridge.url("/tools/gh/env"))
        .json(&json!({"var": "GH_TOKEN"}))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["content"][0]["text"], "s3cret");

    let resp = client.post(bridge.url("/tools/git/status")).send().await?;
    assert_eq!(resp.status(), 200);

    let ready = client.get(bridge.url("/ready")).send().await?;
    assert_eq!(ready.status(), 503);
    Ok(())
}

#[tokio::test]
async fn missing_executable_is_reported_per_backend() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_config(
        dir.path(),
        &[
            ("ghost", json!({"command": "/definitely/not/a/binary"})),
            ("git", mock_server("git")),
        ],
    )?;
    let bridge = spawn_bridge(&config, &[])?;
    let client = reqwest::Client::new();

    let ghost = bridge
        .wait_for_server("ghost", |s| s["lastError"].is_string())
        .await?;
    assert_eq!(ghost["state"], "stopped");
    bridge.wait_for_server("git", |s| s["state"] == "ready").await?;
    let resp = client.post(bridge.url("/tools/git/status")).send().await?;
    assert_eq!(resp.status(), 200);
    Ok(())
}

#[tokio::test]
async fn failed_listing_degrades_backend() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut broken = mock_server("broken");
    broken["env"]["MOCK_FAIL_LIST"] = json!("1");
    let config = write_config(dir.path(), &[("broken", broken)])?;
    let bridge = spawn_bridge(&config, &[])?;
    let client = reqwest::Client::new();

    let server = bridge
        .wait_for_server("broken", |s| s["state"] == "degraded")
        .await?;
    assert_eq!(server["toolCount"], 0);
    let tools = get_json(&client, &bridge.url("/api/tools")).await?;
    assert_eq!(tools, json!([]));
    Ok(())
}

#[tokio::test]
async fn disable_and_enable_at_runtime() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), &[("git", mock_server("git"))])?;
    let bridge = spawn_ready_bridge(&config, &[]).await?;
    let client = reqwest::Client::new();
    let server_url = bridge.url("/api/servers/git");

    let status: Value = client
        .patch(&server_url)
        .json(&json!({"enabled": false}))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status["state"], "stopped");
    assert_eq!(status["enabled"], false);

    let resp = client.post(bridge.url("/tools/git/status")).send().await?;
    assert_eq!(resp.status(), 404);

    let status: Value = client
        .patch(&server_url)
        .json(&json!({"enabled": true}))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status["state"], "ready");
    assert_eq!(status["generation"], 2);

    let resp = client.post(bridge.url("/tools/git/status")).send().await?;
    assert_eq!(resp.status(), 200);

    let resp = client
        .patch(bridge.url("/api/servers/nope"))
        .json(&json!({"enabled": true}))
        .send()
        .await?;
    assert_eq!(resp.status(), 404);
    Ok(())
}

#[tokio::test]
async fn tool_list_changes_are_picked_up() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), &[("git", mock_server("git"))])?;
    let bridge = spawn_ready_bridge(&config, &[]).await?;
    let client = reqwest::Client::new();

    let resp = client
        .post(bridge.url("/tools/git/add_tool"))
        .json(&json!({"name": "blame"}))
        .send()
        .await?;
    assert_eq!(resp.status(), 200);

    let schema_url = bridge.url("/api/tools/git/blame");
    eventually(Duration::from_secs(5), || {
        let client = client.clone();
        let url = schema_url.clone();
        async move { Ok(client.get(&url).send().await?.status().is_success()) }
    })
    .await?;

    let body: Value = client
        .post(bridge.url("/tools/git/blame"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["content"][0]["text"], "blame ok");
    Ok(())
}

#[tokio::test]
async fn http_is_served_while_backends_start() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_config(
        dir.path(),
        &[("hung", json!({"command": "sleep", "args": ["30"]}))],
    )?;
    let bridge = spawn_bridge(&config, &["--startup-timeout", "30"])?;
    let client = reqwest::Client::new();

    let health = client.get(bridge.url("/health")).send().await?;
    assert_eq!(health.status(), 200);

    bridge
        .wait_for_server("hung", |s| s["state"] == "starting")
        .await?;
    let ready = client.get(bridge.url("/ready")).send().await?;
    assert_eq!(ready.status(), 503);
    let tools = get_json(&client, &bridge.url("/api/tools")).await?;
    assert_eq!(tools, json!([]));
    Ok(())
}

#[tokio::test]
async fn clamped_call_timeout_is_logged() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_config(dir.path(), &[])?;
    let bridge = spawn_bridge(&config, &["--call-timeout", "999"])?;

    assert!(
        bridge
            .startup_log
            .iter()
            .any(|line| line.contains("clamping") && line.contains("999")),
        "{:#?}",
        bridge.startup_log
    );
    let status: Value = reqwest::get(bridge.url("/status")).await?.json().await?;
    assert_eq!(status["servers"], json!({}));
    Ok(())
}
