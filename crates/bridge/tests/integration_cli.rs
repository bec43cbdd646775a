mod common;

use anyhow::Context as _;
use common::{Backend, spawn_backend, users_spec};
use oamcp_test_support::{KillOnDrop, pick_unused_port, wait_http_ok};
use serde_json::Value;
use std::process::{Command, Stdio};
use std::time::Duration;

const BIN: &str = env!("CARGO_BIN_EXE_oamcp-bridge");

#[tokio::test]
async fn serve_binary_exposes_the_catalog() -> anyhow::Result<()> {
    let base = spawn_backend(Backend::default()).await?;
    let dir = tempfile::tempdir()?;
    let spec = dir.path().join("openapi.yaml");
    std::fs::write(&spec, users_spec(&base))?;

    let port = pick_unused_port()?;
    let child = Command::new(BIN)
        .arg("serve")
        .arg("--spec")
        .arg(&spec)
        .arg("--bind")
        .arg(format!("127.0.0.1:{port}"))
        .env_remove("API_CLIENT_ID")
        .env_remove("API_CLIENT_SECRET")
        .env_remove("API_TOKEN_URL")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn oamcp-bridge")?;
    let _guard = KillOnDrop(child);

    let info_url = format!("http://127.0.0.1:{port}/mcp");
    wait_http_ok(&info_url, Duration::from_secs(10)).await?;

    let body: Value = reqwest::get(format!("{info_url}/tools")).await?.json().await?;
    assert_eq!(body["tools"].as_array().map(Vec::len), Some(4));
    Ok(())
}

#[test]
fn export_to_stdout_prints_the_catalog() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let spec = dir.path().join("openapi.yaml");
    std::fs::write(&spec, users_spec("http://127.0.0.1:9"))?;

    let out = Command::new(BIN)
        .args(["export", "--output", "-", "--spec"])
        .arg(&spec)
        .output()
        .context("run oamcp-bridge export")?;
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let v: Value = serde_json::from_slice(&out.stdout).context("parse exported catalog")?;
    let names: Vec<&str> = v["tools"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names, ["getUsers", "createUser", "getUsersId", "slowCall"]);
    Ok(())
}

#[test]
fn missing_spec_fails_fast() -> anyhow::Result<()> {
    let out = Command::new(BIN)
        .arg("list")
        .env_remove("OAMCP_SPECS")
        .output()
        .context("run oamcp-bridge list")?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("--spec"));
    Ok(())
}
