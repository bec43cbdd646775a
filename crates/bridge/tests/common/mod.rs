#![allow(dead_code)]

pub mod sse;

use anyhow::Context as _;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser as _;
use oamcp_bridge::config::Cli;
use oamcp_bridge::server::{self, AppState};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A fake backend API that counts hits and remembers the last `Authorization` header.
#[derive(Clone, Default)]
pub struct Backend {
    pub hits: Arc<AtomicUsize>,
    pub last_auth: Arc<parking_lot::Mutex<Option<String>>>,
}

impl Backend {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn record(&self, headers: &HeaderMap) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        *self.last_auth.lock() = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
}

async fn list_users(State(b): State<Backend>, headers: HeaderMap, uri: Uri) -> Json<Value> {
    b.record(&headers);
    Json(json!({
        "query": uri.query(),
        "users": [{"id": 1, "name": "Ada"}, {"id": 2, "name": "Grace"}]
    }))
}

async fn get_user(
    State(b): State<Backend>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    b.record(&headers);
    if id == "404" {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "no such user"})));
    }
    (StatusCode::OK, Json(json!({"id": id, "name": "Ada"})))
}

async fn create_user(State(b): State<Backend>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    b.record(&headers);
    (StatusCode::CREATED, Json(json!({"created": body})))
}

async fn slow(State(b): State<Backend>, headers: HeaderMap) -> &'static str {
    b.record(&headers);
    tokio::time::sleep(Duration::from_secs(10)).await;
    "too late"
}

pub async fn spawn_backend(backend: Backend) -> anyhow::Result<String> {
    let app = Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/{id}", get(get_user))
        .route("/slow", get(slow))
        .with_state(backend);
    oamcp_test_support::spawn_router(app).await
}

pub fn users_spec(base_url: &str) -> String {
    format!(
        r#"
openapi: "3.0.3"
info:
  title: Users API
  version: "1.0"
servers:
  - url: "{base_url}"
paths:
  /users:
    get:
      operationId: getUsers
      summary: List users
      parameters:
        - name: limit
          in: query
          schema: {{ type: integer }}
      responses:
        "200": {{ description: ok }}
    post:
      operationId: createUser
      requestBody:
        required: true
        content:
          application/json:
            schema:
              type: object
              required: [name]
              properties:
                name: {{ type: string }}
                email: {{ type: string, format: email }}
      responses:
        "201": {{ description: created }}
  /users/{{id}}:
    get:
      summary: Get one user
      parameters:
        - name: id
          in: path
          required: true
          schema: {{ type: string }}
      responses:
        "200": {{ description: ok }}
  /slow:
    get:
      operationId: slowCall
      responses:
        "200": {{ description: ok }}
"#
    )
}

/// An in-process bridge bound to an ephemeral port. Shuts down on drop.
pub struct Bridge {
    pub base: String,
    pub state: Arc<AppState>,
    pub spec_path: std::path::PathBuf,
    _dir: TempDir,
}

impl Bridge {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

/// Write `spec` to a temp file and serve it with the extra CLI `args`.
pub async fn start_bridge(spec: &str, args: &[&str]) -> anyhow::Result<Bridge> {
    let dir = tempfile::tempdir().context("create temp dir")?;
    let spec_path = dir.path().join("openapi.yaml");
    std::fs::write(&spec_path, spec).context("write spec")?;

    let spec_arg = spec_path.display().to_string();
    let argv = ["oamcp-bridge", "--spec", spec_arg.as_str()]
        .into_iter()
        .chain(args.iter().copied());
    let cli = Cli::try_parse_from(argv).context("parse bridge args")?;

    let state = AppState::from_config(&cli.config, CancellationToken::new()).await?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind bridge")?;
    let addr = listener.local_addr()?;
    tokio::spawn(server::serve(listener, state.clone()));

    Ok(Bridge {
        base: format!("http://{addr}"),
        state,
        spec_path,
        _dir: dir,
    })
}

pub async fn run_tool(bridge: &Bridge, body: Value) -> anyhow::Result<(StatusCode, Value)> {
    let resp = reqwest::Client::new()
        .post(bridge.url("/mcp/run"))
        .json(&body)
        .send()
        .await
        .context("POST /mcp/run")?;
    let status = StatusCode::from_u16(resp.status().as_u16())?;
    let body = resp.json::<Value>().await.context("decode /mcp/run body")?;
    Ok((status, body))
}
