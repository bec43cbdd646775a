//! HTTP front door: discovery, catalog, invocation and the SSE event stream.

use crate::catalog::{Catalog, CatalogStore, ToolListing};
use crate::config::BridgeConfig;
use crate::events::{BridgeEvent, EventBus, InvocationEvents, subscription_stream};
use anyhow::Context as _;
use axum::{
    Extension, Json, Router,
    body::Bytes,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt as _};
use oamcp_http_tools::oauth::TokenManager;
use oamcp_openapi_tools::dispatcher::{Dispatcher, ErrorKind, ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const SERVER_NAME: &str = "openapi-mcp-bridge";

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Everything a request handler needs.
pub struct AppState {
    pub catalog: Arc<CatalogStore>,
    pub dispatcher: Dispatcher,
    pub events: EventBus,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Load the configured documents and wire the dispatcher, token manager and event bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or any document fails to load.
    pub async fn from_config(
        config: &BridgeConfig,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("oamcp-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build HTTP client")?;

        let catalog = Catalog::load(&client, &config.specs, &config.load_options()).await?;
        for e in catalog.errors() {
            tracing::warn!(error = %e, "skipped operation");
        }
        tracing::info!(
            tools = catalog.len(),
            skipped = catalog.errors().len(),
            catalog_hash = %catalog.hash(),
            "catalog loaded"
        );

        let mut dispatcher = Dispatcher::new(client.clone())
            .with_timeout(config.request_timeout())
            .with_max_response_bytes(config.max_response_bytes);
        match config.auth_config() {
            Some(auth) => {
                tracing::info!(token_url = %auth.token_url, "OAuth2 client credentials enabled");
                let tokens = TokenManager::with_options(
                    client.clone(),
                    auth,
                    config.token_margin(),
                    config.request_timeout(),
                );
                dispatcher = dispatcher.with_auth(Arc::new(tokens));
            }
            None if config.auth.any_set() => {
                tracing::warn!(
                    "incomplete OAuth2 credentials (need client id, secret and token URL); calling the API unauthenticated"
                );
            }
            None => {}
        }

        let events = EventBus::new(config.sse_buffer);
        let store = CatalogStore::new(
            catalog,
            client,
            config.specs.clone(),
            config.load_options(),
            events.clone(),
        );

        Ok(Arc::new(Self {
            catalog: Arc::new(store),
            dispatcher,
            events,
            shutdown,
        }))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mcp", get(server_info))
        .route("/mcp/tools", get(list_tools))
        .route("/mcp/run", post(run_tool))
        .route("/mcp/sse", get(sse))
        .layer(Extension(state))
}

/// Serve until `state.shutdown` is cancelled, then drain open connections.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("serve HTTP")
}

async fn server_info(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let catalog = state.catalog.current();
    Json(json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Exposes OpenAPI operations as MCP tools",
        "endpoints": {
            "info": "/mcp",
            "tools": "/mcp/tools",
            "run": "/mcp/run",
            "sse": "/mcp/sse",
        },
        "tools": catalog.len(),
        "catalogHash": catalog.hash(),
        "documents": catalog.documents(),
        "skipped": catalog.errors(),
        "auth": state.dispatcher.has_auth(),
    }))
}

async fn list_tools(Extension(state): Extension<Arc<AppState>>) -> Response {
    let catalog = state.catalog.current();
    Json(ToolListing {
        tools: catalog.tools(),
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    name: String,
    #[serde(default)]
    parameters: Value,
}

async fn run_tool(Extension(state): Extension<Arc<AppState>>, body: Bytes) -> Response {
    let req: RunRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return result_response(ToolResult::failure(
                ToolError::validation(r#"Request body must be {"name": ..., "parameters": {...}}"#)
                    .with_detail(e.to_string()),
            ));
        }
    };

    // Held for the whole call so a concurrent reload cannot pull the tool away.
    let catalog = state.catalog.current();
    let Some(tool) = catalog.get(&req.name) else {
        tracing::info!(tool = %req.name, "unknown tool requested");
        return result_response(ToolResult::failure(ToolError::not_found(&req.name)));
    };

    let invocation = InvocationEvents::start(&state.events, &tool.name);
    let invocation_id = invocation.invocation_id().to_string();

    let result = state.dispatcher.invoke(tool, &req.parameters).await;
    let duration_ms = invocation.finish(&result);

    tracing::info!(
        tool = %tool.name,
        invocation_id = %invocation_id,
        status = ?result.status,
        error_kind = result.error.as_ref().map(|e| e.kind.as_str()),
        duration_ms,
        "tool invocation finished"
    );

    result_response(result)
}

async fn sse(
    Extension(state): Extension<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before building the greeting so nothing published in between is missed.
    let rx = state.events.subscribe();
    let catalog = state.catalog.current();
    let hello = BridgeEvent::Connected {
        server: SERVER_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tools: catalog.len(),
        catalog_hash: catalog.hash().to_string(),
    };

    let stream = futures::stream::once(async move { hello })
        .chain(subscription_stream(rx, state.shutdown.clone()))
        .map(|event| Ok(sse_event(&event)));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE)
            .text("keep-alive"),
    )
}

fn sse_event(event: &BridgeEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

fn status_for(error: &ToolError) -> StatusCode {
    match error.kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::NotFoundError => StatusCode::NOT_FOUND,
        ErrorKind::TransportError if error.timed_out => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::AuthenticationError | ErrorKind::TransportError | ErrorKind::UpstreamError => {
            StatusCode::BAD_GATEWAY
        }
        ErrorKind::ExtractionError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn result_response(result: ToolResult) -> Response {
    let ToolResult {
        status,
        body,
        headers,
        error,
    } = result;

    match error {
        None => (
            StatusCode::OK,
            Json(json!({ "result": body, "status": status, "headers": headers })),
        )
            .into_response(),
        Some(error) => {
            let code = status_for(&error);
            let mut out = json!({ "error": error });
            if let Some(status) = status {
                out["status"] = json!(status);
                out["result"] = body;
                out["headers"] = json!(headers);
            }
            (code, Json(out)).into_response()
        }
    }
}
