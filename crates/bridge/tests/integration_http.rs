mod common;

use axum::http::StatusCode;
use common::{Backend, run_tool, spawn_backend, start_bridge, users_spec};
use serde_json::{Value, json};

#[tokio::test]
async fn info_endpoint_describes_the_server() -> anyhow::Result<()> {
    let base = spawn_backend(Backend::default()).await?;
    let bridge = start_bridge(&users_spec(&base), &[]).await?;

    let info: Value = reqwest::get(bridge.url("/mcp")).await?.json().await?;
    assert_eq!(info["name"], "openapi-mcp-bridge");
    assert_eq!(info["endpoints"]["run"], "/mcp/run");
    assert_eq!(info["tools"], 4);
    assert_eq!(info["auth"], false);
    assert_eq!(info["documents"][0]["title"], "Users API");
    assert_eq!(info["catalogHash"].as_str().map(str::len), Some(64));
    Ok(())
}

#[tokio::test]
async fn tools_endpoint_lists_public_descriptors_in_document_order() -> anyhow::Result<()> {
    let base = spawn_backend(Backend::default()).await?;
    let bridge = start_bridge(&users_spec(&base), &[]).await?;

    let body: Value = reqwest::get(bridge.url("/mcp/tools")).await?.json().await?;
    let tools = body["tools"].as_array().expect("tools array");
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert_eq!(names, ["getUsers", "createUser", "getUsersId", "slowCall"]);

    for tool in tools {
        let keys: Vec<&String> = tool.as_object().expect("object").keys().collect();
        assert_eq!(keys, ["name", "description", "parameters"]);
        assert_eq!(tool["parameters"]["type"], "object");
    }

    let create = &tools[1];
    assert_eq!(create["parameters"]["required"], json!(["name"]));
    assert_eq!(
        create["parameters"]["properties"]["email"],
        json!({"type": "string", "format": "email"})
    );
    assert_eq!(tools[2]["parameters"]["required"], json!(["id"]));
    Ok(())
}

#[tokio::test]
async fn get_users_with_limit_round_trips_backend_json() -> anyhow::Result<()> {
    let backend = Backend::default();
    let base = spawn_backend(backend.clone()).await?;
    let bridge = start_bridge(&users_spec(&base), &[]).await?;

    let (status, body) = run_tool(
        &bridge,
        json!({"name": "getUsers", "parameters": {"limit": 5}}),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 200);
    assert_eq!(
        body["result"],
        json!({
            "query": "limit=5",
            "users": [{"id": 1, "name": "Ada"}, {"id": 2, "name": "Grace"}]
        })
    );
    assert_eq!(body["headers"]["content-type"], "application/json");
    assert_eq!(backend.hits(), 1);
    assert!(backend.last_auth.lock().is_none());
    Ok(())
}

#[tokio::test]
async fn json_bodies_and_path_parameters_are_bound() -> anyhow::Result<()> {
    let base = spawn_backend(Backend::default()).await?;
    let bridge = start_bridge(&users_spec(&base), &[]).await?;

    let (status, body) = run_tool(
        &bridge,
        json!({"name": "createUser", "parameters": {"name": "Ada", "email": "ada@example.com"}}),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 201);
    assert_eq!(
        body["result"],
        json!({"created": {"name": "Ada", "email": "ada@example.com"}})
    );

    let (status, body) = run_tool(
        &bridge,
        json!({"name": "getUsersId", "parameters": {"id": "42"}}),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!({"id": "42", "name": "Ada"}));
    Ok(())
}

#[tokio::test]
async fn unknown_tool_is_not_found_without_backend_call() -> anyhow::Result<()> {
    let backend = Backend::default();
    let base = spawn_backend(backend.clone()).await?;
    let bridge = start_bridge(&users_spec(&base), &[]).await?;

    let (status, body) = run_tool(&bridge, json!({"name": "doesNotExist", "parameters": {}})).await?;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "NotFoundError");
    assert!(body["error"]["message"].as_str().unwrap_or_default().contains("doesNotExist"));
    assert_eq!(backend.hits(), 0);
    Ok(())
}

#[tokio::test]
async fn validation_failures_are_400_without_backend_call() -> anyhow::Result<()> {
    let backend = Backend::default();
    let base = spawn_backend(backend.clone()).await?;
    let bridge = start_bridge(&users_spec(&base), &[]).await?;

    let (status, body) = run_tool(&bridge, json!({"name": "getUsersId", "parameters": {}})).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "ValidationError");

    let (status, body) = run_tool(
        &bridge,
        json!({"name": "getUsers", "parameters": {"limit": 1, "offset": 2}}),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap_or_default().contains("offset"));

    let resp = reqwest::Client::new()
        .post(bridge.url("/mcp/run"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"]["kind"], "ValidationError");

    assert_eq!(backend.hits(), 0);
    Ok(())
}

#[tokio::test]
async fn upstream_errors_keep_status_and_body() -> anyhow::Result<()> {
    let base = spawn_backend(Backend::default()).await?;
    let bridge = start_bridge(&users_spec(&base), &[]).await?;

    let (status, body) = run_tool(
        &bridge,
        json!({"name": "getUsersId", "parameters": {"id": "404"}}),
    )
    .await?;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["kind"], "UpstreamError");
    assert_eq!(body["status"], 404);
    assert_eq!(body["result"], json!({"error": "no such user"}));
    Ok(())
}

#[tokio::test]
async fn backend_timeouts_map_to_504() -> anyhow::Result<()> {
    let base = spawn_backend(Backend::default()).await?;
    let bridge = start_bridge(&users_spec(&base), &["--request-timeout-secs", "1"]).await?;

    let (status, body) = run_tool(&bridge, json!({"name": "slowCall"})).await?;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["kind"], "TransportError");
    assert!(body["error"]["detail"].is_string());
    Ok(())
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_error() -> anyhow::Result<()> {
    let addr = oamcp_test_support::closed_addr()?;
    let bridge = start_bridge(&users_spec(&format!("http://{addr}")), &[]).await?;

    let (status, body) = run_tool(&bridge, json!({"name": "getUsers", "parameters": {}})).await?;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["kind"], "TransportError");
    Ok(())
}

#[tokio::test]
async fn base_url_override_redirects_calls() -> anyhow::Result<()> {
    let backend = Backend::default();
    let base = spawn_backend(backend.clone()).await?;
    let bridge = start_bridge(
        &users_spec("https://api.invalid.example"),
        &["--base-url", base.as_str()],
    )
    .await?;

    let (status, _) = run_tool(&bridge, json!({"name": "getUsers", "parameters": {}})).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(backend.hits(), 1);
    Ok(())
}
