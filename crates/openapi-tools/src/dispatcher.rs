//! Tool invocation.
//!
//! [`Dispatcher::invoke`] validates the caller's parameters against the tool, binds them to their
//! HTTP locations, attaches the `Authorization` header and normalizes whatever comes back into a
//! [`ToolResult`]. Failures are values, never panics or empty successes.

use crate::tool::{BodyEncoding, ParamLocation, Tool};
use oamcp_http_tools::encoding::{
    QuerySerialization, encode_component, encode_path_segment, encode_query_pairs,
    serialize_query_param, value_to_string,
};
use oamcp_http_tools::oauth::AuthorizationProvider;
use oamcp_http_tools::safety::{HttpToolsError, decode_body, read_body_limited, sanitize_reqwest_error};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Response headers copied into [`ToolResult::headers`].
const PASSTHROUGH_HEADERS: &[&str] = &[
    "content-type",
    "etag",
    "last-modified",
    "location",
    "cache-control",
    "retry-after",
    "link",
    "x-request-id",
];

/// Closed set of failure kinds visible to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ExtractionError,
    ValidationError,
    NotFoundError,
    AuthenticationError,
    TransportError,
    UpstreamError,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ExtractionError => "ExtractionError",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NotFoundError => "NotFoundError",
            ErrorKind::AuthenticationError => "AuthenticationError",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::UpstreamError => "UpstreamError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The transport failure was a timeout.
    #[serde(skip)]
    pub timed_out: bool,
}

impl ToolError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            timed_out: false,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    #[must_use]
    pub fn not_found(tool: &str) -> Self {
        Self::new(ErrorKind::NotFoundError, format!("Tool not found: {tool}"))
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    /// HTTP status, when a response was received.
    pub status: Option<u16>,
    pub body: Value,
    pub headers: BTreeMap<String, String>,
    pub error: Option<ToolError>,
}

impl ToolResult {
    #[must_use]
    pub fn failure(error: ToolError) -> Self {
        Self {
            status: None,
            body: Value::Null,
            headers: BTreeMap::new(),
            error: Some(error),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Executes tools against their backend API.
#[derive(Clone)]
pub struct Dispatcher {
    client: Client,
    auth: Option<Arc<dyn AuthorizationProvider>>,
    timeout: Option<Duration>,
    max_response_bytes: Option<usize>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            auth: None,
            timeout: None,
            max_response_bytes: None,
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn AuthorizationProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_max_response_bytes(mut self, max: Option<usize>) -> Self {
        self.max_response_bytes = max;
        self
    }

    #[must_use]
    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// Invoke `tool` with `parameters` (a JSON object; `null` means no parameters).
    ///
    /// Work up to sending the request belongs to the caller and is dropped with it. Once sent,
    /// the request runs to completion on its own task and its outcome is logged.
    pub async fn invoke(&self, tool: &Tool, parameters: &Value) -> ToolResult {
        let empty = Map::new();
        let args = match parameters {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return ToolResult::failure(ToolError::validation(
                    "parameters must be a JSON object",
                ));
            }
        };

        if let Err(e) = validate(tool, args) {
            return ToolResult::failure(e);
        }

        let mut request = match self.build_request(tool, args) {
            Ok(r) => r,
            Err(e) => return ToolResult::failure(e),
        };

        if let Some(auth) = &self.auth {
            match auth.authorization_header().await {
                Ok(value) => request = request.header(AUTHORIZATION, value),
                Err(e) => {
                    tracing::warn!(tool = %tool.name, error = %e, "could not obtain access token");
                    return ToolResult::failure(
                        ToolError::new(
                            ErrorKind::AuthenticationError,
                            "Failed to obtain an access token for the backend API",
                        )
                        .with_detail(e.to_string()),
                    );
                }
            }
        }

        let tool_name = tool.name.clone();
        let max_bytes = self.max_response_bytes;
        let task = tokio::spawn(async move {
            let result = send(request, max_bytes).await;
            match &result.error {
                None => {
                    tracing::debug!(tool = %tool_name, status = ?result.status, "backend call completed");
                }
                Some(e) => {
                    tracing::info!(
                        tool = %tool_name,
                        status = ?result.status,
                        kind = e.kind.as_str(),
                        error = %e.message,
                        "backend call failed"
                    );
                }
            }
            result
        });

        match task.await {
            Ok(result) => result,
            Err(e) => ToolResult::failure(
                ToolError::new(ErrorKind::TransportError, "Backend request task failed")
                    .with_detail(e.to_string()),
            ),
        }
    }

    fn build_request(
        &self,
        tool: &Tool,
        args: &Map<String, Value>,
    ) -> Result<reqwest::RequestBuilder, ToolError> {
        let binding = &tool.binding;
        let default_query = QuerySerialization::default();

        let mut path = binding.path_template.clone();
        let mut query = Vec::new();
        let mut headers = HeaderMap::new();
        let mut cookies: Vec<String> = Vec::new();
        let mut body_fields = Map::new();
        let mut body_value: Option<&Value> = None;

        for p in &binding.params {
            let Some(value) = args.get(&p.name).filter(|v| !v.is_null()) else {
                continue;
            };
            match p.location {
                ParamLocation::Path => {
                    let encoded = encode_path_segment(&value_to_string(value));
                    path = path.replace(&format!("{{{}}}", p.name), &encoded);
                }
                ParamLocation::Query => {
                    query.extend(serialize_query_param(
                        &p.name,
                        value,
                        p.query.as_ref().unwrap_or(&default_query),
                    ));
                }
                ParamLocation::Header => {
                    let name = HeaderName::from_bytes(p.name.as_bytes()).map_err(|e| {
                        ToolError::validation(format!("invalid header name '{}'", p.name))
                            .with_detail(e.to_string())
                    })?;
                    let value = HeaderValue::from_str(&value_to_string(value)).map_err(|e| {
                        ToolError::validation(format!("invalid value for header '{}'", p.name))
                            .with_detail(e.to_string())
                    })?;
                    headers.insert(name, value);
                }
                ParamLocation::Cookie => {
                    cookies.push(format!(
                        "{}={}",
                        p.name,
                        encode_component(&value_to_string(value), false)
                    ));
                }
                ParamLocation::Body => match binding.body {
                    Some(BodyEncoding::JsonValue | BodyEncoding::Raw { .. }) => {
                        body_value = Some(value);
                    }
                    Some(BodyEncoding::JsonFields) | None => {
                        body_fields.insert(p.name.clone(), value.clone());
                    }
                },
            }
        }

        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let raw_url = format!("{}{}", binding.base_url.trim_end_matches('/'), path);
        let mut url = Url::parse(&raw_url).map_err(|e| {
            ToolError::validation("could not build the request URL").with_detail(e.to_string())
        })?;
        if !query.is_empty() {
            url.set_query(Some(&encode_query_pairs(&query)));
        }

        let mut request = self
            .client
            .request(binding.method.clone(), url)
            .headers(headers);
        if !cookies.is_empty() {
            request = request.header(COOKIE, cookies.join("; "));
        }

        request = match (&binding.body, body_value) {
            (Some(BodyEncoding::Raw { media_type }), Some(v)) => request
                .header(CONTENT_TYPE, media_type.as_str())
                .body(value_to_string(v)),
            (_, Some(v)) => request.json(v),
            (_, None) if !body_fields.is_empty() => request.json(&body_fields),
            (_, None) => request,
        };

        if let Some(t) = self.timeout {
            request = request.timeout(t);
        }
        Ok(request)
    }
}

fn validate(tool: &Tool, args: &Map<String, Value>) -> Result<(), ToolError> {
    let missing: Vec<&str> = tool
        .parameters
        .required
        .iter()
        .filter(|r| args.get(r.as_str()).is_none_or(Value::is_null))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(ToolError::validation(format!(
            "Missing required parameter(s) for '{}': {}",
            tool.name,
            missing.join(", ")
        )));
    }

    let unknown: Vec<&str> = args
        .keys()
        .filter(|k| !tool.parameters.contains(k))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(ToolError::validation(format!(
            "Unknown parameter(s) for '{}': {}",
            tool.name,
            unknown.join(", ")
        )));
    }

    Ok(())
}

async fn send(request: reqwest::RequestBuilder, max_bytes: Option<usize>) -> ToolResult {
    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            let timed_out = e.is_timeout();
            let message = if timed_out {
                "Backend request timed out"
            } else {
                "Backend request failed"
            };
            let mut err = ToolError::new(ErrorKind::TransportError, message)
                .with_detail(sanitize_reqwest_error(&e));
            err.timed_out = timed_out;
            return ToolResult::failure(err);
        }
    };

    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let headers: BTreeMap<String, String> = PASSTHROUGH_HEADERS
        .iter()
        .filter_map(|name| {
            let value = response.headers().get(*name)?.to_str().ok()?;
            Some(((*name).to_string(), value.to_string()))
        })
        .collect();

    let bytes = match read_body_limited(response, max_bytes).await {
        Ok(b) => b,
        Err(e) => {
            let message = match e {
                HttpToolsError::TooLarge(_) => "Backend response too large",
                HttpToolsError::Transport(_) => "Failed to read backend response",
            };
            let mut result = ToolResult::failure(
                ToolError::new(ErrorKind::TransportError, message).with_detail(e.to_string()),
            );
            result.status = Some(status.as_u16());
            return result;
        }
    };

    let body = decode_body(&bytes, content_type.as_deref());
    let error = (!status.is_success()).then(|| {
        ToolError::new(
            ErrorKind::UpstreamError,
            format!(
                "Backend returned {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            ),
        )
    });

    ToolResult {
        status: Some(status.as_u16()),
        body,
        headers,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{LoadOptions, OpenApiDocument};
    use crate::extractor::extract_tools;
    use async_trait::async_trait;
    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap as AxumHeaders, StatusCode, Uri},
        routing::{any, get},
    };
    use oamcp_http_tools::oauth::TokenError;
    use oamcp_test_support::{closed_addr, spawn_router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Backend {
        hits: Arc<AtomicUsize>,
    }

    async fn list_users(State(b): State<Backend>, uri: Uri) -> Json<Value> {
        b.hits.fetch_add(1, Ordering::SeqCst);
        Json(json!({"query": uri.query(), "users": [{"id": 1}, {"id": 2}]}))
    }

    async fn echo(State(b): State<Backend>, uri: Uri, headers: AxumHeaders, body: String) -> Json<Value> {
        b.hits.fetch_add(1, Ordering::SeqCst);
        let h = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        Json(json!({
            "path": uri.path(),
            "query": uri.query(),
            "trace": h("x-trace"),
            "cookie": h("cookie"),
            "authorization": h("authorization"),
            "contentType": h("content-type"),
            "body": body,
        }))
    }

    async fn missing(State(b): State<Backend>) -> (StatusCode, Json<Value>) {
        b.hits.fetch_add(1, Ordering::SeqCst);
        (StatusCode::NOT_FOUND, Json(json!({"error": "no such thing"})))
    }

    async fn slow(State(b): State<Backend>) -> &'static str {
        b.hits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        "late"
    }

    async fn text(State(b): State<Backend>) -> &'static str {
        b.hits.fetch_add(1, Ordering::SeqCst);
        "plain words"
    }

    async fn spawn_backend(backend: Backend) -> String {
        let app = Router::new()
            .route("/users", get(list_users))
            .route("/items/{id}", any(echo))
            .route("/notes", any(echo))
            .route("/missing", get(missing))
            .route("/slow", get(slow))
            .route("/text", get(text))
            .with_state(backend);
        spawn_router(app).await.expect("spawn backend")
    }

    fn spec(base: &str) -> String {
        format!(
            r#"
openapi: "3.0.0"
info: {{ title: t, version: "1" }}
servers: [{{ url: "{base}" }}]
paths:
  /users:
    get:
      operationId: getUsers
      parameters:
        - {{ name: limit, in: query, schema: {{ type: integer }} }}
  /items/{{id}}:
    post:
      operationId: updateItem
      parameters:
        - {{ name: id, in: path, required: true, schema: {{ type: string }} }}
        - {{ name: tags, in: query, schema: {{ type: array, items: {{ type: string }} }} }}
        - {{ name: X-Trace, in: header, schema: {{ type: string }} }}
        - {{ name: session, in: cookie, schema: {{ type: string }} }}
      requestBody:
        content:
          application/json:
            schema:
              type: object
              required: [title]
              properties:
                title: {{ type: string }}
                done: {{ type: boolean }}
  /notes:
    put:
      operationId: putNote
      requestBody:
        content:
          text/plain:
            schema: {{ type: string }}
  /missing:
    get: {{ operationId: getMissing }}
  /slow:
    get: {{ operationId: getSlow }}
  /text:
    get: {{ operationId: getText }}
"#
        )
    }

    async fn tools(base: &str) -> Vec<Tool> {
        let doc = OpenApiDocument::parse("test.yaml", &spec(base), &LoadOptions::default()).unwrap();
        let ex = extract_tools(&Client::new(), &doc).await;
        assert!(ex.errors.is_empty(), "{:?}", ex.errors);
        ex.tools
    }

    fn find<'a>(tools: &'a [Tool], name: &str) -> &'a Tool {
        tools.iter().find(|t| t.name == name).unwrap()
    }

    struct StaticToken(Result<String, TokenError>);

    #[async_trait]
    impl AuthorizationProvider for StaticToken {
        async fn authorization_header(&self) -> Result<String, TokenError> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn get_users_with_limit_returns_backend_json_unchanged() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let tools = tools(&base).await;

        let result = Dispatcher::new(Client::new())
            .invoke(find(&tools, "getUsers"), &json!({"limit": 5}))
            .await;

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.status, Some(200));
        assert_eq!(
            result.body,
            json!({"query": "limit=5", "users": [{"id": 1}, {"id": 2}]})
        );
        assert_eq!(result.headers.get("content-type").map(String::as_str), Some("application/json"));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_required_parameter_never_reaches_the_backend() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let tools = tools(&base).await;

        let result = Dispatcher::new(Client::new())
            .invoke(find(&tools, "updateItem"), &json!({"id": "7", "title": null}))
            .await;

        let err = result.error.expect("validation error");
        assert_eq!(err.kind, ErrorKind::ValidationError);
        assert!(err.message.contains("title"), "{}", err.message);
        assert_eq!(result.status, None);
        assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_and_non_object_parameters_are_rejected() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let tools = tools(&base).await;
        let d = Dispatcher::new(Client::new());

        let unknown = d.invoke(find(&tools, "getUsers"), &json!({"limt": 5})).await;
        assert_eq!(unknown.error.unwrap().kind, ErrorKind::ValidationError);

        let not_object = d.invoke(find(&tools, "getUsers"), &json!([1])).await;
        assert_eq!(not_object.error.unwrap().kind, ErrorKind::ValidationError);

        assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parameters_are_bound_to_every_location() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let tools = tools(&base).await;

        let result = Dispatcher::new(Client::new())
            .with_auth(Arc::new(StaticToken(Ok("Bearer abc".to_string()))))
            .invoke(
                find(&tools, "updateItem"),
                &json!({
                    "id": "a b",
                    "tags": ["x", "y"],
                    "X-Trace": "t-1",
                    "session": "s=1",
                    "title": "hello",
                    "done": true
                }),
            )
            .await;

        assert!(result.is_success(), "{:?}", result.error);
        let echoed = result.body;
        assert_eq!(echoed["path"], "/items/a%20b");
        assert_eq!(echoed["query"], "tags=x&tags=y");
        assert_eq!(echoed["trace"], "t-1");
        assert_eq!(echoed["cookie"], "session=s%3D1");
        assert_eq!(echoed["authorization"], "Bearer abc");
        let sent: Value = serde_json::from_str(echoed["body"].as_str().unwrap()).unwrap();
        assert_eq!(sent, json!({"title": "hello", "done": true}));
    }

    #[tokio::test]
    async fn raw_bodies_are_sent_with_their_media_type() {
        let base = spawn_backend(Backend::default()).await;
        let tools = tools(&base).await;

        let result = Dispatcher::new(Client::new())
            .invoke(find(&tools, "putNote"), &json!({"body": "remember the milk"}))
            .await;

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.body["contentType"], "text/plain");
        assert_eq!(result.body["body"], "remember the milk");
    }

    #[tokio::test]
    async fn non_2xx_is_an_upstream_error_that_keeps_status_and_body() {
        let base = spawn_backend(Backend::default()).await;
        let tools = tools(&base).await;

        let result = Dispatcher::new(Client::new())
            .invoke(find(&tools, "getMissing"), &json!({}))
            .await;

        assert_eq!(result.status, Some(404));
        assert_eq!(result.body, json!({"error": "no such thing"}));
        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::UpstreamError);
        assert!(err.message.contains("404"));
    }

    #[tokio::test]
    async fn token_failure_is_an_authentication_error_without_backend_call() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let tools = tools(&base).await;

        let result = Dispatcher::new(Client::new())
            .with_auth(Arc::new(StaticToken(Err(TokenError::Rejected {
                status: 401,
                body: "invalid_client".to_string(),
            }))))
            .invoke(find(&tools, "getUsers"), &json!({}))
            .await;

        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::AuthenticationError);
        assert!(err.detail.unwrap().contains("401"));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeouts_are_transport_errors_flagged_as_timeouts() {
        let base = spawn_backend(Backend::default()).await;
        let tools = tools(&base).await;

        let result = Dispatcher::new(Client::new())
            .with_timeout(Duration::from_millis(100))
            .invoke(find(&tools, "getSlow"), &json!({}))
            .await;

        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::TransportError);
        assert!(err.timed_out);
        assert!(err.detail.is_some());
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let addr = closed_addr().unwrap();
        let tools = tools(&format!("http://{addr}")).await;

        let result = Dispatcher::new(Client::new())
            .invoke(find(&tools, "getUsers"), &json!({}))
            .await;
        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::TransportError);
        assert!(!err.timed_out);
    }

    #[tokio::test]
    async fn text_responses_pass_through_as_strings() {
        let base = spawn_backend(Backend::default()).await;
        let tools = tools(&base).await;

        let result = Dispatcher::new(Client::new())
            .invoke(find(&tools, "getText"), &Value::Null)
            .await;
        assert!(result.is_success());
        assert_eq!(result.body, json!("plain words"));
    }

    #[tokio::test]
    async fn oversized_responses_are_rejected() {
        let base = spawn_backend(Backend::default()).await;
        let tools = tools(&base).await;

        let result = Dispatcher::new(Client::new())
            .with_max_response_bytes(Some(4))
            .invoke(find(&tools, "getText"), &json!({}))
            .await;
        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::TransportError);
        assert_eq!(result.status, Some(200));
    }

    #[test]
    fn error_kinds_serialize_to_their_wire_names() {
        for kind in [
            ErrorKind::ExtractionError,
            ErrorKind::ValidationError,
            ErrorKind::NotFoundError,
            ErrorKind::AuthenticationError,
            ErrorKind::TransportError,
            ErrorKind::UpstreamError,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }
}
