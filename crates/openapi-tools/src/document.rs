//! `OpenAPI` document loading.
//!
//! Documents are parsed into a raw JSON tree rather than a typed `OpenAPI` struct: one malformed
//! operation must not prevent the rest of the document from producing tools, so typed
//! deserialization happens later, per operation.

use crate::error::{OpenApiToolsError, Result};
use crate::resolver::DocId;
use oamcp_http_tools::safety::{read_body_limited, sanitize_reqwest_error};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// A loaded, immutable `OpenAPI` document.
#[derive(Debug, Clone)]
pub struct OpenApiDocument {
    location: String,
    doc_id: DocId,
    root: Arc<Value>,
    title: String,
    version: String,
    base_url: Arc<str>,
}

/// Options applied while loading a document.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Replaces the base URL derived from `servers`.
    pub base_url_override: Option<String>,
    /// Upper bound on a fetched spec body.
    pub max_spec_bytes: Option<usize>,
}

impl OpenApiDocument {
    /// Load a document from a file path or an http(s) URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read, fetched or parsed, or if no usable base
    /// URL can be determined.
    pub async fn load(client: &Client, location: &str, opts: &LoadOptions) -> Result<Self> {
        let content = if location.starts_with("http://") || location.starts_with("https://") {
            tracing::info!(spec = %location, "fetching OpenAPI document");
            let resp = client
                .get(location)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| OpenApiToolsError::OpenApiSpecFetch {
                    url: location.to_string(),
                    message: sanitize_reqwest_error(&e),
                })?;
            let bytes = read_body_limited(resp, opts.max_spec_bytes)
                .await
                .map_err(|e| OpenApiToolsError::OpenApiSpecReadBody {
                    url: location.to_string(),
                    message: e.to_string(),
                })?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            tracing::info!(spec = %location, "loading OpenAPI document");
            let path = location.strip_prefix("file://").unwrap_or(location);
            tokio::fs::read_to_string(path).await.map_err(|e| {
                OpenApiToolsError::OpenApiSpecReadFile {
                    path: location.to_string(),
                    source: e,
                }
            })?
        };

        Self::parse(location, &content, opts)
    }

    /// Parse document text (YAML or JSON) that was obtained from `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a YAML/JSON mapping, has a non-object `paths`, or
    /// no usable base URL can be determined.
    pub fn parse(location: &str, content: &str, opts: &LoadOptions) -> Result<Self> {
        // JSON is a valid subset of YAML, so serde_yaml alone is enough.
        let root: Value =
            serde_yaml::from_str(content).map_err(|e| OpenApiToolsError::OpenApiSpecParse {
                location: location.to_string(),
                source: e,
            })?;

        let Value::Object(obj) = &root else {
            return Err(OpenApiToolsError::OpenApi(format!(
                "'{location}' is not an OpenAPI document (top level is not a mapping)"
            )));
        };
        if let Some(version) = obj.get("swagger") {
            return Err(OpenApiToolsError::OpenApi(format!(
                "'{location}' is a Swagger {} document; only OpenAPI 3.x is supported",
                version.as_str().map_or_else(|| version.to_string(), str::to_string)
            )));
        }
        if obj.get("openapi").is_none() {
            return Err(OpenApiToolsError::OpenApi(format!(
                "'{location}' is not an OpenAPI document (missing 'openapi' field)"
            )));
        }
        if let Some(paths) = obj.get("paths")
            && !paths.is_object()
            && !paths.is_null()
        {
            return Err(OpenApiToolsError::OpenApi(format!(
                "'{location}': 'paths' must be a mapping"
            )));
        }

        let info = obj.get("info");
        let title = info
            .and_then(|i| i.get("title"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let version = info
            .and_then(|i| i.get("version"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();

        let base_url = match opts.base_url_override.as_deref() {
            Some(url) => resolve_base_url(location, url)?,
            None => {
                let declared = first_server_url(&root).ok_or_else(|| {
                    OpenApiToolsError::BaseUrl(format!(
                        "'{location}' declares no servers; set a base URL explicitly"
                    ))
                })?;
                resolve_base_url(location, &declared)?
            }
        };

        Ok(Self {
            location: location.to_string(),
            doc_id: DocId::parse(location)?,
            root: Arc::new(root),
            title,
            version,
            base_url: Arc::from(base_url.as_str()),
        })
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    #[must_use]
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    #[must_use]
    pub fn root(&self) -> &Arc<Value> {
        &self.root
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn base_url(&self) -> &Arc<str> {
        &self.base_url
    }

    /// Path templates and their (unresolved) path items, in declaration order.
    pub fn paths(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.root
            .get("paths")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|paths| paths.iter().map(|(k, v)| (k.as_str(), v)))
    }
}

/// First `servers[].url` with server-variable defaults substituted.
fn first_server_url(root: &Value) -> Option<String> {
    let server = root.get("servers")?.as_array()?.first()?;
    let mut url = server.get("url")?.as_str()?.to_string();
    if let Some(vars) = server.get("variables").and_then(Value::as_object) {
        for (name, var) in vars {
            if let Some(default) = var.get("default").and_then(Value::as_str) {
                url = url.replace(&format!("{{{name}}}"), default);
            }
        }
    }
    Some(url)
}

/// Make a server URL absolute.
///
/// Relative server URLs (e.g. `/api/v3`) resolve against the spec URL when the spec was fetched
/// over http(s); for file-based specs they are an error.
fn resolve_base_url(spec_location: &str, base_url: &str) -> Result<String> {
    let base_url = base_url.trim();
    if base_url.starts_with("http://") || base_url.starts_with("https://") {
        Url::parse(base_url).map_err(|e| {
            OpenApiToolsError::BaseUrl(format!("Invalid base URL '{base_url}': {e}"))
        })?;
        return Ok(base_url.trim_end_matches('/').to_string());
    }

    if spec_location.starts_with("http://") || spec_location.starts_with("https://") {
        let mut spec_url = Url::parse(spec_location).map_err(|e| {
            OpenApiToolsError::OpenApi(format!("Invalid OpenAPI spec URL '{spec_location}': {e}"))
        })?;
        spec_url.set_fragment(None);

        let resolved = spec_url.join(base_url).map_err(|e| {
            OpenApiToolsError::BaseUrl(format!(
                "Invalid base URL '{base_url}': {e} (set a base URL explicitly)"
            ))
        })?;
        return Ok(resolved.as_str().trim_end_matches('/').to_string());
    }

    Err(OpenApiToolsError::BaseUrl(format!(
        "Invalid base URL '{base_url}': must be an absolute http(s) URL (set a base URL explicitly)"
    )))
}
