//! The served tool catalog and its reload path.

use crate::events::{BridgeEvent, EventBus};
use anyhow::Context as _;
use oamcp_openapi_tools::document::{LoadOptions, OpenApiDocument};
use oamcp_openapi_tools::extractor::{ExtractionError, extract_catalog};
use oamcp_openapi_tools::tool::Tool;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use sha2::Digest as _;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    pub location: String,
    pub title: String,
    pub version: String,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
}

/// Wire form of a tool listing: `{"tools": [...]}`.
#[derive(Debug, Serialize)]
pub struct ToolListing<'a> {
    pub tools: &'a [Tool],
}

/// An immutable snapshot of the tools being served.
#[derive(Debug, Default)]
pub struct Catalog {
    tools: Vec<Tool>,
    by_name: HashMap<String, usize>,
    errors: Vec<ExtractionError>,
    documents: Vec<DocumentSummary>,
    hash: String,
}

impl Catalog {
    #[must_use]
    pub fn new(
        tools: Vec<Tool>,
        errors: Vec<ExtractionError>,
        documents: Vec<DocumentSummary>,
    ) -> Self {
        let by_name = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        let hash = catalog_hash(&tools);
        Self {
            tools,
            by_name,
            errors,
            documents,
            hash,
        }
    }

    /// Load every document and extract one catalog with names unique across all of them.
    ///
    /// # Errors
    ///
    /// Returns an error if any document cannot be loaded. Operations that fail to convert are
    /// not errors; they are recorded in [`Catalog::errors`].
    pub async fn load(client: &Client, specs: &[String], opts: &LoadOptions) -> anyhow::Result<Self> {
        let mut docs = Vec::with_capacity(specs.len());
        for spec in specs {
            let doc = OpenApiDocument::load(client, spec, opts)
                .await
                .with_context(|| format!("load OpenAPI document '{spec}'"))?;
            docs.push(doc);
        }

        let extraction = extract_catalog(client, &docs).await;
        let documents = docs
            .iter()
            .map(|d| DocumentSummary {
                location: d.location().to_string(),
                title: d.title().to_string(),
                version: d.version().to_string(),
                base_url: d.base_url().to_string(),
            })
            .collect();

        Ok(Self::new(extraction.tools, extraction.errors, documents))
    }

    #[must_use]
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.by_name.get(name).and_then(|&i| self.tools.get(i))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn errors(&self) -> &[ExtractionError] {
        &self.errors
    }

    #[must_use]
    pub fn documents(&self) -> &[DocumentSummary] {
        &self.documents
    }

    /// SHA-256 over the client-visible catalog.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Holds the current catalog and swaps it atomically on reload.
///
/// Readers clone the inner `Arc`, so an invocation keeps the catalog it started with even if a
/// reload lands meanwhile.
pub struct CatalogStore {
    current: RwLock<Arc<Catalog>>,
    client: Client,
    specs: Vec<String>,
    load_options: LoadOptions,
    events: EventBus,
    reload_lock: tokio::sync::Mutex<()>,
}

impl CatalogStore {
    #[must_use]
    pub fn new(
        initial: Catalog,
        client: Client,
        specs: Vec<String>,
        load_options: LoadOptions,
        events: EventBus,
    ) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            client,
            specs,
            load_options,
            events,
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn current(&self) -> Arc<Catalog> {
        self.current.read().clone()
    }

    /// Re-read every document and install the result.
    ///
    /// Returns whether the client-visible catalog changed; a change is announced as
    /// [`BridgeEvent::CatalogUpdated`].
    ///
    /// # Errors
    ///
    /// Returns an error if any document fails to load; the previous catalog stays in place.
    pub async fn reload(&self) -> anyhow::Result<bool> {
        let _guard = self.reload_lock.lock().await;

        let next = Catalog::load(&self.client, &self.specs, &self.load_options).await?;
        for e in next.errors() {
            tracing::warn!(error = %e, "skipped operation");
        }

        let next = Arc::new(next);
        let previous = std::mem::replace(&mut *self.current.write(), next.clone());
        let changed = previous.hash() != next.hash();

        if changed {
            tracing::info!(
                tools = next.len(),
                catalog_hash = %next.hash(),
                "catalog updated"
            );
            self.events.publish(BridgeEvent::CatalogUpdated {
                tools: next.len(),
                catalog_hash: next.hash().to_string(),
            });
        } else {
            tracing::debug!(tools = next.len(), "catalog unchanged after reload");
        }
        Ok(changed)
    }
}

/// Order-independent content hash of the client-visible tool surface.
#[must_use]
pub fn catalog_hash(tools: &[Tool]) -> String {
    let mut entries: Vec<(String, Value)> = tools
        .iter()
        .map(|t| {
            let v = serde_json::json!({
                "name": t.name,
                "description": t.description,
                "parameters": canonicalize_json(&t.parameters.to_json()),
            });
            (t.name.clone(), v)
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let v = Value::Array(entries.into_iter().map(|(_, v)| v).collect());
    let serialized = serde_json::to_vec(&v).unwrap_or_default();
    hex::encode(sha2::Sha256::digest(&serialized))
}

fn canonicalize_json(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                if let Some(val) = map.get(&k) {
                    out.insert(k, canonicalize_json(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}
