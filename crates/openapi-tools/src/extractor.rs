//! `OpenAPI` operation → [`Tool`] extraction.
//!
//! Operations are visited in a fixed order (paths in declaration order, then methods in
//! [`METHOD_ORDER`]) so the same documents always produce the same catalog. Each operation is
//! converted independently; one that cannot be converted is skipped and reported as an
//! [`ExtractionError`] while the rest of the catalog is still produced.

use crate::document::OpenApiDocument;
use crate::resolver::{DocId, OpenApiResolver};
use crate::schema::SchemaShape;
use crate::tool::{BodyEncoding, OperationBinding, ParamBinding, ParamLocation, ParameterSchema, Tool};
use oamcp_http_tools::encoding::QuerySerialization;
use oamcp_http_tools::safety::is_json_content_type;
use openapiv3::Parameter;
use regex::Regex;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

/// HTTP methods in the order they are visited within a path item.
pub const METHOD_ORDER: [&str; 8] = ["get", "put", "post", "delete", "options", "head", "patch", "trace"];

static PATH_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}/]+)\}").expect("valid path variable regex"));

/// An operation that was skipped during extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionError {
    pub location: String,
    pub method: String,
    pub path: String,
    pub message: String,
}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} in '{}': {}",
            self.method.to_uppercase(),
            self.path,
            self.location,
            self.message
        )
    }
}

impl std::error::Error for ExtractionError {}

/// Result of one extraction pass.
#[derive(Debug, Default)]
pub struct Extraction {
    pub tools: Vec<Tool>,
    pub errors: Vec<ExtractionError>,
}

/// Tool names handed out so far. Shared across documents so names stay unique per catalog.
#[derive(Debug, Default)]
pub struct NameReservations {
    taken: HashSet<String>,
}

impl NameReservations {
    /// Reserve `base`, or the first free `base_N` (N ≥ 1) if `base` is taken.
    pub fn reserve(&mut self, base: &str) -> String {
        if self.taken.insert(base.to_string()) {
            return base.to_string();
        }

        let mut counter = 1_u32;
        loop {
            let candidate = format!("{base}_{counter}");
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            counter += 1;
        }
    }
}

/// Extract the tools of a single document.
pub async fn extract_tools(client: &Client, doc: &OpenApiDocument) -> Extraction {
    let mut names = NameReservations::default();
    let mut out = Extraction::default();
    extract_into(client, doc, &mut names, &mut out).await;
    out
}

/// Extract the tools of several documents into one catalog with globally unique names.
pub async fn extract_catalog(client: &Client, docs: &[OpenApiDocument]) -> Extraction {
    let mut names = NameReservations::default();
    let mut out = Extraction::default();
    for doc in docs {
        extract_into(client, doc, &mut names, &mut out).await;
    }
    out
}

async fn extract_into(
    client: &Client,
    doc: &OpenApiDocument,
    names: &mut NameReservations,
    out: &mut Extraction,
) {
    let resolver = OpenApiResolver::new(doc.doc_id().clone(), Arc::clone(doc.root()), client);
    let before = out.tools.len();

    for (path, raw_item) in doc.paths() {
        let fail = |errors: &mut Vec<ExtractionError>, method: &str, message: String| {
            let err = ExtractionError {
                location: doc.location().to_string(),
                method: method.to_string(),
                path: path.to_string(),
                message,
            };
            tracing::warn!(error = %err, "skipping operation");
            errors.push(err);
        };

        let (item_doc, item) = match resolver.resolve_value(resolver.root_doc(), raw_item).await {
            Ok(v) => v,
            Err(e) => {
                fail(&mut out.errors, "*", e.to_string());
                continue;
            }
        };
        let Value::Object(item) = item else {
            fail(&mut out.errors, "*", "path item is not a mapping".to_string());
            continue;
        };

        let present: Vec<&str> = METHOD_ORDER
            .into_iter()
            .filter(|m| item.contains_key(*m))
            .collect();

        let path_params = match item.get("parameters") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(params)) => params.clone(),
            Some(_) => {
                for method in &present {
                    fail(&mut out.errors, *method, "path-level 'parameters' is not a list".to_string());
                }
                continue;
            }
        };

        for method in present {
            let input = OperationInput {
                doc,
                item_doc: &item_doc,
                path,
                method,
                path_params: &path_params,
                raw: &item[method],
            };
            match convert_operation(&resolver, input).await {
                Ok(draft) => {
                    let name = names.reserve(&draft.base_name);
                    if name != draft.base_name {
                        tracing::debug!(tool = %name, base = %draft.base_name, "renamed colliding tool");
                    }
                    out.tools.push(draft.into_tool(name));
                }
                Err(message) => fail(&mut out.errors, method, message),
            }
        }
    }

    tracing::info!(
        spec = %doc.location(),
        tools = out.tools.len() - before,
        "extracted tools from OpenAPI document"
    );
}

struct OperationInput<'a> {
    doc: &'a OpenApiDocument,
    item_doc: &'a DocId,
    path: &'a str,
    method: &'a str,
    path_params: &'a [Value],
    raw: &'a Value,
}

struct ToolDraft {
    base_name: String,
    description: String,
    parameters: ParameterSchema,
    binding: OperationBinding,
}

impl ToolDraft {
    fn into_tool(self, name: String) -> Tool {
        Tool {
            name,
            description: self.description,
            parameters: self.parameters,
            binding: Arc::new(self.binding),
        }
    }
}

#[derive(Default)]
struct ParamsBuilder {
    schema: ParameterSchema,
    bindings: Vec<ParamBinding>,
}

impl ParamsBuilder {
    fn push(
        &mut self,
        name: &str,
        location: ParamLocation,
        required: bool,
        shape: SchemaShape,
        query: Option<QuerySerialization>,
    ) -> Result<(), String> {
        if let Some(existing) = self.bindings.iter().find(|b| b.name == name) {
            return Err(format!(
                "parameter name '{name}' is used by both a {} and a {} parameter",
                existing.location.as_str(),
                location.as_str()
            ));
        }
        self.schema.properties.push((name.to_string(), shape));
        if required {
            self.schema.required.push(name.to_string());
        }
        self.bindings.push(ParamBinding {
            name: name.to_string(),
            location,
            query,
        });
        Ok(())
    }
}

async fn convert_operation(
    resolver: &OpenApiResolver<'_>,
    input: OperationInput<'_>,
) -> Result<ToolDraft, String> {
    let Value::Object(op) = input.raw else {
        return Err("operation is not a mapping".to_string());
    };

    let op_params = match op.get("parameters") {
        None | Some(Value::Null) => &[][..],
        Some(Value::Array(params)) => params.as_slice(),
        Some(_) => return Err("'parameters' is not a list".to_string()),
    };

    let merged = merge_parameters(resolver, input.item_doc, input.path_params, op_params).await?;

    let mut params = ParamsBuilder::default();
    for p in &merged {
        add_parameter(resolver, p, &mut params).await?;
    }

    for var in PATH_VARIABLE.captures_iter(input.path) {
        let var = &var[1];
        let declared = params
            .bindings
            .iter()
            .any(|b| b.location == ParamLocation::Path && b.name == var);
        if !declared {
            return Err(format!("path variable '{{{var}}}' has no path parameter"));
        }
    }

    let body = match op.get("requestBody") {
        None | Some(Value::Null) => None,
        Some(raw_body) => add_request_body(resolver, input.item_doc, raw_body, &mut params).await?,
    };

    let base_name = op
        .get("operationId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map_or_else(|| canonical_name(input.method, input.path), str::to_string);

    let method = Method::from_bytes(input.method.to_ascii_uppercase().as_bytes())
        .map_err(|e| format!("invalid method: {e}"))?;

    Ok(ToolDraft {
        base_name,
        description: tool_description(op, input.method, input.path),
        parameters: params.schema,
        binding: OperationBinding {
            method,
            path_template: input.path.to_string(),
            base_url: Arc::clone(input.doc.base_url()),
            params: params.bindings,
            body,
        },
    })
}

fn tool_description(op: &serde_json::Map<String, Value>, method: &str, path: &str) -> String {
    let text = |key: &str| {
        op.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };
    match (text("summary"), text("description")) {
        (Some(s), Some(d)) if s != d => format!("{s}\n\n{d}"),
        (Some(s), _) => s.to_string(),
        (None, Some(d)) => d.to_string(),
        (None, None) => format!("Calls {} {}", method.to_uppercase(), path),
    }
}

struct ResolvedParam {
    doc: DocId,
    raw: Value,
    typed: Parameter,
}

async fn merge_parameters(
    resolver: &OpenApiResolver<'_>,
    current_doc: &DocId,
    path_item_params: &[Value],
    operation_params: &[Value],
) -> Result<Vec<ResolvedParam>, String> {
    let mut merged: Vec<ResolvedParam> = Vec::new();
    let mut index: HashMap<(ParamLocation, String), usize> = HashMap::new();

    for raw in path_item_params.iter().chain(operation_params) {
        let (doc, raw) = resolver
            .resolve_value(current_doc, raw)
            .await
            .map_err(|e| e.to_string())?;
        let typed: Parameter = serde_json::from_value(parameter_header(&raw))
            .map_err(|e| format!("malformed parameter: {e}"))?;
        let key = (location_of(&typed), typed.parameter_data_ref().name.clone());
        let resolved = ResolvedParam { doc, raw, typed };
        if let Some(i) = index.get(&key).copied() {
            merged[i] = resolved;
        } else {
            index.insert(key, merged.len());
            merged.push(resolved);
        }
    }

    Ok(merged)
}

/// The parameter with its schema swapped for a plain string schema.
///
/// Only name, location and serialization are decoded through `openapiv3`; the schema itself is
/// read from the raw fragment so shapes the 3.0 model cannot hold (3.1 type lists) survive.
fn parameter_header(raw: &Value) -> Value {
    let mut header = raw.clone();
    if let Value::Object(map) = &mut header {
        map.remove("content");
        map.insert("schema".to_string(), serde_json::json!({"type": "string"}));
    }
    header
}

fn location_of(p: &Parameter) -> ParamLocation {
    match p {
        Parameter::Path { .. } => ParamLocation::Path,
        Parameter::Query { .. } => ParamLocation::Query,
        Parameter::Header { .. } => ParamLocation::Header,
        Parameter::Cookie { .. } => ParamLocation::Cookie,
    }
}

async fn add_parameter(
    resolver: &OpenApiResolver<'_>,
    p: &ResolvedParam,
    params: &mut ParamsBuilder,
) -> Result<(), String> {
    let data = p.typed.parameter_data_ref();
    let location = location_of(&p.typed);

    let required = match &p.typed {
        Parameter::Path { .. } => true,
        _ => data.required,
    };

    let query = match &p.typed {
        Parameter::Query {
            style,
            allow_reserved,
            ..
        } => Some(QuerySerialization::from_declaration(
            style.clone(),
            data.explode,
            *allow_reserved,
        )),
        _ => None,
    };

    let raw_schema = p.raw.get("schema").cloned().or_else(|| {
        p.raw
            .get("content")
            .and_then(Value::as_object)
            .and_then(|c| c.values().next())
            .and_then(|mt| mt.get("schema"))
            .cloned()
    });
    let shape = match raw_schema {
        Some(raw) => {
            let (_doc, schema) = resolver
                .resolve_value(&p.doc, &raw)
                .await
                .map_err(|e| format!("parameter '{}': {e}", data.name))?;
            SchemaShape::from_json(&schema)
        }
        None => SchemaShape::string(),
    };
    let shape = shape.with_fallback_description(data.description.as_deref());

    params.push(&data.name, location, required, shape, query)
}

async fn add_request_body(
    resolver: &OpenApiResolver<'_>,
    current_doc: &DocId,
    raw_body: &Value,
    params: &mut ParamsBuilder,
) -> Result<Option<BodyEncoding>, String> {
    let (body_doc, body) = resolver
        .resolve_value(current_doc, raw_body)
        .await
        .map_err(|e| format!("requestBody: {e}"))?;

    let body_required = body.get("required").and_then(Value::as_bool).unwrap_or(false);
    let description = body.get("description").and_then(Value::as_str);
    let Some(content) = body.get("content").and_then(Value::as_object) else {
        return Err("requestBody has no 'content'".to_string());
    };

    let json_media = content
        .get("application/json")
        .map(|mt| ("application/json", mt))
        .or_else(|| {
            content
                .iter()
                .find(|(k, _)| is_json_content_type(Some(k.as_str())))
                .map(|(k, v)| (k.as_str(), v))
        });

    let Some((_, media)) = json_media else {
        let Some((media_type, _)) = content.iter().next() else {
            return Ok(None);
        };
        let shape = SchemaShape::string().with_fallback_description(description);
        params.push("body", ParamLocation::Body, body_required, shape, None)?;
        return Ok(Some(BodyEncoding::Raw {
            media_type: media_type.clone(),
        }));
    };

    let schema = match media.get("schema") {
        Some(raw) => {
            resolver
                .resolve_value(&body_doc, raw)
                .await
                .map_err(|e| format!("requestBody schema: {e}"))?
        }
        None => (body_doc.clone(), Value::Object(serde_json::Map::new())),
    };
    let (schema_doc, schema) = schema;

    let properties = schema.get("properties").and_then(Value::as_object);
    let is_object = match schema.get("type").and_then(Value::as_str) {
        Some("object") => true,
        None => properties.is_some(),
        Some(_) => false,
    };

    if !is_object {
        let shape = SchemaShape::from_json(&schema).with_fallback_description(description);
        params.push("body", ParamLocation::Body, body_required, shape, None)?;
        return Ok(Some(BodyEncoding::JsonValue));
    }

    let required: HashSet<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    for (name, prop) in properties.into_iter().flatten() {
        // Nested refs are inlined when resolvable; otherwise the `$ref` stays visible.
        let prop = if prop.get("$ref").is_some() {
            match resolver.resolve_value(&schema_doc, prop).await {
                Ok((_doc, v)) => v,
                Err(e) => {
                    tracing::debug!(property = %name, error = %e, "keeping unresolved body property $ref");
                    prop.clone()
                }
            }
        } else {
            prop.clone()
        };
        params.push(
            name,
            ParamLocation::Body,
            required.contains(name.as_str()),
            SchemaShape::from_json(&prop),
            None,
        )?;
    }

    Ok(Some(BodyEncoding::JsonFields))
}

/// `GET /users/{id}` → `getUsersId`.
#[must_use]
pub fn canonical_name(method: &str, path: &str) -> String {
    let mut name = method.to_ascii_lowercase();
    for piece in path.split(|c: char| !c.is_ascii_alphanumeric()) {
        let mut chars = piece.chars();
        if let Some(first) = chars.next() {
            name.push(first.to_ascii_uppercase());
            name.extend(chars);
        }
    }
    name
}
