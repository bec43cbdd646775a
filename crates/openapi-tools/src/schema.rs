//! Parameter schema fragments.
//!
//! Tool parameters carry a small JSON Schema subset. Fragments the subset cannot express
//! losslessly are kept verbatim as [`SchemaShape::Opaque`]; the only edit ever made to an opaque
//! fragment is dropping a `type` this crate does not recognize.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const KNOWN_TYPES: &[&str] = &["string", "integer", "number", "boolean", "object", "array", "null"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    String,
    Integer,
    Number,
    Boolean,
}

impl PrimitiveType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PrimitiveType::String => "string",
            PrimitiveType::Integer => "integer",
            PrimitiveType::Number => "number",
            PrimitiveType::Boolean => "boolean",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(PrimitiveType::String),
            "integer" => Some(PrimitiveType::Integer),
            "number" => Some(PrimitiveType::Number),
            "boolean" => Some(PrimitiveType::Boolean),
            _ => None,
        }
    }
}

/// A schema fragment attached to one tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum SchemaShape {
    Primitive {
        kind: PrimitiveType,
        format: Option<String>,
        description: Option<String>,
    },
    Enum {
        kind: Option<PrimitiveType>,
        values: Vec<Value>,
        format: Option<String>,
        description: Option<String>,
    },
    Object {
        properties: Vec<(String, SchemaShape)>,
        required: Vec<String>,
        description: Option<String>,
    },
    Array {
        items: Option<Box<SchemaShape>>,
        description: Option<String>,
    },
    Opaque(Value),
}

impl SchemaShape {
    #[must_use]
    pub fn string() -> Self {
        SchemaShape::Primitive {
            kind: PrimitiveType::String,
            format: None,
            description: None,
        }
    }

    /// Classify a JSON schema fragment.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        let Value::Object(map) = value else {
            return SchemaShape::Opaque(value.clone());
        };

        let type_name = map.get("type").and_then(Value::as_str);
        let description = string_field(map, "description");
        let format = string_field(map, "format");

        if let Some(values) = map.get("enum").and_then(Value::as_array) {
            let kind = type_name.and_then(PrimitiveType::parse);
            if only_keys(map, &["type", "enum", "format", "description"])
                && (type_name.is_none() || kind.is_some())
            {
                return SchemaShape::Enum {
                    kind,
                    values: values.clone(),
                    format,
                    description,
                };
            }
            return opaque(map);
        }

        match type_name {
            Some(t) if PrimitiveType::parse(t).is_some() => {
                if only_keys(map, &["type", "format", "description"]) {
                    if let Some(kind) = PrimitiveType::parse(t) {
                        return SchemaShape::Primitive {
                            kind,
                            format,
                            description,
                        };
                    }
                }
                opaque(map)
            }
            Some("object") if only_keys(map, &["type", "properties", "required", "description"]) => {
                let properties = map
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| {
                        props
                            .iter()
                            .map(|(k, v)| (k.clone(), SchemaShape::from_json(v)))
                            .collect()
                    })
                    .unwrap_or_default();
                let required = map
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|r| {
                        r.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                SchemaShape::Object {
                    properties,
                    required,
                    description,
                }
            }
            Some("array") if only_keys(map, &["type", "items", "description"]) => {
                SchemaShape::Array {
                    items: map
                        .get("items")
                        .map(|i| Box::new(SchemaShape::from_json(i))),
                    description,
                }
            }
            _ => opaque(map),
        }
    }

    /// Render back to a JSON schema fragment.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        match self {
            SchemaShape::Primitive {
                kind,
                format,
                description,
            } => {
                out.insert("type".into(), Value::String(kind.as_str().into()));
                insert_opt(&mut out, "format", format.as_deref());
                insert_opt(&mut out, "description", description.as_deref());
            }
            SchemaShape::Enum {
                kind,
                values,
                format,
                description,
            } => {
                if let Some(kind) = kind {
                    out.insert("type".into(), Value::String(kind.as_str().into()));
                }
                out.insert("enum".into(), Value::Array(values.clone()));
                insert_opt(&mut out, "format", format.as_deref());
                insert_opt(&mut out, "description", description.as_deref());
            }
            SchemaShape::Object {
                properties,
                required,
                description,
            } => {
                out.insert("type".into(), Value::String("object".into()));
                if !properties.is_empty() {
                    let props: Map<String, Value> = properties
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect();
                    out.insert("properties".into(), Value::Object(props));
                }
                if !required.is_empty() {
                    out.insert(
                        "required".into(),
                        Value::Array(required.iter().cloned().map(Value::String).collect()),
                    );
                }
                insert_opt(&mut out, "description", description.as_deref());
            }
            SchemaShape::Array { items, description } => {
                out.insert("type".into(), Value::String("array".into()));
                if let Some(items) = items {
                    out.insert("items".into(), items.to_json());
                }
                insert_opt(&mut out, "description", description.as_deref());
            }
            SchemaShape::Opaque(v) => return v.clone(),
        }
        Value::Object(out)
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        match self {
            SchemaShape::Primitive { description, .. }
            | SchemaShape::Enum { description, .. }
            | SchemaShape::Object { description, .. }
            | SchemaShape::Array { description, .. } => description.as_deref(),
            SchemaShape::Opaque(v) => v.get("description").and_then(Value::as_str),
        }
    }

    /// Attach a description unless the fragment already has one.
    #[must_use]
    pub fn with_fallback_description(self, fallback: Option<&str>) -> Self {
        let Some(text) = fallback else {
            return self;
        };
        if self.description().is_some() {
            return self;
        }
        let text = Some(text.to_string());
        match self {
            SchemaShape::Primitive { kind, format, .. } => SchemaShape::Primitive {
                kind,
                format,
                description: text,
            },
            SchemaShape::Enum {
                kind,
                values,
                format,
                ..
            } => SchemaShape::Enum {
                kind,
                values,
                format,
                description: text,
            },
            SchemaShape::Object {
                properties,
                required,
                ..
            } => SchemaShape::Object {
                properties,
                required,
                description: text,
            },
            SchemaShape::Array { items, .. } => SchemaShape::Array {
                items,
                description: text,
            },
            SchemaShape::Opaque(Value::Object(mut map)) => {
                if let Some(text) = text {
                    map.insert("description".into(), Value::String(text));
                }
                SchemaShape::Opaque(Value::Object(map))
            }
            other @ SchemaShape::Opaque(_) => other,
        }
    }
}

impl From<Value> for SchemaShape {
    fn from(value: Value) -> Self {
        SchemaShape::from_json(&value)
    }
}

impl From<SchemaShape> for Value {
    fn from(shape: SchemaShape) -> Self {
        shape.to_json()
    }
}

fn opaque(map: &Map<String, Value>) -> SchemaShape {
    let mut map = map.clone();
    // Type lists (`[string, "null"]`) count as unrecognized too.
    let unknown_type = map
        .get("type")
        .is_some_and(|t| t.as_str().is_none_or(|t| !KNOWN_TYPES.contains(&t)));
    if unknown_type {
        map.remove("type");
    }
    SchemaShape::Opaque(Value::Object(map))
}

fn only_keys(map: &Map<String, Value>, allowed: &[&str]) -> bool {
    map.keys().all(|k| allowed.contains(&k.as_str()))
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        map.insert(key.to_string(), Value::String(v.to_string()));
    }
}
