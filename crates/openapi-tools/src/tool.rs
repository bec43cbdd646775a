//! Tool model: the public descriptor plus the private HTTP binding.

use crate::schema::SchemaShape;
use oamcp_http_tools::encoding::QuerySerialization;
use reqwest::Method;
use serde::de::Error as _;
use serde::ser::SerializeMap as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::sync::Arc;

/// A callable tool derived from one `OpenAPI` operation.
///
/// Serializes to `{name, description, parameters}`; the binding never leaves the process.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
    #[serde(skip)]
    pub binding: Arc<OperationBinding>,
}

impl Tool {
    #[must_use]
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// The client-visible part of a [`Tool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: ParameterSchema,
}

/// `{type: "object", properties, required}` with properties in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSchema {
    pub properties: Vec<(String, SchemaShape)>,
    pub required: Vec<String>,
}

impl ParameterSchema {
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&SchemaShape> {
        self.properties
            .iter()
            .find_map(|(k, v)| (k == name).then_some(v))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }
}

impl Serialize for ParameterSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Properties<'a>(&'a [(String, SchemaShape)]);

        impl Serialize for Properties<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for (k, v) in self.0 {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }

        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("type", "object")?;
        map.serialize_entry("properties", &Properties(&self.properties))?;
        map.serialize_entry("required", &self.required)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParameterSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "type", default)]
            kind: Option<String>,
            #[serde(default)]
            properties: Map<String, Value>,
            #[serde(default)]
            required: Vec<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        if let Some(kind) = raw.kind.as_deref()
            && kind != "object"
        {
            return Err(D::Error::custom(format!(
                "parameter schema must have type \"object\", got \"{kind}\""
            )));
        }
        Ok(Self {
            properties: raw
                .properties
                .into_iter()
                .map(|(k, v)| (k, SchemaShape::from(v)))
                .collect(),
            required: raw.required,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
    Body,
}

impl ParamLocation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ParamLocation::Path => "path",
            ParamLocation::Query => "query",
            ParamLocation::Header => "header",
            ParamLocation::Cookie => "cookie",
            ParamLocation::Body => "body",
        }
    }
}

/// Where one tool parameter goes in the outbound request.
#[derive(Debug, Clone)]
pub struct ParamBinding {
    pub name: String,
    pub location: ParamLocation,
    /// Set for query parameters only.
    pub query: Option<QuerySerialization>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEncoding {
    /// Body-located parameters are assembled into one JSON object.
    JsonFields,
    /// The single `body` parameter is sent as the JSON payload.
    JsonValue,
    /// The single `body` parameter is sent as-is with this media type.
    Raw { media_type: String },
}

/// The HTTP operation a tool performs.
#[derive(Debug, Clone)]
pub struct OperationBinding {
    pub method: Method,
    pub path_template: String,
    pub base_url: Arc<str>,
    pub params: Vec<ParamBinding>,
    pub body: Option<BodyEncoding>,
}

impl OperationBinding {
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&ParamBinding> {
        self.params.iter().find(|p| p.name == name)
    }
}
