//! Percent-encoding and query serialization for outbound requests.
//!
//! Query parameters follow the `OpenAPI` `style`/`explode` rules for arrays and objects.
//! Path segments are encoded strictly (everything outside the RFC 3986 unreserved set), so a
//! value can never introduce extra path segments.

use openapiv3::QueryStyle;
use serde_json::Value;

/// How a single query parameter is serialized.
#[derive(Debug, Clone)]
pub struct QuerySerialization {
    pub style: QueryStyle,
    pub explode: bool,
    pub allow_reserved: bool,
}

impl Default for QuerySerialization {
    fn default() -> Self {
        Self {
            style: QueryStyle::Form,
            explode: true,
            allow_reserved: false,
        }
    }
}

impl QuerySerialization {
    /// Build from an `OpenAPI` query parameter declaration, applying the spec defaults for
    /// `explode` when it is not declared.
    #[must_use]
    pub fn from_declaration(style: QueryStyle, explode: Option<bool>, allow_reserved: bool) -> Self {
        let explode = explode.unwrap_or(matches!(style, QueryStyle::Form | QueryStyle::DeepObject));
        Self {
            style,
            explode,
            allow_reserved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPair {
    pub key: String,
    pub value: String,
    pub allow_reserved: bool,
}

impl QueryPair {
    fn new(key: impl Into<String>, value: impl Into<String>, allow_reserved: bool) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            allow_reserved,
        }
    }
}

/// Serialize one query parameter into zero or more `key=value` pairs.
///
/// `null`, empty strings, arrays and objects produce no pairs.
#[must_use]
pub fn serialize_query_param(name: &str, value: &Value, ser: &QuerySerialization) -> Vec<QueryPair> {
    let reserved = ser.allow_reserved;
    match value {
        Value::Null => Vec::new(),
        Value::String(s) if s.is_empty() => Vec::new(),
        Value::Array(items) if items.is_empty() => Vec::new(),
        Value::Object(map) if map.is_empty() => Vec::new(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(value_to_string).collect();
            let joined = |sep: &str| vec![QueryPair::new(name, items.join(sep), reserved)];
            match ser.style {
                QueryStyle::Form if ser.explode => items
                    .iter()
                    .map(|v| QueryPair::new(name, v.as_str(), reserved))
                    .collect(),
                QueryStyle::SpaceDelimited => joined(" "),
                QueryStyle::PipeDelimited => joined("|"),
                QueryStyle::Form | QueryStyle::DeepObject => joined(","),
            }
        }
        Value::Object(map) => match ser.style {
            QueryStyle::DeepObject => map
                .iter()
                .map(|(k, v)| QueryPair::new(format!("{name}[{k}]"), value_to_string(v), reserved))
                .collect(),
            QueryStyle::Form if ser.explode => map
                .iter()
                .map(|(k, v)| QueryPair::new(k.as_str(), value_to_string(v), reserved))
                .collect(),
            QueryStyle::Form => {
                let flat: Vec<String> = map
                    .iter()
                    .flat_map(|(k, v)| [k.clone(), value_to_string(v)])
                    .collect();
                vec![QueryPair::new(name, flat.join(","), reserved)]
            }
            QueryStyle::SpaceDelimited | QueryStyle::PipeDelimited => {
                vec![QueryPair::new(name, Value::Object(map.clone()).to_string(), reserved)]
            }
        },
        scalar => vec![QueryPair::new(name, value_to_string(scalar), reserved)],
    }
}

/// Join pairs into an encoded query string (without the leading `?`).
#[must_use]
pub fn encode_query_pairs(pairs: &[QueryPair]) -> String {
    pairs
        .iter()
        .map(|p| {
            format!(
                "{}={}",
                encode_component(&p.key, false),
                encode_component(&p.value, p.allow_reserved)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-encode a value for substitution into a path template.
#[must_use]
pub fn encode_path_segment(value: &str) -> String {
    encode_component(value, false)
}

/// Percent-encode everything outside the unreserved set. With `allow_reserved`, reserved
/// characters that cannot break `&`/`=` pair framing are kept as-is.
#[must_use]
pub fn encode_component(s: &str, allow_reserved: bool) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) || (allow_reserved && is_pair_safe_reserved(b)) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[usize::from(b >> 4)] as char);
            out.push(HEX[usize::from(b & 0x0F)] as char);
        }
    }
    out
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn is_pair_safe_reserved(b: u8) -> bool {
    // `&`, `=` and `#` stay encoded.
    matches!(
        b,
        b':' | b'/' | b'?' | b'[' | b']' | b'@' | b'!' | b'$' | b'\'' | b'(' | b')' | b'*' | b'+'
            | b',' | b';'
    )
}

/// Render a JSON value for use in a path, query, header or cookie.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_to_string_renders_scalars_plainly() {
        assert_eq!(value_to_string(&json!("hello")), "hello");
        assert_eq!(value_to_string(&json!(5)), "5");
        assert_eq!(value_to_string(&json!(false)), "false");
        assert_eq!(value_to_string(&json!(null)), "");
        assert_eq!(value_to_string(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn path_segments_encode_slashes_and_spaces() {
        assert_eq!(encode_path_segment("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_path_segment("plain-id_1.2~"), "plain-id_1.2~");
    }

    #[test]
    fn form_arrays_respect_explode() {
        let exploded = serialize_query_param("tags", &json!(["a", "b"]), &QuerySerialization::default());
        assert_eq!(
            exploded,
            vec![QueryPair::new("tags", "a", false), QueryPair::new("tags", "b", false)]
        );

        let packed = serialize_query_param(
            "tags",
            &json!(["a", "b"]),
            &QuerySerialization::from_declaration(QueryStyle::Form, Some(false), false),
        );
        assert_eq!(packed, vec![QueryPair::new("tags", "a,b", false)]);
    }

    #[test]
    fn deep_object_uses_bracketed_keys() {
        let pairs = serialize_query_param(
            "filter",
            &json!({"name": "x"}),
            &QuerySerialization::from_declaration(QueryStyle::DeepObject, None, false),
        );
        assert_eq!(pairs, vec![QueryPair::new("filter[name]", "x", false)]);
    }

    #[test]
    fn empty_values_are_omitted() {
        let ser = QuerySerialization::default();
        assert!(serialize_query_param("q", &json!(""), &ser).is_empty());
        assert!(serialize_query_param("q", &json!(null), &ser).is_empty());
        assert!(serialize_query_param("q", &json!([]), &ser).is_empty());
    }

    #[test]
    fn query_string_keeps_separators_encoded_even_when_reserved_allowed() {
        let pairs = vec![
            QueryPair::new("limit", "5", false),
            QueryPair::new("path", "a/b&c=d", true),
        ];
        assert_eq!(encode_query_pairs(&pairs), "limit=5&path=a/b%26c%3Dd");
    }
}
