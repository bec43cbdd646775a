//! Error types for `oamcp-openapi-tools`.

use thiserror::Error;

/// Errors raised while loading documents or resolving references.
///
/// Per-operation conversion failures are not errors of this type; they are collected as
/// [`crate::extractor::ExtractionError`]s so the rest of the catalog survives.
#[derive(Error, Debug)]
pub enum OpenApiToolsError {
    /// `OpenAPI` errors (document shape, references).
    #[error("OpenAPI error: {0}")]
    OpenApi(String),

    #[error("OpenAPI error: failed to fetch spec from '{url}': {message}")]
    OpenApiSpecFetch { url: String, message: String },

    #[error("OpenAPI error: failed to read spec body from '{url}': {message}")]
    OpenApiSpecReadBody { url: String, message: String },

    #[error("OpenAPI error: failed to read spec file '{path}': {source}")]
    OpenApiSpecReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("OpenAPI error: failed to parse OpenAPI spec from '{location}': {source}")]
    OpenApiSpecParse {
        location: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// No usable base URL for outbound calls.
    #[error("Base URL error: {0}")]
    BaseUrl(String),
}

/// Result type alias for `OpenAPI` tooling operations.
pub type Result<T> = std::result::Result<T, OpenApiToolsError>;
