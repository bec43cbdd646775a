//! Outbound HTTP plumbing shared by the `OpenAPI` dispatcher and the bridge server.
//!
//! It intentionally knows nothing about `OpenAPI` documents or MCP framing:
//! - [`oauth`]: OAuth2 client-credentials token acquisition with single-flight refresh
//! - [`encoding`]: path/query percent-encoding and query-style serialization
//! - [`safety`]: response size limits, body decoding and error redaction

pub mod encoding;
pub mod oauth;
pub mod safety;
