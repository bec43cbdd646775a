//! `OpenAPI` -> MCP tooling.
//!
//! Loads `OpenAPI` documents, turns their operations into [`tool::Tool`]s and executes those tools
//! against the described HTTP API. Nothing here knows about the MCP transport that exposes them.

pub mod dispatcher;
pub mod document;
pub mod error;
pub mod extractor;
pub mod resolver;
pub mod schema;
pub mod tool;
