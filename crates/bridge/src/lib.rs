//! OpenAPI -> MCP bridge.
//!
//! Serves the tools extracted from one or more `OpenAPI` documents over a small HTTP surface:
//! `GET /mcp`, `GET /mcp/tools`, `POST /mcp/run` and `GET /mcp/sse`.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod events;
pub mod server;
pub mod telemetry;
