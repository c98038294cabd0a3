//! MCP Bridge
//!
//! Aggregate stdio-based MCP tool servers behind a REST surface and a streamable HTTP MCP surface.

pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod jsonrpc;
pub mod openapi;
pub mod registry;
pub mod rest;
pub mod router;
pub mod rpc;
pub mod secrets;
pub mod session;
pub mod streamable;
pub mod supervisor;
pub mod timeouts;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
