//! Kokoro MCP Common Library
//!
//! Shared configuration, error types, tracing setup and MCP server plumbing
//! for the Kokoro MCP servers.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod error;
pub mod server;
pub mod tracing;
pub mod transport;


pub use config::{AudioDelivery, Config};
pub use error::{ConfigError, EngineError, Error, Result, SessionError, StoreError};
pub use server::{McpServerBuilder, ServerError, shutdown_channel};
pub use transport::{Transport, TransportArgs, TransportMode};
