//! toolgate - a code-mode gateway for MCP tool servers.
//!
//! Multiplexes many upstream tool servers behind a constant two-operation
//! surface: the model submits short code snippets to `search` (discovery
//! against the local catalog) and `execute` (proxied tool invocation).
//! Upstream tool schemas never reach the model's prompt.
//!
//! # Architecture
//!
//! ```text
//!                      ┌───────────────────────────┐
//!        model ──────► │  search / execute tools   │
//!                      └──────────┬────────────────┘
//!                                 ▼
//!                      ┌───────────────────────────┐
//!                      │      Sandbox Runtime      │  V8 isolate, op bridge
//!                      └─────┬───────────────┬─────┘
//!                 discovery  │               │  invocation
//!                            ▼               ▼
//!                  ┌───────────────┐  ┌─────────────┐
//!                  │ Catalog Store │◄─┤  Tool Proxy │  allow-list, validation
//!                  └───────▲───────┘  └──────┬──────┘
//!                          │ writes          │
//!                  ┌───────┴───────┐         ▼
//!                  │ Sync Service  │  ┌──────────────────┐
//!                  └───────┬───────┘  │ Upstream Manager │  health, retry
//!                          └─────────►└──────┬───────────┘
//!                                            ▼
//!                                 HTTP / stdio upstreams
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod gateway;
pub mod proxy;
pub mod sandbox;
pub mod server;
pub mod sync;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::{Error, Result};
