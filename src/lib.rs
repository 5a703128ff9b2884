//! Gatehouse is a hot-reconfigurable HTTP reverse-proxy gateway.
//!
//! It accepts HTTP and HTTPS connections on configured entry points, runs
//! every request through a middleware chain (path and host rewriting, rate
//! limiting, retries, forwarded-header trust) and forwards it to a backend
//! over pooled, named transports. Configuration can be swapped at runtime
//! without rebinding listeners, and shutdown drains in-flight requests.
//!
//! # Architecture
//!
//! - [`cli`] -- Command-line argument parsing with clap derive macros.
//! - [`cmd`] -- Subcommand dispatch and execution (run, validate), including
//!   the config refresh loop.
//! - [`config`] -- Configuration model, duration parsing, validation and
//!   file sources with change detection.
//! - [`entrypoint`] -- Listeners with TLS/plaintext demultiplexing,
//!   connection tracking and graceful drain.
//! - [`error`] -- Unified error types using `thiserror`.
//! - [`logging`] -- Structured tracing setup with JSON and pretty-print output.
//! - [`middleware`] -- The handler contract, the chain builder, the
//!   hot-swappable switcher and every middleware unit.
//! - [`proxy`] -- The terminal reverse-proxy handler and its error mapping.
//! - [`server`] -- Server orchestration, background tasks and signal handling.
//! - [`tls`] -- PEM material and server certificate providers.
//! - [`transport`] -- Backend round trippers and their manager.
//!
//! # Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `yaml` | YAML config file support _(enabled by default)_ |
//! | `json` | JSON config file support |
//! | `toml` | TOML config file support |
//! | `file-backends` | All file formats |

// Binary crate: public functions are internal, not consumed by external users.
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod cmd;
pub mod config;
pub mod entrypoint;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod proxy;
pub mod server;
pub mod tls;
pub mod transport;
