//! Echoes - a TLS terminating reverse proxy with per virtual host load balancing.
//!
//! Echoes terminates TLS for a set of virtual hosts, picks a backend upstream
//! for every request with the load balancing strategy configured for the
//! matched virtual host, forwards the request and streams the response back.
//! Finished requests are recorded by an access log running off the response
//! path.
//!
//! # Features
//! - Virtual host resolution by exact server name, with a regex fallback
//! - Round robin, smooth weighted round robin and hash based upstream selection
//! - Per-request pipeline with pluggable rewrite and response filter stages
//! - Hop-by-hop header stripping and bounded-buffer body streaming
//! - SNI based certificate selection, HTTP/2 via ALPN
//! - Client disconnects cancel the in-flight backend call
//! - Structured tracing via `tracing`, metrics via the `metrics` facade
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use echoes::{
//!     GatewayService, HttpClientAdapter, HttpClient, Pipeline,
//!     config::load_config,
//!     ports::access_log::NullAccessLog,
//! };
//!
//! # fn main() -> eyre::Result<()> {
//! let config = Arc::new(load_config("resources/echoes.yaml")?);
//! let gateway = GatewayService::new(config, |vhost| {
//!     Ok(Arc::new(HttpClientAdapter::for_vhost(vhost)?) as Arc<dyn HttpClient>)
//! })?;
//! let pipeline = Pipeline::new(Arc::new(gateway), Arc::new(NullAccessLog));
//! // Wire `pipeline` into an `HttpHandler` and serve its router (see the binary)
//! # let _ = pipeline;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! request logic inside `core`, which never touches sockets directly.
//!
//! # Error Handling
//! Startup paths return `eyre::Result<T>` with `WrapErr` context. Per-request failures
//! are typed (`PipelineError`) and turned into JSON abort responses; they never escape
//! the request that caused them.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{CertificateStore, FileAccessLog, HttpClientAdapter, HttpHandler, HttpsRedirect},
    core::{GatewayService, Pipeline},
    ports::{access_log::AccessLog, http_client::HttpClient},
    utils::GracefulShutdown,
};
