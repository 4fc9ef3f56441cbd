//! Trellis - a layer-7 reverse proxy for a fleet of application instances.
//!
//! Trellis fronts a cloud platform's applications: it accepts HTTP/1.x (and
//! WebSocket / opaque-upgrade) traffic, resolves the request's host header
//! against an in-memory route registry fed by a control plane, picks one
//! backend endpoint respecting affinity and failure state, and streams the
//! response back.
//!
//! # Architecture
//! The routing plane is the core: [`core::RouteRegistry`] holds a prefix
//! trie of [`core::Pool`]s keyed by host + path, with wildcard-host
//! fallback. Pools implement failure-aware round-robin with optional
//! preferred-subnet preemption. A background pruner ages out endpoints the
//! control plane stops refreshing.
//!
//! Around it: the proxy engine ([`proxy::ProxyEngine`]) forwards requests
//! with retry-on-connect-failure, header rewriting, upgrade splicing and
//! route-service detours; ingestion adapters ([`adapters`]) feed the
//! registry from a pub/sub bus or the routing API; the access-log pipeline
//! ([`access_log`]) records every request without blocking the data path.
//!
//! # Quick example
//! ```no_run
//! use std::sync::Arc;
//!
//! use trellis::{config::RouterConfig, core::{Endpoint, RouteRegistry}};
//!
//! let settings = RouterConfig::default().process().unwrap();
//! let registry = Arc::new(RouteRegistry::new(&settings));
//! registry.register("app.example.com", Endpoint::new("10.0.1.7", 8080));
//! assert!(registry.lookup("app.example.com", "/").is_some());
//! ```
//!
//! # Error handling
//! Domain errors are `thiserror` enums; fallible application paths return
//! `eyre::Result` with context attached via `WrapErr`.
pub mod access_log;
pub mod adapters;
pub mod admin;
pub mod config;
pub mod core;
pub mod lifecycle;
pub mod metrics;
pub mod net;
pub mod proxy;
pub mod route_service;
pub mod tracing_setup;

pub use crate::{
    access_log::AccessLogger,
    config::{RouterConfig, RouterSettings},
    core::{Endpoint, ModificationTag, RouteRegistry},
    lifecycle::DrainSignal,
    net::ProxyServer,
    proxy::ProxyEngine,
};
