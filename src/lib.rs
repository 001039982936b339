//! # Runway - remote execution over SSH behind an HTTP API
//!
//! Runway accepts a host list, a credential and either one module call or
//! a playbook, runs the work over SSH with bounded parallelism, and returns
//! per-host outcomes. Jobs run inline or on a background pool. A separate
//! dynamic inventory pulls group membership from a directory service and
//! serves it from a time-bounded on-disk cache.
//!
//! ## Architecture Overview
//!
//! ```text
//!   HTTP request (api)
//!          │
//!          ▼
//!   Orchestrator (service) ──► CredentialStore ──► key file guard
//!          │                 └► JobInventory    ──► transient inventory guard
//!          │
//!          ├── sync ──► AdHocRunner / PlaybookRunner ──► ExecutionBackend (ssh)
//!          └── async ─► JobSubmitter ──► same runners ──► AuditSink
//!
//!   DynamicInventory (inventory::cache) ◄── DirectoryClient (HTTP)
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use runway::config::Config;
//! use runway::service::{Orchestrator, RunRequest};
//!
//! let config = Config::load(None)?;
//! let orchestrator = Orchestrator::from_config(&config)?;
//! let reply = orchestrator.run(request).await?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod credential;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod jobs;
pub mod logging;
pub mod service;

#[cfg(feature = "api")]
pub mod api;

pub use error::{Error, Result};

/// Returns the current version of Runway.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
