//! labvisor: ephemeral per-user training labs.
//!
//! A lab is a time-bounded set of VMs, each backed by a runtime unit and
//! reachable through a per-lab VPN endpoint. This crate provisions labs,
//! tears them down on request, on expiration, or under host pressure, and
//! keeps concurrent operations on the same lab from interleaving.
//!
//! # Layout
//!
//! - [`db`]: durable lab and VM records with guarded status updates
//! - [`orchestrator`]: provisioning and teardown workflows
//! - [`monitor`]: the periodic overload and expiry loop
//! - [`service`]: caller-facing operations with permission checks
//! - [`api`]: HTTP surface over [`service`]

pub mod allocator;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod lab;
pub mod locks;
pub mod monitor;
pub mod orchestrator;
pub mod probe;
pub mod runtime;
pub mod service;
pub mod util;
pub mod validation;
pub mod vpn;

#[cfg(test)]
pub mod testing;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
