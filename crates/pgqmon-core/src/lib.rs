//! pgqmon-core — query monitoring for managed PostgreSQL instances.
//!
//! Provides:
//! - `normalize` — SQL text → canonical signature + stable hash
//! - `tunnel` — reference-counted SSH port forwards
//! - `connection` — direct or tunneled connections with guaranteed cleanup
//! - `pg` — statistics, activity and kill queries over a connection
//! - `collector` — upsert of polled statistics into signature → instance rows
//! - `store` — persistence backends (in-memory, PostgreSQL)
//! - `monitor` — polling sessions and continuous kill loops
//! - `registry` — instance/database lookup
//! - `service` — the read/write API consumed by the dashboard

pub mod collector;
pub mod connection;
pub mod error;
pub mod model;
pub mod monitor;
pub mod normalize;
pub mod pg;
pub mod registry;
pub mod service;
pub mod settings;
pub mod store;
pub mod tunnel;

pub use error::{KillError, MonitorError};
pub use service::QueryMonitor;
pub use settings::MonitorSettings;

/// Crate version, reported by the web binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
