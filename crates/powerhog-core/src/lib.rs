//! powerhog-core: shared library for the powerhog daemon and tools.
//!
//! Provides:
//! - `collector`: powermetrics stream reassembly, plist parsing, metric derivation
//! - `carbon`: grid carbon intensity lookup with a TTL cache
//! - `storage`: SQLite measurement log, settings history, rollup, schema migrations
//! - `upload`: batched delivery to the remote collector and the upload watchdog
//! - `supervisor`: liveness checks (data freshness, measurement process presence)
//! - `runtime`: shutdown token, sleep-aware tick, counters, exit statuses
//! - `config`: effective settings and settings file loading
//! - `util`: process table access and privilege checks

pub mod carbon;
pub mod collector;
pub mod config;
pub mod runtime;
pub mod storage;
pub mod supervisor;
pub mod upload;
pub mod util;

/// Version tag sent with every uploaded batch.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
