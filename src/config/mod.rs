//! Stream Configuration Module
//!
//! Provides the processor configuration loaded from TOML, covering window
//! retention, drought/flood rules, operational thresholds, heartbeat
//! timeouts, enrichment policy, notifications, storage and the HTTP server.
//!
//! ## Loading Order
//!
//! 1. `--config <path>` on the command line
//! 2. `AGRISTREAM_CONFIG` environment variable (path to TOML file)
//! 3. `agristream.toml` in the current working directory
//! 4. Built-in defaults
//!
//! ## Usage
//!
//! The binary calls `config::init()` once at startup; the HTTP layer reads it
//! back with `config::get()`. Pipeline components never touch the global and
//! take their section of [`StreamConfig`] explicitly.

mod stream_config;
pub mod defaults;
pub mod validation;

pub use stream_config::*;

use std::sync::OnceLock;

static STREAM_CONFIG: OnceLock<StreamConfig> = OnceLock::new();

/// Initialize the global configuration. Later calls are ignored.
pub fn init(config: StreamConfig) {
    if STREAM_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get the global configuration, or `None` before `init()`.
pub fn get() -> Option<&'static StreamConfig> {
    STREAM_CONFIG.get()
}

pub fn is_initialized() -> bool {
    STREAM_CONFIG.get().is_some()
}
