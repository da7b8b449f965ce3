//! Layered configuration for the watch service.
//!
//! Values resolve in order: built-in defaults, then `pathwatch.toml`, then
//! environment variables. Environment variables are prefixed with
//! `PATHWATCH_` and use double underscores for nesting:
//! - `PATHWATCH_BACKEND=null` sets `backend`
//! - `PATHWATCH_BATCH_WINDOW_MS=250` sets `batch_window_ms`
//! - `PATHWATCH_LOGGING__DEFAULT=debug` sets `logging.default`

use std::collections::HashMap;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Which backend implementation native watchers are built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The platform's recommended OS watcher.
    #[default]
    Notify,
    /// Inert backend; watch plumbing without OS subscriptions.
    Null,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub backend: BackendKind,

    /// How long a backend batches raw events before delivering them.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Capacity of per-watcher broadcast channels. A consumer that falls
    /// further behind than this loses batches.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default log level filter.
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides, e.g. `tree = "debug"`.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_batch_window_ms() -> u64 {
    100
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            batch_window_ms: default_batch_window_ms(),
            channel_capacity: default_channel_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from `pathwatch.toml` (if present) and the
    /// environment, on top of defaults.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file("pathwatch.toml"))
            .merge(Env::prefixed("PATHWATCH_").split("__"))
            .extract()
    }
}
