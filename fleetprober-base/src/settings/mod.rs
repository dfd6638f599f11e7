//! Settings and configuration for fleetprober agents
//!
//! All agents share the [`Settings`] struct in this crate and add their own
//! fields in their own crate's `settings.rs` (flattened over this one).
//!
//! Settings are read from an optional config file plus environment variables.
//! Environment variable names correspond 1:1 with the config file's JSON
//! object hierarchy, prefixed with either:
//!
//! * `FP_BASE` — shared by every agent in the environment, or
//! * `FP_<agentname>` — specific to one agent, e.g. `FP_PROBER`.
//!
//! later sources override earlier ones:
//!
//! 1. The config file `./config/$RUN_ENV/$BASE_CONFIG` (if `BASE_CONFIG` is
//!    set).
//! 2. The config file `./config/$RUN_ENV/<agent>-partial.json`.
//! 3. `FP_BASE_*` env vars.
//! 4. `FP_<agentname>_*` env vars.

use std::env;

use config::{Config, Environment, File};
use eyre::{Context, Result};
use serde::Deserialize;

mod trace;
pub use trace::*;

/// Load a settings object from the config locations.
///
/// Specify a configuration directory with the `RUN_ENV` env variable and a
/// base configuration file with the `BASE_CONFIG` env variable.
pub fn load_settings_object<'de, T: Deserialize<'de>>(agent_prefix: &str) -> Result<T> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| "default".into());
    let prefix = format!("FP_{agent_prefix}").to_ascii_uppercase();

    let mut builder = Config::builder();
    if let Ok(base_config) = env::var("BASE_CONFIG") {
        builder = builder.add_source(File::with_name(&format!("./config/{run_env}/{base_config}")));
    }
    let config_deserializer = builder
        .add_source(
            File::with_name(&format!(
                "./config/{}/{}-partial",
                run_env,
                agent_prefix.to_lowercase()
            ))
            .required(false),
        )
        .add_source(Environment::with_prefix("FP_BASE").separator("_"))
        .add_source(Environment::with_prefix(&prefix).separator("_"))
        .build()?;

    config_deserializer
        .try_deserialize()
        .context("invalid agent configuration")
}

/// Settings shared by all agents.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Tracing subscriber configuration
    #[serde(default)]
    pub tracing: TracingConfig,
    /// Port to serve prometheus metrics on; metrics server is disabled when
    /// unset. Specified as a string so it can be set from env vars.
    pub metrics: Option<String>,
}

impl Settings {
    /// Build the [`crate::CoreMetrics`] described by these settings.
    pub fn try_into_metrics(&self, agent_name: &str) -> Result<std::sync::Arc<crate::CoreMetrics>> {
        let port = self
            .metrics
            .as_ref()
            .map(|p| p.parse::<u16>())
            .transpose()
            .context("invalid metrics port")?;
        Ok(std::sync::Arc::new(crate::CoreMetrics::new(
            agent_name,
            port,
            prometheus::Registry::new(),
        )?))
    }
}
