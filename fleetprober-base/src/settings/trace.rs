use eyre::{eyre, Result};
use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Logging level
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Level {
    /// Off
    Off,
    /// Error
    Error,
    /// Warn
    Warn,
    /// Debug
    Debug,
    /// Trace
    Trace,
    /// Info
    #[default]
    #[serde(other)]
    Info,
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> LevelFilter {
        match level {
            Level::Off => LevelFilter::OFF,
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Debug => LevelFilter::DEBUG,
            Level::Trace => LevelFilter::TRACE,
            Level::Info => LevelFilter::INFO,
        }
    }
}

/// Output format of the fmt subscriber
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Style {
    /// One line per event, fields inline
    Compact,
    /// JSON objects, for log collectors
    Json,
    /// Multi-line human-oriented output
    #[default]
    #[serde(other)]
    Pretty,
}

/// Configuration for the tracing subscriber used by fleetprober agents
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingConfig {
    #[serde(default)]
    fmt: Style,
    #[serde(default)]
    level: Level,
}

impl TracingConfig {
    /// Install the configured subscriber as the global default. `RUST_LOG`
    /// overrides the configured level when set.
    pub fn start_tracing(&self) -> Result<()> {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from(self.level).into())
            .from_env_lossy();
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        let result = match self.fmt {
            Style::Compact => builder.compact().try_init(),
            Style::Json => builder.json().try_init(),
            Style::Pretty => builder.pretty().try_init(),
        };
        result.map_err(|err| eyre!("failed to install tracing subscriber: {err}"))
    }
}
