//! Surfacers tail the probe data channel and forward event metrics to
//! external observability backends. Delivery is at-most-once: a surfacer
//! whose buffer is full drops samples rather than back-pressuring probes.

use std::fmt::Debug;

use fleetprober_core::metrics::EventMetrics;

pub mod cloud;

/// A sink for probe samples.
pub trait Surfacer: Send + Sync + Debug {
    /// Short name used in logs and self-metrics, e.g. `cloud`.
    fn name(&self) -> &'static str;

    /// Hand a sample to the surfacer. Must not block: implementations queue
    /// internally and drop (with a warning) under overload.
    fn write(&self, em: EventMetrics);
}

/// Errors from surfacer configuration or backend communication.
#[derive(Debug, thiserror::Error)]
pub enum SurfacerError {
    /// The backend request could not be sent
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The backend rejected the request
    #[error("backend returned {status}: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body, for the log
        body: String,
    },
    /// The surfacer configuration is unusable
    #[error("invalid surfacer config: {0}")]
    Config(String),
}
