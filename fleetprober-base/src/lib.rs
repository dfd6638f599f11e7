//! Shared framework for fleetprober agents: settings loading, tracing setup,
//! prometheus self-instrumentation, the agent lifecycle, and surfacers that
//! forward probe metrics to external backends.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(unused_extern_crates)]

mod settings;
pub use settings::*;

/// Base trait for an agent
mod agent;
pub use agent::*;

#[doc(hidden)]
#[macro_use]
mod macros;

mod metrics;
pub use metrics::*;

/// Surfacers forward event metrics to observability backends
pub mod surfacers;
