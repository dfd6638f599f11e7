//! Core data model and collaborator contracts for fleetprober agents.
//!
//! This crate is the leaf of the workspace: it knows nothing about probe
//! scheduling or surfacing backends. It holds the event-metrics value types
//! that flow between probes and surfacers, the payload parser used to turn
//! probe process output into metrics, payload validators, and the target
//! provider contract.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(unused_extern_crates)]

mod endpoint;
pub use endpoint::*;

mod error;
pub use error::*;

/// Event metrics model and payload parsing
pub mod metrics;

mod options;
pub use options::*;

/// `@label@` template substitution for probe options and arguments
pub mod template;

/// Payload validators
pub mod validators;
