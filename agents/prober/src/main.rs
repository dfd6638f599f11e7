//! The prober agent periodically executes probes against configured
//! targets, evaluates alert conditions over the resulting metrics stream,
//! and forwards metrics to the configured surfacers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use eyre::Result;

use fleetprober_base::agent_main;

use crate::prober::Prober;

mod alerting;
mod probes;
mod prober;
mod settings;

#[tokio::main]
async fn main() -> Result<()> {
    agent_main::<Prober>().await
}
