use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Report, Result};
use futures_util::future::select_all;
use tokio::task::JoinHandle;
use tracing::instrument::Instrumented;
use tracing::{info_span, Instrument};

use crate::{cancel_task, metrics::CoreMetrics, settings::Settings};

/// Properties shared across all fleetprober agents
#[derive(Debug)]
pub struct AgentCore {
    /// Prometheus metrics
    pub metrics: Arc<CoreMetrics>,
    /// Settings this agent was created with
    pub settings: Settings,
}

/// A long-running fleetprober agent process.
#[async_trait]
pub trait Agent: Send + Sync + Debug + AsRef<AgentCore> {
    /// The agent's name
    const AGENT_NAME: &'static str;

    /// The settings object for this agent
    type Settings: AsRef<Settings> + serde::de::DeserializeOwned;

    /// Instantiate the agent from the standard settings object
    async fn from_settings(settings: Self::Settings) -> Result<Self>
    where
        Self: Sized;

    /// Start running this agent.
    #[allow(clippy::async_yields_async)]
    async fn run(&self) -> Instrumented<JoinHandle<Result<()>>>;

    /// Return a handle to the metrics registry
    fn metrics(&self) -> Arc<CoreMetrics> {
        self.as_ref().metrics.clone()
    }

    /// Run tasks until any one of them ends, then cancel the rest.
    #[allow(clippy::unit_arg, unused_must_use)]
    fn run_all(
        &self,
        tasks: Vec<Instrumented<JoinHandle<Result<(), Report>>>>,
    ) -> Instrumented<JoinHandle<Result<()>>> {
        debug_assert!(!tasks.is_empty(), "No tasks submitted");
        let span = info_span!("run_all");
        tokio::spawn(async move {
            let (res, _, remaining) = select_all(tasks).await;

            for task in remaining.into_iter() {
                cancel_task!(task);
            }

            res?
        })
        .instrument(span)
    }
}

impl Settings {
    /// Build the [`AgentCore`] shared by all agents: metrics plus a copy of
    /// the base settings.
    pub fn try_into_core(&self, agent_name: &str) -> Result<AgentCore> {
        Ok(AgentCore {
            metrics: self.try_into_metrics(agent_name)?,
            settings: self.clone(),
        })
    }
}

/// Call this from `main` to fully initialize and run the agent for its
/// entire lifecycle. This assumes only a single agent is being run. This
/// will initialize tracing and the metrics server as well.
pub async fn agent_main<A: Agent>() -> Result<()> {
    let settings: A::Settings = crate::settings::load_settings_object(A::AGENT_NAME)?;
    settings.as_ref().tracing.start_tracing()?;

    let agent = A::from_settings(settings).await?;
    agent.metrics().run_http_server();

    agent.run().await.await?
}
