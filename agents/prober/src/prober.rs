//! The prober agent: wires probes, alerting and surfacers together.
//!
//! Every probe pushes samples onto one shared data channel. A fan-out task
//! tails that channel and hands each sample to the probe's alert handler
//! (when the sample carries result counters) and to every configured
//! surfacer. Alert notifications land on a bounded channel drained by a
//! logging task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use futures::future::select_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument::Instrumented, warn, Instrument};

use fleetprober_base::surfacers::cloud::{detect_gce_resource, CloudSurfacer, HttpMonitoringClient};
use fleetprober_base::surfacers::Surfacer;
use fleetprober_base::{cancel_task, Agent, AgentCore, CoreMetrics};
use fleetprober_core::metrics::EventMetrics;
use fleetprober_core::Endpoint;

use crate::alerting::{AlertHandler, AlertInfo};
use crate::probes::external::{ExternalProbe, ExternalProbeMetrics};
use crate::settings::ProberSettings;

/// Capacity of the shared probe data channel.
const DATA_CHANNEL_CAPACITY: usize = 1000;

/// Capacity of the alert notification channel.
const NOTIFY_CHANNEL_CAPACITY: usize = 10;

/// The prober agent.
#[derive(Debug)]
pub struct Prober {
    core: AgentCore,
    settings: ProberSettings,
}

impl AsRef<AgentCore> for Prober {
    fn as_ref(&self) -> &AgentCore {
        &self.core
    }
}

#[async_trait]
impl Agent for Prober {
    const AGENT_NAME: &'static str = "prober";

    type Settings = ProberSettings;

    async fn from_settings(settings: Self::Settings) -> Result<Self>
    where
        Self: Sized,
    {
        let core = settings.base.try_into_core(Self::AGENT_NAME)?;
        Ok(Self { core, settings })
    }

    #[allow(clippy::async_yields_async)]
    async fn run(&self) -> Instrumented<JoinHandle<Result<()>>> {
        let settings = self.settings.clone();
        let metrics = self.metrics();
        let span = info_span!("Prober");
        tokio::spawn(async move { run_agent(settings, metrics).await }).instrument(span)
    }
}

async fn run_agent(settings: ProberSettings, metrics: Arc<CoreMetrics>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let (data_tx, data_rx) = mpsc::channel::<EventMetrics>(DATA_CHANNEL_CAPACITY);
    let (notify_tx, notify_rx) = mpsc::channel::<AlertInfo>(NOTIFY_CHANNEL_CAPACITY);
    let mut tasks: Vec<Instrumented<JoinHandle<Result<()>>>> = Vec::new();

    let mut surfacers: Vec<Arc<dyn Surfacer>> = Vec::new();
    if let Some(surfacer_settings) = &settings.surfacer {
        let conf = surfacer_settings.conf.clone();
        let client = Arc::new(HttpMonitoringClient::new(
            &conf.project,
            surfacer_settings.auth_token.clone().unwrap_or_default(),
        ));
        let resource = detect_gce_resource(&conf.project).await;
        let (surfacer, worker) = CloudSurfacer::new(conf, client, resource)?;
        surfacers.push(Arc::new(surfacer));
        tasks.push(worker.spawn());
    }

    let mut alert_handlers: HashMap<String, AlertHandler> = HashMap::new();
    for probe_settings in &settings.probes {
        let opts = probe_settings.probe_options()?;
        let probe = ExternalProbe::new(
            &probe_settings.name,
            probe_settings.external.clone(),
            opts,
            data_tx.clone(),
            ExternalProbeMetrics::new(&metrics, &probe_settings.name),
        )?;
        tasks.push(probe.spawn(shutdown_rx.clone()));

        if let Some(alert_conf) = &probe_settings.alert {
            alert_handlers.insert(
                probe_settings.name.clone(),
                AlertHandler::new(alert_conf, &probe_settings.name, notify_tx.clone()),
            );
        }
    }
    // the probes hold the remaining senders; the fan-out ends with them
    drop(data_tx);
    drop(notify_tx);

    tasks.push(spawn_alert_logger(notify_rx, metrics.clone()));
    tasks.push(spawn_fan_out(data_rx, surfacers, alert_handlers, metrics));

    let (res, _, remaining) = select_all(tasks).await;
    for task in remaining.into_iter() {
        cancel_task!(task);
    }
    res?
}

/// Tail the data channel; feed alert handlers and surfacers.
fn spawn_fan_out(
    mut data_rx: mpsc::Receiver<EventMetrics>,
    surfacers: Vec<Arc<dyn Surfacer>>,
    mut alert_handlers: HashMap<String, AlertHandler>,
    metrics: Arc<CoreMetrics>,
) -> Instrumented<JoinHandle<Result<()>>> {
    let span = info_span!("fan-out");
    tokio::spawn(async move {
        while let Some(em) = data_rx.recv().await {
            if let (Some(probe), Some(dst)) = (em.label("probe"), em.label("dst")) {
                if em.metric("total").is_some() && em.metric("success").is_some() {
                    if let Some(handler) = alert_handlers.get_mut(probe) {
                        let ep = Endpoint::new(dst);
                        if let Err(err) = handler.record(&ep, &em) {
                            warn!(probe, target = dst, %err, "bad sample for alerting");
                        }
                        metrics
                            .alerts_active()
                            .with_label_values(&[probe])
                            .set(handler.active_alerts() as i64);
                    }
                }
            }

            for surfacer in &surfacers {
                metrics
                    .surfacer_writes()
                    .with_label_values(&[surfacer.name(), "ok"])
                    .inc();
                surfacer.write(em.clone());
            }
        }
        Ok(())
    })
    .instrument(span)
}

/// Drain alert notifications to the log.
fn spawn_alert_logger(
    mut notify_rx: mpsc::Receiver<AlertInfo>,
    metrics: Arc<CoreMetrics>,
) -> Instrumented<JoinHandle<Result<()>>> {
    let span = info_span!("alert-logger");
    tokio::spawn(async move {
        while let Some(alert) = notify_rx.recv().await {
            metrics
                .alert_notifications()
                .with_label_values(&[&alert.probe_name, "sent"])
                .inc();
            warn!(
                name = %alert.name,
                probe = %alert.probe_name,
                target = %alert.target,
                failures = alert.failures,
                total = alert.total,
                failing_since = %alert.failing_since,
                condition_id = %alert.condition_id,
                "target failing"
            );
        }
        Ok(())
    })
    .instrument(span)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alerting::AlertConf;
    use chrono::Utc;
    use fleetprober_core::metrics::Value;
    use prometheus::Registry;

    fn test_metrics() -> Arc<CoreMetrics> {
        Arc::new(CoreMetrics::new("test", None, Registry::new()).unwrap())
    }

    fn result_sample(probe: &str, dst: &str, total: i64, success: i64) -> EventMetrics {
        EventMetrics::new(Utc::now())
            .with_label("ptype", "external")
            .with_label("probe", probe)
            .with_label("dst", dst)
            .with_metric("success", Value::Int(success))
            .with_metric("total", Value::Int(total))
    }

    #[tokio::test]
    async fn fan_out_routes_samples_to_the_probes_alert_handler() {
        let (data_tx, data_rx) = mpsc::channel(16);
        let (notify_tx, mut notify_rx) = mpsc::channel(16);

        let mut handlers = HashMap::new();
        handlers.insert(
            "p1".to_string(),
            AlertHandler::new(&AlertConf::default(), "p1", notify_tx),
        );

        let task = spawn_fan_out(data_rx, Vec::new(), handlers, test_metrics());

        // p1/t1 fails on the second delta; p2 has no handler and is ignored
        data_tx.send(result_sample("p1", "t1", 1, 1)).await.unwrap();
        data_tx.send(result_sample("p1", "t1", 2, 2)).await.unwrap();
        data_tx.send(result_sample("p1", "t1", 3, 2)).await.unwrap();
        data_tx.send(result_sample("p2", "t9", 5, 0)).await.unwrap();
        drop(data_tx);
        task.await.unwrap().unwrap();

        let alert = notify_rx.recv().await.unwrap();
        assert_eq!(alert.probe_name, "p1");
        assert_eq!(alert.target, Endpoint::new("t1"));
        assert!(notify_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn prober_builds_from_settings() {
        let json = serde_json::json!({
            "metrics": "9313",
            "probes": [{
                "name": "ping",
                "command": "echo pong",
                "mode": "once",
                "targets": [{"name": "web1"}]
            }]
        });
        let settings: ProberSettings = serde_json::from_value(json).unwrap();
        let prober = Prober::from_settings(settings).await.unwrap();
        assert_eq!(prober.core.metrics.agent_name(), "prober");
        assert_eq!(prober.settings.probes.len(), 1);
        assert!(prober.settings.probes[0].probe_options().is_ok());
    }
}
