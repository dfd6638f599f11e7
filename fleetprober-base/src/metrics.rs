use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use prometheus::{
    labels, opts, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, Encoder, IntCounterVec, IntGaugeVec, Registry,
};
use tokio::task::JoinHandle;

/// Metric namespace prefix shared by all agents.
const NAMESPACE: &str = "fleetprober";

/// Macro to prefix a string with the namespace.
macro_rules! namespaced {
    ($name:expr) => {
        format!("{NAMESPACE}_{}", $name)
    };
}

/// Self-instrumentation metrics for one agent process.
pub struct CoreMetrics {
    /// Metrics registry for adding new metrics and gathering reports
    registry: Registry,
    listen_port: Option<u16>,
    agent_name: String,

    probe_cycles: IntCounterVec,
    probe_results: IntCounterVec,
    probe_late_replies: IntCounterVec,
    probe_process_starts: IntCounterVec,
    alert_notifications: IntCounterVec,
    alerts_active: IntGaugeVec,
    surfacer_writes: IntCounterVec,
}

impl CoreMetrics {
    /// Track metrics for a particular agent name.
    ///
    /// - `for_agent` name of the agent these metrics are tracking.
    /// - `listen_port` port to start the HTTP server on. If None the server
    ///   will not be started.
    /// - `registry` prometheus registry to attach the metrics to
    pub fn new(
        for_agent: &str,
        listen_port: Option<u16>,
        registry: Registry,
    ) -> prometheus::Result<Self> {
        let const_labels: HashMap<String, String> = labels! {
            namespaced!("baselib_version") => env!("CARGO_PKG_VERSION").into(),
            "agent".into() => for_agent.into(),
        };
        let const_labels_ref = const_labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<HashMap<_, _>>();

        let probe_cycles = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("probe_cycles_total"),
                "Number of probe cycles started",
                const_labels_ref
            ),
            &["probe"],
            registry
        )?;

        let probe_results = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("probe_results_total"),
                "Per-target probe results processed, by status",
                const_labels_ref
            ),
            &["probe", "status"],
            registry
        )?;

        let probe_late_replies = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("probe_late_replies_total"),
                "Probe server replies that matched no outstanding request",
                const_labels_ref
            ),
            &["probe"],
            registry
        )?;

        let probe_process_starts = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("probe_process_starts_total"),
                "Times a probe server process was (re)started",
                const_labels_ref
            ),
            &["probe"],
            registry
        )?;

        let alert_notifications = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("alert_notifications_total"),
                "Alert notifications emitted, by outcome",
                const_labels_ref
            ),
            &["probe", "outcome"],
            registry
        )?;

        let alerts_active = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced!("alerts_active"),
                "Targets currently in alerted state",
                const_labels_ref
            ),
            &["probe"],
            registry
        )?;

        let surfacer_writes = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("surfacer_writes_total"),
                "Event metrics handed to surfacers, by result",
                const_labels_ref
            ),
            &["surfacer", "result"],
            registry
        )?;

        Ok(Self {
            registry,
            listen_port,
            agent_name: for_agent.into(),
            probe_cycles,
            probe_results,
            probe_late_replies,
            probe_process_starts,
            alert_notifications,
            alerts_active,
            surfacer_writes,
        })
    }

    /// Number of probe cycles started.
    ///
    /// Labels:
    /// - `probe`: Name of the probe.
    pub fn probe_cycles(&self) -> IntCounterVec {
        self.probe_cycles.clone()
    }

    /// Per-target probe results processed.
    ///
    /// Labels:
    /// - `probe`: Name of the probe.
    /// - `status`: `success` or `failure`.
    pub fn probe_results(&self) -> IntCounterVec {
        self.probe_results.clone()
    }

    /// Replies from a probe server process that matched no outstanding
    /// request, usually late replies for a previous cycle's timeouts.
    ///
    /// Labels:
    /// - `probe`: Name of the probe.
    pub fn probe_late_replies(&self) -> IntCounterVec {
        self.probe_late_replies.clone()
    }

    /// Times a probe server process was started, including restarts after
    /// the process died.
    ///
    /// Labels:
    /// - `probe`: Name of the probe.
    pub fn probe_process_starts(&self) -> IntCounterVec {
        self.probe_process_starts.clone()
    }

    /// Alert notifications emitted.
    ///
    /// Labels:
    /// - `probe`: Name of the probe.
    /// - `outcome`: `sent` or `dropped` (notification channel full).
    pub fn alert_notifications(&self) -> IntCounterVec {
        self.alert_notifications.clone()
    }

    /// Targets currently in alerted state.
    ///
    /// Labels:
    /// - `probe`: Name of the probe.
    pub fn alerts_active(&self) -> IntGaugeVec {
        self.alerts_active.clone()
    }

    /// Event metrics handed to surfacers.
    ///
    /// Labels:
    /// - `surfacer`: Surfacer type, e.g. `cloud`.
    /// - `result`: `ok` or `dropped` (surfacer buffer full).
    pub fn surfacer_writes(&self) -> IntCounterVec {
        self.surfacer_writes.clone()
    }

    /// Gather available metrics into an encoded (plaintext, OpenMetrics
    /// format) report.
    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected_metrics = self.registry.gather();
        let mut out_buf = Vec::with_capacity(1024 * 64);
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&collected_metrics, &mut out_buf)?;
        Ok(out_buf)
    }

    /// Run an HTTP server serving OpenMetrics format reports on `/metrics`
    ///
    /// This is compatible with Prometheus, which ought to be configured to
    /// scrape me!
    pub fn run_http_server(self: Arc<Self>) -> JoinHandle<()> {
        use warp::Filter;
        if let Some(port) = self.listen_port {
            tracing::info!(port, "starting prometheus server on 0.0.0.0:{port}");
            tokio::spawn(async move {
                warp::serve(
                    warp::path!("metrics")
                        .map(move || {
                            warp::reply::with_header(
                                self.gather().unwrap_or_default(),
                                "Content-Type",
                                "text/plain; charset=utf-8",
                            )
                        })
                        .or(warp::any().map(|| {
                            warp::reply::with_status(
                                "go look at /metrics",
                                warp::http::StatusCode::NOT_FOUND,
                            )
                        })),
                )
                .run(([0, 0, 0, 0], port))
                .await;
            })
        } else {
            tracing::info!("not starting prometheus server");
            tokio::spawn(std::future::ready(()))
        }
    }

    /// Get the name of this agent, e.g. "prober"
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }
}

impl Debug for CoreMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CoreMetrics {{ agent_name: {}, listen_port: {:?} }}",
            self.agent_name, self.listen_port
        )
    }
}
