//! Cloud monitoring surfacer.
//!
//! An asynchronous batching pipeline: producers hand samples to
//! [`CloudSurfacer::write`] without blocking; a single worker folds them into
//! a latest-value-per-identity cache and flushes the cache to the backend on
//! a jittered timer, registering metric descriptors the first time a metric
//! name is seen.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::{thread_rng, Rng};
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info_span, instrument::Instrumented, warn, Instrument};

use fleetprober_core::metrics::{EventMetrics, Value};

use super::{Surfacer, SurfacerError};

mod client;
pub use client::*;

/// The backend caps how many series one write may carry.
const BATCH_SIZE: usize = 200;

/// The backend rejects metric types longer than this, prefix included.
const MAX_METRIC_NAME_LEN: usize = 100;

fn default_monitoring_url() -> String {
    "custom.googleapis.com/fleetprober/".to_string()
}

fn default_batch_timer_sec() -> u64 {
    10
}

fn default_metrics_buffer_size() -> usize {
    10_000
}

/// How metric names are prefixed from the sample's `ptype`/`probe` labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsPrefix {
    /// No prefix; `ptype`/`probe` stay labels
    #[default]
    None,
    /// `<probe>/<metric>`
    Probe,
    /// `<ptype>/<probe>/<metric>`
    PtypeProbe,
}

/// Cloud surfacer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSurfacerConf {
    /// Prefix for metric type URLs
    #[serde(default = "default_monitoring_url")]
    pub monitoring_url: String,
    /// Cloud project to write to
    pub project: String,
    /// Metric name prefixing mode
    #[serde(default)]
    pub metrics_prefix: MetricsPrefix,
    /// Seconds between flushes
    #[serde(default = "default_batch_timer_sec")]
    pub batch_timer_sec: u64,
    /// Capacity of the incoming sample buffer
    #[serde(default = "default_metrics_buffer_size")]
    pub metrics_buffer_size: usize,
    /// Only surface metrics whose name matches
    #[serde(default)]
    pub allow_metrics: Option<String>,
    /// Never surface metrics whose name matches
    #[serde(default)]
    pub ignore_metrics: Option<String>,
    /// Deprecated: use `allow_metrics`/`ignore_metrics` instead
    #[serde(default)]
    pub allowed_metrics_regex: Option<String>,
}

/// Producer-side handle. Cheap to clone; all clones feed the same worker.
#[derive(Debug, Clone)]
pub struct CloudSurfacer {
    tx: mpsc::Sender<EventMetrics>,
}

impl CloudSurfacer {
    /// Build the surfacer handle and its worker. The caller spawns the
    /// worker with [`BatchWorker::spawn`].
    pub fn new(
        conf: CloudSurfacerConf,
        client: Arc<dyn MonitoringClient>,
        resource: Option<MonitoredResource>,
    ) -> Result<(Self, BatchWorker), SurfacerError> {
        if conf.batch_timer_sec == 0 {
            return Err(SurfacerError::Config("batchTimerSec must be > 0".into()));
        }
        let compile = |re: &Option<String>| -> Result<Option<Regex>, SurfacerError> {
            re.as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|err| SurfacerError::Config(err.to_string()))
        };
        if conf.allowed_metrics_regex.is_some() {
            warn!("allowedMetricsRegex is deprecated, use allowMetrics/ignoreMetrics");
        }

        let (tx, rx) = mpsc::channel(conf.metrics_buffer_size);
        let worker = BatchWorker {
            allow_metrics: compile(&conf.allow_metrics)?,
            ignore_metrics: compile(&conf.ignore_metrics)?,
            allowed_metrics_regex: compile(&conf.allowed_metrics_regex)?,
            conf,
            client,
            resource,
            rx,
            cache: HashMap::new(),
            known_metrics: HashSet::new(),
            start_time: Utc::now(),
            fail_cnt: 0,
        };
        Ok((Self { tx }, worker))
    }
}

impl Surfacer for CloudSurfacer {
    fn name(&self) -> &'static str {
        "cloud"
    }

    fn write(&self, em: EventMetrics) {
        if self.tx.try_send(em).is_err() {
            warn!(surfacer = self.name(), "write buffer full, dropping sample");
        }
    }
}

/// The surfacer's single worker: owns the cache, consumes the incoming
/// channel and flushes batches. No locking; nothing else touches its state.
pub struct BatchWorker {
    conf: CloudSurfacerConf,
    client: Arc<dyn MonitoringClient>,
    resource: Option<MonitoredResource>,
    rx: mpsc::Receiver<EventMetrics>,
    // latest prepared series per (metric name, label signature)
    cache: HashMap<String, TimeSeries>,
    // metric types we have created descriptors for; only ever grows
    known_metrics: HashSet<String>,
    start_time: DateTime<Utc>,
    fail_cnt: u64,
    allow_metrics: Option<Regex>,
    ignore_metrics: Option<Regex>,
    allowed_metrics_regex: Option<Regex>,
}

impl BatchWorker {
    /// Spawn the worker loop.
    pub fn spawn(self) -> Instrumented<JoinHandle<eyre::Result<()>>> {
        let span = info_span!("CloudSurfacer");
        tokio::spawn(async move { self.run().await }).instrument(span)
    }

    async fn run(mut self) -> eyre::Result<()> {
        let batch_timer = Duration::from_secs(self.conf.batch_timer_sec);

        // Startup is jittered so a fleet of agents started together doesn't
        // flush in lockstep.
        let jitter = batch_timer.mul_f64(thread_rng().gen_range(0.0..1.0));
        tokio::time::sleep(jitter).await;

        let mut ticker = interval_at(Instant::now() + batch_timer, batch_timer);
        loop {
            tokio::select! {
                maybe_em = self.rx.recv() => match maybe_em {
                    Some(em) => {
                        self.record_event_metrics(&em);
                    }
                    None => {
                        // producers gone; push out what we have and stop
                        self.flush().await;
                        return Ok(());
                    }
                },
                _ = ticker.tick() => self.flush().await,
            }
        }
    }

    /// Fold one sample into the cache, returning the series it produced.
    fn record_event_metrics(&mut self, em: &EventMetrics) -> Vec<TimeSeries> {
        let metric_kind = em.kind.to_string();
        let (em_labels, labels_key, metric_prefix) = self.process_labels(em);

        let mut out = Vec::new();
        let metrics: Vec<(String, Value)> = em
            .metric_keys()
            .filter_map(|k| em.metric(k).map(|v| (k.to_string(), v.clone())))
            .collect();

        for (key, val) in metrics {
            if !self.allow_metric(&key) {
                continue;
            }
            let name = format!("{metric_prefix}{key}");
            if self.ignore_metric(&name) {
                continue;
            }

            let unit = if key == "latency" {
                latency_unit_str(em.latency_unit)
            } else {
                "1"
            };

            match &val {
                Value::Int(_) | Value::Float(_) => {
                    let v = val.float64().unwrap_or_default();
                    out.push(self.record_time_series(
                        &metric_kind,
                        &name,
                        "DOUBLE",
                        em_labels.clone(),
                        em.timestamp,
                        TypedValue::double(v),
                        unit,
                        &labels_key,
                    ));
                }
                Value::Str(s) => {
                    // The backend has no string value type; the content
                    // becomes a `val` label on a constant-1 series.
                    let mut labels = em_labels.clone();
                    labels.insert("val".to_string(), s.clone());
                    out.push(self.record_time_series(
                        &metric_kind,
                        &name,
                        "DOUBLE",
                        labels,
                        em.timestamp,
                        TypedValue::double(1.0),
                        unit,
                        &labels_key,
                    ));
                }
                Value::Map(map) => {
                    // One series per key, the map's key-name as extra label.
                    for map_key in map.keys().map(str::to_string).collect::<Vec<_>>() {
                        let mut labels = em_labels.clone();
                        labels.insert(map.key_name.clone(), map_key.clone());
                        out.push(self.record_time_series(
                            &metric_kind,
                            &name,
                            "DOUBLE",
                            labels,
                            em.timestamp,
                            TypedValue::double(map.get(&map_key) as f64),
                            unit,
                            &format!("{labels_key},{}={map_key}", map.key_name),
                        ));
                    }
                }
                Value::Dist(dist) => {
                    out.push(self.record_time_series(
                        &metric_kind,
                        &name,
                        "DISTRIBUTION",
                        em_labels.clone(),
                        em.timestamp,
                        TypedValue::distribution(dist.into()),
                        unit,
                        &labels_key,
                    ));
                }
            }
        }
        out
    }

    /// Build a series, cache it under `metric name + "," + label signature`
    /// and return it. A later sample with the same identity overwrites the
    /// cached value before the next flush.
    #[allow(clippy::too_many_arguments)]
    fn record_time_series(
        &mut self,
        metric_kind: &str,
        name: &str,
        value_type: &str,
        labels: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
        value: TypedValue,
        unit: &str,
        labels_key: &str,
    ) -> TimeSeries {
        let start_time = if metric_kind == "GAUGE" {
            timestamp
        } else {
            self.start_time
        };

        let ts = TimeSeries {
            metric: Metric {
                r#type: format!("{}{}", self.conf.monitoring_url, name),
                labels,
            },
            resource: self.resource.clone(),
            metric_kind: metric_kind.to_string(),
            value_type: value_type.to_string(),
            unit: unit.to_string(),
            points: vec![Point {
                interval: TimeInterval {
                    start_time: start_time.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    end_time: timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                },
                value,
            }],
        };

        self.cache.insert(format!("{name},{labels_key}"), ts.clone());
        ts
    }

    /// Split a sample's labels into series labels, a stable cache signature,
    /// and the metric-name prefix derived from `ptype`/`probe`.
    fn process_labels(&self, em: &EventMetrics) -> (BTreeMap<String, String>, String, String) {
        let use_ptype = self.conf.metrics_prefix == MetricsPrefix::PtypeProbe;
        let use_probe = matches!(
            self.conf.metrics_prefix,
            MetricsPrefix::PtypeProbe | MetricsPrefix::Probe
        );

        let mut labels = BTreeMap::new();
        let mut signature = Vec::new();
        let mut ptype = "";
        let mut probe = "";
        for (k, v) in em.labels() {
            if k == "ptype" && use_ptype {
                ptype = v;
                continue;
            }
            if k == "probe" && use_probe {
                probe = v;
                continue;
            }
            labels.insert(k.to_string(), v.to_string());
            signature.push(format!("{k}={v}"));
        }

        let mut prefix = String::new();
        if use_ptype && !ptype.is_empty() {
            prefix.push_str(ptype);
            prefix.push('/');
        }
        if use_probe && !probe.is_empty() {
            prefix.push_str(probe);
            prefix.push('/');
        }
        (labels, signature.join(","), prefix)
    }

    fn allow_metric(&self, name: &str) -> bool {
        if let Some(allow) = &self.allow_metrics {
            if !allow.is_match(name) {
                return false;
            }
        }
        if let Some(ignore) = &self.ignore_metrics {
            if ignore.is_match(name) {
                return false;
            }
        }
        true
    }

    fn ignore_metric(&self, name: &str) -> bool {
        if let Some(re) = &self.allowed_metrics_regex {
            if !re.is_match(name) {
                return true;
            }
        }
        if self.conf.monitoring_url.len() + name.len() > MAX_METRIC_NAME_LEN {
            warn!(name, "metric name over the backend's length limit, skipping");
            return true;
        }
        false
    }

    fn descriptor_for(&self, ts: &TimeSeries) -> MetricDescriptor {
        MetricDescriptor {
            name: format!(
                "projects/{}/metricDescriptors/{}",
                self.conf.project, ts.metric.r#type
            ),
            r#type: ts.metric.r#type.clone(),
            metric_kind: ts.metric_kind.clone(),
            labels: ts
                .metric
                .labels
                .keys()
                .map(|k| LabelDescriptor {
                    key: k.clone(),
                    value_type: "STRING".to_string(),
                })
                .collect(),
            unit: ts.unit.clone(),
            value_type: ts.value_type.clone(),
        }
    }

    /// Write the cache out in `BATCH_SIZE` chunks, then clear it. Failed
    /// chunks are not retried; the next window repopulates the cache.
    async fn flush(&mut self) {
        if self.cache.is_empty() {
            return;
        }

        let mut batch = Vec::with_capacity(self.cache.len());
        let cached: Vec<TimeSeries> = self.cache.values().cloned().collect();
        for ts in cached {
            if !self.known_metrics.contains(&ts.metric.r#type) && !ts.unit.is_empty() {
                match self.client.create_metric_descriptor(self.descriptor_for(&ts)).await {
                    Ok(()) => {
                        self.known_metrics.insert(ts.metric.r#type.clone());
                    }
                    Err(err) => {
                        // not marked known; the series sits this cycle out
                        // and descriptor creation is retried on the next one
                        warn!(metric = %ts.metric.r#type, %err, "error creating metric descriptor");
                        continue;
                    }
                }
            }
            batch.push(ts);
        }

        for chunk in batch.chunks(BATCH_SIZE) {
            debug!(series = chunk.len(), total = batch.len(), "writing batch");
            if let Err(err) = self.client.create_time_series(chunk.to_vec()).await {
                self.fail_cnt += 1;
                warn!(%err, fail_cnt = self.fail_cnt, "time series create call failed");
            }
        }

        self.cache.clear();
    }
}

fn latency_unit_str(unit: Duration) -> &'static str {
    if unit == Duration::from_secs(1) {
        "s"
    } else if unit == Duration::from_millis(1) {
        "ms"
    } else if unit == Duration::from_micros(1) {
        "us"
    } else if unit == Duration::from_nanos(1) {
        "ns"
    } else {
        "1"
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use fleetprober_core::metrics::{Distribution, Kind, MapValue};
    use maplit::btreemap;

    fn test_conf() -> CloudSurfacerConf {
        CloudSurfacerConf {
            monitoring_url: "custom.googleapis.com/fleetprober/".to_string(),
            project: "test-project".to_string(),
            metrics_prefix: MetricsPrefix::None,
            batch_timer_sec: 10,
            metrics_buffer_size: 100,
            allow_metrics: None,
            ignore_metrics: None,
            allowed_metrics_regex: None,
        }
    }

    fn test_worker(conf: CloudSurfacerConf, client: MockMonitoringClient) -> BatchWorker {
        let (_surfacer, mut worker) =
            CloudSurfacer::new(conf, Arc::new(client), Some(test_resource())).unwrap();
        worker.start_time = Utc.timestamp_opt(0, 0).unwrap();
        worker
    }

    fn test_resource() -> MonitoredResource {
        MonitoredResource {
            r#type: "gce_instance".to_string(),
            labels: btreemap! {
                "instance_id".to_string() => "test-instance".to_string(),
                "zone".to_string() => "us-central1-a".to_string(),
            },
        }
    }

    fn sample(ts_sec: i64) -> EventMetrics {
        EventMetrics::new(Utc.timestamp_opt(ts_sec, 0).unwrap())
            .with_label("ptype", "external")
            .with_label("probe", "test_probe")
            .with_label("dst", "web1")
    }

    #[test]
    fn process_labels_prefix_modes() {
        let em = sample(1)
            .with_label("keyA", "valueA")
            .with_metric("m", Value::Int(1));

        let cases = [
            (MetricsPrefix::PtypeProbe, "dst=web1,keyA=valueA", "external/test_probe/"),
            (MetricsPrefix::Probe, "ptype=external,dst=web1,keyA=valueA", "test_probe/"),
            (
                MetricsPrefix::None,
                "ptype=external,probe=test_probe,dst=web1,keyA=valueA",
                "",
            ),
        ];
        for (mode, want_key, want_prefix) in cases {
            let worker = test_worker(
                CloudSurfacerConf {
                    metrics_prefix: mode,
                    ..test_conf()
                },
                MockMonitoringClient::new(),
            );
            let (_, key, prefix) = worker.process_labels(&em);
            assert_eq!(key, want_key, "{mode:?}");
            assert_eq!(prefix, want_prefix, "{mode:?}");
        }
    }

    #[test]
    fn numeric_and_string_and_map_series() {
        let mut worker = test_worker(test_conf(), MockMonitoringClient::new());

        let mut map = MapValue::new("code");
        map.inc_key_by("200", 98);
        map.inc_key_by("500", 2);

        let em = sample(10)
            .with_metric("total", Value::Int(42))
            .with_metric("version", Value::Str("v1.2".into()))
            .with_metric("resp_code", Value::Map(map));

        let series = worker.record_event_metrics(&em);
        assert_eq!(series.len(), 4);

        let total = &series[0];
        assert_eq!(total.metric.r#type, "custom.googleapis.com/fleetprober/total");
        assert_eq!(total.metric_kind, "CUMULATIVE");
        assert_eq!(total.value_type, "DOUBLE");
        assert_eq!(total.unit, "1");
        assert_eq!(total.points[0].value, TypedValue::double(42.0));
        // cumulative series start at the surfacer start time
        assert_eq!(total.points[0].interval.start_time, "1970-01-01T00:00:00.000000000Z");

        let version = &series[1];
        assert_eq!(version.metric.labels["val"], "v1.2");
        assert_eq!(version.points[0].value, TypedValue::double(1.0));

        let codes: Vec<_> = series[2..4]
            .iter()
            .map(|ts| (ts.metric.labels["code"].clone(), ts.points[0].value.clone()))
            .collect();
        assert!(codes.contains(&("200".to_string(), TypedValue::double(98.0))));
        assert!(codes.contains(&("500".to_string(), TypedValue::double(2.0))));
    }

    #[test]
    fn latency_units_and_distribution() {
        let mut worker = test_worker(test_conf(), MockMonitoringClient::new());

        let mut dist = Distribution::from_spec("1,2,4").unwrap();
        dist.add_sample(0.5);
        dist.add_sample(3.0);

        let mut em = sample(10).with_metric("latency", Value::Dist(dist));
        em.latency_unit = Duration::from_micros(1);

        let series = worker.record_event_metrics(&em);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].value_type, "DISTRIBUTION");
        assert_eq!(series[0].unit, "us");
        let dv = series[0].points[0].value.distribution_value.as_ref().unwrap();
        assert_eq!(dv.count, 2);
        assert_eq!(dv.bucket_counts, vec![1, 0, 1, 0]);
        assert_eq!(dv.bucket_options.explicit_buckets.bounds, vec![1.0, 2.0, 4.0]);
    }

    #[test]
    fn gauge_interval_collapses_to_timestamp() {
        let mut worker = test_worker(test_conf(), MockMonitoringClient::new());
        let mut em = sample(20).with_metric("up", Value::Int(1));
        em.kind = Kind::Gauge;

        let series = worker.record_event_metrics(&em);
        assert_eq!(series[0].metric_kind, "GAUGE");
        assert_eq!(
            series[0].points[0].interval.start_time,
            series[0].points[0].interval.end_time
        );
    }

    #[test]
    fn later_samples_win_the_cache_window() {
        let mut worker = test_worker(test_conf(), MockMonitoringClient::new());

        worker.record_event_metrics(&sample(10).with_metric("total", Value::Int(1)));
        worker.record_event_metrics(&sample(11).with_metric("total", Value::Int(2)));

        assert_eq!(worker.cache.len(), 1);
        let ts = worker.cache.values().next().unwrap();
        assert_eq!(ts.points[0].value, TypedValue::double(2.0));
    }

    #[test]
    fn metric_filters_and_length_limit() {
        let mut worker = test_worker(
            CloudSurfacerConf {
                allow_metrics: Some("^(total|success)$".to_string()),
                ignore_metrics: Some("^success$".to_string()),
                ..test_conf()
            },
            MockMonitoringClient::new(),
        );
        let em = sample(10)
            .with_metric("total", Value::Int(1))
            .with_metric("success", Value::Int(1))
            .with_metric("latency", Value::Float(2.0));
        assert_eq!(worker.record_event_metrics(&em).len(), 1);

        let mut worker = test_worker(test_conf(), MockMonitoringClient::new());
        let long_name = "m".repeat(120);
        let em = sample(10).with_metric(long_name, Value::Int(1));
        assert!(worker.record_event_metrics(&em).is_empty());
    }

    #[tokio::test]
    async fn flush_clears_cache_and_batches_writes() {
        let mut client = MockMonitoringClient::new();
        client
            .expect_create_metric_descriptor()
            .times(1)
            .returning(|_| Ok(()));
        client
            .expect_create_time_series()
            .times(1)
            .returning(|ts| {
                assert_eq!(ts.len(), 1);
                Ok(())
            });

        let mut worker = test_worker(test_conf(), client);
        worker.record_event_metrics(&sample(10).with_metric("total", Value::Int(5)));
        worker.flush().await;
        assert!(worker.cache.is_empty());

        // nothing cached, nothing written
        worker.flush().await;
    }

    #[tokio::test]
    async fn descriptor_created_once_per_metric() {
        let mut client = MockMonitoringClient::new();
        client
            .expect_create_metric_descriptor()
            .times(1)
            .returning(|_| Ok(()));
        client
            .expect_create_time_series()
            .times(2)
            .returning(|_| Ok(()));

        let mut worker = test_worker(test_conf(), client);
        worker.record_event_metrics(&sample(10).with_metric("total", Value::Int(5)));
        worker.flush().await;
        worker.record_event_metrics(&sample(20).with_metric("total", Value::Int(6)));
        worker.flush().await;

        assert_eq!(worker.known_metrics.len(), 1);
    }

    #[tokio::test]
    async fn failed_descriptor_skips_series_but_retries_later() {
        let mut client = MockMonitoringClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_create_metric_descriptor()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(SurfacerError::Config("boom".into()))
            });
        client
            .expect_create_metric_descriptor()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        client
            .expect_create_time_series()
            .times(1)
            .returning(|_| Ok(()));

        let mut worker = test_worker(test_conf(), client);
        worker.record_event_metrics(&sample(10).with_metric("total", Value::Int(5)));
        // descriptor fails: nothing written, cache still cleared, not known
        worker.flush().await;
        assert!(worker.known_metrics.is_empty());
        assert!(worker.cache.is_empty());

        worker.record_event_metrics(&sample(20).with_metric("total", Value::Int(6)));
        worker.flush().await;
        assert_eq!(worker.known_metrics.len(), 1);
    }
}
