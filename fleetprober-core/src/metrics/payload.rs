//! Parser for metrics emitted by probe processes on stdout.
//!
//! Probes report one metric per line, `name value [k=v k=v ...]`. Values are
//! integers, floats, comma-separated float lists for pre-declared
//! distribution metrics, or free-form strings. Blank lines and `#` comments
//! are ignored; malformed lines are skipped with a warning and never fail
//! the probe run.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use super::{Distribution, EventMetrics, Kind, Value};
use crate::MetricsError;

/// Configuration for turning probe output into metrics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadParserOpts {
    /// Kind of the emitted samples. Defaults to the kind inferred from the
    /// probe mode (gauge for one-shot probes, cumulative for server probes).
    #[serde(default)]
    pub metrics_kind: Option<Kind>,
    /// Labels added to every emitted sample.
    #[serde(default)]
    pub additional_labels: BTreeMap<String, String>,
    /// Aggregate values in the agent instead of trusting the probe to report
    /// running totals. Incompatible with gauge kind.
    #[serde(default)]
    pub aggregate: bool,
    /// Metric name to bucket-bound spec (`"1,2,4,8"`) for metrics the probe
    /// reports as comma-separated sample lists.
    #[serde(default)]
    pub dist_metrics: HashMap<String, String>,
}

/// Parses probe payload text into [`EventMetrics`].
#[derive(Debug, Clone)]
pub struct Parser {
    ptype: String,
    probe: String,
    kind: Kind,
    aggregate: bool,
    additional_labels: BTreeMap<String, String>,
    dists: HashMap<String, Distribution>,
    // per-target running totals, only populated in aggregate mode
    accumulated: HashMap<String, EventMetrics>,
}

impl Parser {
    /// Build a parser for one probe's output.
    pub fn new(
        opts: &PayloadParserOpts,
        ptype: &str,
        probe: &str,
        default_kind: Kind,
    ) -> Result<Self, MetricsError> {
        let kind = opts.metrics_kind.unwrap_or(default_kind);
        if opts.aggregate && kind == Kind::Gauge {
            return Err(MetricsError::InvalidConfig(
                "aggregation is incompatible with gauge metrics".into(),
            ));
        }

        let mut dists = HashMap::new();
        for (name, spec) in &opts.dist_metrics {
            dists.insert(name.clone(), Distribution::from_spec(spec)?);
        }

        Ok(Self {
            ptype: ptype.to_string(),
            probe: probe.to_string(),
            kind,
            aggregate: opts.aggregate,
            additional_labels: opts.additional_labels.clone(),
            dists,
            accumulated: HashMap::new(),
        })
    }

    /// Parse one payload, emitting a sample per valid line. In aggregate
    /// mode the values are folded into the target's running totals first and
    /// the emitted samples carry those totals.
    pub fn payload_metrics(&mut self, payload: &str, target: &str) -> Vec<EventMetrics> {
        let mut out = Vec::new();

        for line in payload.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((name, value, labels)) = self.parse_line(line) else {
                warn!(probe = %self.probe, line, "skipping unparseable payload line");
                continue;
            };

            let mut em = self.base_metrics(target);
            for (k, v) in labels {
                em.add_label(k, v);
            }
            em.add_metric(&name, value);

            if self.aggregate {
                match self.accumulate(target, &em, &name) {
                    Ok(aggregated) => out.push(aggregated),
                    Err(err) => {
                        warn!(probe = %self.probe, %name, %err, "dropping unaggregatable metric");
                    }
                }
            } else {
                out.push(em);
            }
        }

        out
    }

    fn base_metrics(&self, target: &str) -> EventMetrics {
        let mut em = EventMetrics::new(Utc::now()).with_kind(self.kind);
        em.add_label("ptype", &self.ptype);
        em.add_label("probe", &self.probe);
        em.add_label("dst", target);
        for (k, v) in &self.additional_labels {
            em.add_label(k, v);
        }
        em
    }

    fn parse_line(&self, line: &str) -> Option<(String, Value, Vec<(String, String)>)> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        let value_str = parts.next()?;

        let mut labels = Vec::new();
        for tok in parts {
            let (k, v) = tok.split_once('=')?;
            labels.push((k.to_string(), v.to_string()));
        }

        let value = if let Some(template) = self.dists.get(name) {
            let mut dist = template.clone();
            for sample in value_str.split(',') {
                dist.add_sample(sample.trim().parse::<f64>().ok()?);
            }
            Value::Dist(dist)
        } else if let Ok(v) = value_str.parse::<i64>() {
            Value::Int(v)
        } else if let Ok(v) = value_str.parse::<f64>() {
            Value::Float(v)
        } else {
            Value::Str(value_str.trim_matches('"').to_string())
        };

        Some((name.to_string(), value, labels))
    }

    // Fold a freshly parsed sample into the target's running totals and
    // return a snapshot carrying the accumulated value of `name`.
    fn accumulate(
        &mut self,
        target: &str,
        em: &EventMetrics,
        name: &str,
    ) -> Result<EventMetrics, MetricsError> {
        let base = self.base_metrics(target);
        let acc = self.accumulated.entry(target.to_string()).or_insert(base);
        acc.timestamp = em.timestamp;

        let value = em
            .metric(name)
            .ok_or(MetricsError::MissingMetric("payload metric"))?;
        match acc.metric_mut(name) {
            Some(existing) => existing.add(value)?,
            None => acc.add_metric(name, value.clone()),
        }

        let mut snapshot = em.clone();
        if let Some(total) = acc.metric(name) {
            snapshot.add_metric(name, total.clone());
        }
        Ok(snapshot)
    }
}
