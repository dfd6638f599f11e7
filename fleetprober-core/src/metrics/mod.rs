//! In-memory representation of probe samples.
//!
//! An [`EventMetrics`] is one timestamped sample: an ordered set of labels
//! plus named metric values of mixed variants. Probes produce them, the
//! alerting layer and surfacers consume them. Values are plain data; once a
//! sample is handed to the data channel it is never mutated in place.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::MetricsError;

mod distribution;
pub use distribution::Distribution;

pub mod payload;

/// Whether a sample's values are instantaneous or accumulate over the
/// process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Point-in-time values
    Gauge,
    /// Monotonic counters since probe start
    Cumulative,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Gauge => write!(f, "GAUGE"),
            Kind::Cumulative => write!(f, "CUMULATIVE"),
        }
    }
}

/// A map-valued metric: named counters keyed by a string, e.g. HTTP response
/// codes or per-validator failure counts. The key-name labels what the keys
/// are ("code", "validator", ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapValue {
    /// What the map's keys represent; becomes a label when surfaced
    pub key_name: String,
    entries: BTreeMap<String, i64>,
}

impl MapValue {
    /// New empty map whose keys are described by `key_name`.
    pub fn new(key_name: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Increment `key` by `delta`, creating it at zero first if absent.
    pub fn inc_key_by(&mut self, key: &str, delta: i64) {
        *self.entries.entry(key.to_string()).or_insert(0) += delta;
    }

    /// Ensure `key` exists, without changing its count.
    pub fn ensure_key(&mut self, key: &str) {
        self.entries.entry(key.to_string()).or_insert(0);
    }

    /// Counter for `key`, zero if absent.
    pub fn get(&self, key: &str) -> i64 {
        self.entries.get(key).copied().unwrap_or(0)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl fmt::Display for MapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map:{}", self.key_name)?;
        for (k, v) in &self.entries {
            write!(f, ",{k}:{v}")?;
        }
        Ok(())
    }
}

/// A metric value. Probes may emit any variant; consumers dispatch on the
/// tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed integer counter or gauge
    Int(i64),
    /// Floating point counter or gauge
    Float(f64),
    /// Free-form string, e.g. a version
    Str(String),
    /// Named counters keyed by string
    Map(MapValue),
    /// Histogram with explicit buckets
    Dist(Distribution),
}

impl Value {
    /// Integer view of a numeric value. `None` for non-numeric variants.
    pub fn int64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Float view of a numeric value. `None` for non-numeric variants.
    pub fn float64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Add a float observation. For scalars this accumulates; for
    /// distributions it records a sample.
    pub fn add_f64(&mut self, sample: f64) -> Result<(), MetricsError> {
        match self {
            Value::Int(v) => *v += sample as i64,
            Value::Float(v) => *v += sample,
            Value::Dist(d) => d.add_sample(sample),
            other => {
                return Err(MetricsError::TypeMismatch {
                    left: other.variant_name(),
                    right: "float",
                })
            }
        }
        Ok(())
    }

    /// Merge another value of the same variant into this one. Used when
    /// aggregating payload metrics across probe runs.
    pub fn add(&mut self, other: &Value) -> Result<(), MetricsError> {
        match (&mut *self, other) {
            (Value::Int(a), Value::Int(b)) => *a += b,
            (Value::Float(a), Value::Float(b)) => *a += b,
            (Value::Float(a), Value::Int(b)) => *a += *b as f64,
            (Value::Str(a), Value::Str(b)) => *a = b.clone(),
            (Value::Map(a), Value::Map(b)) => {
                for k in b.keys().map(str::to_string).collect::<Vec<_>>() {
                    a.inc_key_by(&k, b.get(&k));
                }
            }
            (Value::Dist(a), Value::Dist(b)) => a.add(b)?,
            (left, right) => {
                return Err(MetricsError::TypeMismatch {
                    left: left.variant_name(),
                    right: right.variant_name(),
                })
            }
        }
        Ok(())
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Map(_) => "map",
            Value::Dist(_) => "dist",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "\"{v}\""),
            Value::Map(v) => write!(f, "{v}"),
            Value::Dist(v) => write!(f, "{v}"),
        }
    }
}

/// One timestamped sample of named metric values plus labels.
///
/// Label and metric iteration order is insertion order and is stable; the
/// surfacer relies on this for cache keys. Metric names are unique within a
/// sample; re-adding a name replaces its value.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMetrics {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Gauge or cumulative; one kind per sample
    pub kind: Kind,
    /// Granularity of the sample's latency metric
    pub latency_unit: Duration,
    labels: Vec<(String, String)>,
    metrics: Vec<(String, Value)>,
}

impl EventMetrics {
    /// New cumulative sample at `timestamp` with millisecond latency unit.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind: Kind::Cumulative,
            latency_unit: Duration::from_millis(1),
            labels: Vec::new(),
            metrics: Vec::new(),
        }
    }

    /// Set the sample kind.
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Append a metric, replacing any existing value under the same name.
    pub fn with_metric(mut self, name: impl Into<String>, value: Value) -> Self {
        self.add_metric(name, value);
        self
    }

    /// Append a label, updating in place if the key already exists.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_label(key, value);
        self
    }

    /// See [`EventMetrics::with_metric`].
    pub fn add_metric(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.metrics.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.metrics.push((name, value));
        }
    }

    /// See [`EventMetrics::with_label`].
    pub fn add_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.labels.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.labels.push((key, value));
        }
    }

    /// Value of the named metric.
    pub fn metric(&self, name: &str) -> Option<&Value> {
        self.metrics.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Mutable value of the named metric.
    pub fn metric_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.metrics
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Value of the named label.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Metric names in insertion order.
    pub fn metric_keys(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|(n, _)| n.as_str())
    }

    /// `(key, value)` labels in insertion order.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for EventMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp.timestamp(), self.kind)?;
        for (k, v) in &self.labels {
            write!(f, " labels.{k}={v}")?;
        }
        for (name, value) in &self.metrics {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn labels_keep_insertion_order() {
        let em = EventMetrics::new(Utc::now())
            .with_label("zzz", "1")
            .with_label("aaa", "2")
            .with_label("mmm", "3");
        let keys: Vec<_> = em.labels().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zzz", "aaa", "mmm"]);
    }

    #[test]
    fn re_adding_metric_replaces_value() {
        let mut em = EventMetrics::new(Utc::now()).with_metric("total", Value::Int(1));
        em.add_metric("total", Value::Int(5));
        assert_eq!(em.metric("total"), Some(&Value::Int(5)));
        assert_eq!(em.metric_keys().count(), 1);
    }

    #[test]
    fn value_add_mismatch_is_an_error() {
        let mut v = Value::Int(1);
        assert!(v.add(&Value::Str("x".into())).is_err());
        assert!(v.add(&Value::Int(2)).is_ok());
        assert_eq!(v, Value::Int(3));
    }

    #[test]
    fn map_value_accumulates() {
        let mut m = MapValue::new("code");
        m.inc_key_by("200", 98);
        m.inc_key_by("500", 2);
        m.inc_key_by("200", 1);
        assert_eq!(m.get("200"), 99);
        assert_eq!(m.to_string(), "map:code,200:99,500:2");
    }
}
