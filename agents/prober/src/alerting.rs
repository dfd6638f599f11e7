//! Per-probe alert handling.
//!
//! The handler watches each target's `total`/`success` counters, keeps a
//! sliding window over the most recent probe results, and raises an alert
//! when the window accumulates enough failures. Repeat notifications are
//! throttled; recovery silently clears the alert state (downstream
//! notifiers own recovery messaging, so no "cleared" notification is sent).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use fleetprober_core::metrics::{EventMetrics, Value};
use fleetprober_core::{Endpoint, MetricsError};

fn default_repeat_interval_sec() -> u32 {
    3600
}

/// When to raise an alert: `failures` failed probe results out of the last
/// `total`. A `total` of zero means "use `failures` as the window".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Failed results needed to alert
    pub failures: u32,
    /// Window size, in probe results
    pub total: u32,
}

impl Default for Condition {
    fn default() -> Self {
        // any single failure alerts
        Self {
            failures: 1,
            total: 1,
        }
    }
}

/// Notification throttling.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyConfig {
    /// Seconds between repeat notifications while a target stays failing.
    /// Zero re-notifies on every failing evaluation.
    #[serde(default = "default_repeat_interval_sec")]
    pub repeat_interval_sec: u32,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            repeat_interval_sec: default_repeat_interval_sec(),
        }
    }
}

/// Alert configuration attached to a probe.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertConf {
    /// Alert name; defaults to the probe name
    pub name: Option<String>,
    /// Raise condition; defaults to any single failure
    pub condition: Option<Condition>,
    /// Notification throttling
    pub notify: Option<NotifyConfig>,
}

/// A notification that a target entered (or remains in) a failing state.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertInfo {
    /// Alert name
    pub name: String,
    /// Probe that owns the alert
    pub probe_name: String,
    /// Failing target
    pub target: Endpoint,
    /// Condition threshold the window crossed
    pub failures: u32,
    /// Window size the condition evaluates over
    pub total: u32,
    /// Timestamp of the sample that first crossed the threshold
    pub failing_since: DateTime<Utc>,
    /// Stable id of this alert episode: unix seconds of `failing_since`
    pub condition_id: String,
}

#[derive(Debug, Default)]
struct TargetState {
    // last seen (total, success), for delta computation
    previous: Option<(i64, i64)>,
    // (total delta, failure delta) per recorded sample, newest at the back
    deltas: VecDeque<(i64, i64)>,
    alerted: bool,
    failing_since: Option<DateTime<Utc>>,
    condition_id: Option<String>,
    last_notified: Option<Instant>,
}

/// Ingests one probe's per-target samples and emits [`AlertInfo`]s on a
/// bounded channel. Not shared across tasks; the probe's result loop calls
/// [`AlertHandler::record`] serially.
#[derive(Debug)]
pub struct AlertHandler {
    name: String,
    probe_name: String,
    condition: Condition,
    repeat_interval: Duration,
    targets: HashMap<String, TargetState>,
    notify_tx: mpsc::Sender<AlertInfo>,
}

impl AlertHandler {
    /// Handler for `probe_name` with the given configuration, notifying on
    /// `notify_tx`.
    pub fn new(conf: &AlertConf, probe_name: &str, notify_tx: mpsc::Sender<AlertInfo>) -> Self {
        let notify = conf.notify.unwrap_or_default();
        Self {
            name: conf.name.clone().unwrap_or_else(|| probe_name.to_string()),
            probe_name: probe_name.to_string(),
            condition: conf.condition.unwrap_or_default(),
            repeat_interval: Duration::from_secs(notify.repeat_interval_sec.into()),
            targets: HashMap::new(),
            notify_tx,
        }
    }

    /// Window size in probe results.
    fn window(&self) -> i64 {
        if self.condition.total == 0 {
            self.condition.failures as i64
        } else {
            self.condition.total as i64
        }
    }

    /// Record one sample for `ep`. The sample must carry integer `total` and
    /// `success` metrics; the first sample for a target only seeds the delta
    /// base and never alerts.
    pub fn record(&mut self, ep: &Endpoint, em: &EventMetrics) -> Result<(), MetricsError> {
        let total = em
            .metric("total")
            .and_then(Value::int64)
            .ok_or(MetricsError::MissingMetric("total"))?;
        let success = em
            .metric("success")
            .and_then(Value::int64)
            .ok_or(MetricsError::MissingMetric("success"))?;

        let window = self.window();
        let state = self.targets.entry(ep.key()).or_default();

        let Some((prev_total, prev_success)) = state.previous else {
            state.previous = Some((total, success));
            return Ok(());
        };

        let dt = total - prev_total;
        let ds = success - prev_success;
        state.previous = Some((total, success));
        if dt < 0 || ds < 0 {
            // counter reset, probably a probe process restart; re-base and
            // start accumulating from scratch
            debug!(target = %ep, dt, ds, "counter reset, dropping window");
            state.deltas.clear();
            return Ok(());
        }

        state.deltas.push_back((dt, (dt - ds).max(0)));

        // Drop samples that no longer contribute to the window.
        while state.deltas.len() > 1 {
            let rest: i64 = state.deltas.iter().skip(1).map(|(t, _)| t).sum();
            if rest >= window {
                state.deltas.pop_front();
            } else {
                break;
            }
        }

        // Sum failures over the `window` most recent probe results. The
        // oldest retained sample may be only partially inside the window;
        // its failures are clamped to the part that is.
        let mut win_total = 0i64;
        let mut win_failures = 0i64;
        for (t, f) in state.deltas.iter().rev() {
            if win_total >= window {
                break;
            }
            let take = (*t).min(window - win_total);
            win_failures += (*f).min(take);
            win_total += take;
        }

        if win_total < window {
            // not enough history yet
            return Ok(());
        }

        if win_failures >= self.condition.failures as i64 {
            let first = !state.alerted;
            if first {
                state.alerted = true;
                state.failing_since = Some(em.timestamp);
                state.condition_id = Some(em.timestamp.timestamp().to_string());
            }
            let repeat_due = !first
                && state
                    .last_notified
                    .map_or(true, |at| at.elapsed() >= self.repeat_interval);

            if first || repeat_due {
                state.last_notified = Some(Instant::now());
                let failing_since = state.failing_since.unwrap_or(em.timestamp);
                let alert = AlertInfo {
                    name: self.name.clone(),
                    probe_name: self.probe_name.clone(),
                    target: ep.clone(),
                    failures: self.condition.failures,
                    total: window as u32,
                    failing_since,
                    condition_id: failing_since.timestamp().to_string(),
                };
                debug!(target = %ep, condition_id = %alert.condition_id, repeat = !first, "raising alert");
                if self.notify_tx.try_send(alert).is_err() {
                    warn!(target = %ep, "notification channel full, dropping alert");
                }
            }
        } else if state.alerted {
            debug!(target = %ep, "alert condition no longer met, clearing");
            state.alerted = false;
            state.failing_since = None;
            state.condition_id = None;
        }

        Ok(())
    }

    /// Number of targets currently in alerted state.
    pub fn active_alerts(&self) -> usize {
        self.targets.values().filter(|state| state.alerted).count()
    }

    /// Whether `ep` is currently alerted.
    pub fn alerted(&self, ep: &Endpoint) -> bool {
        self.targets
            .get(&ep.key())
            .map(|state| state.alerted)
            .unwrap_or(false)
    }
}
