//! Configuration for the prober agent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Result};
use serde::Deserialize;

use fleetprober_base::surfacers::cloud::CloudSurfacerConf;
use fleetprober_base::Settings;
use fleetprober_core::metrics::Distribution;
use fleetprober_core::validators::{RegexValidator, Validator};
use fleetprober_core::{Endpoint, ProbeOptions, StaticTargets};

use crate::probes::external::ExternalProbeConf;
use crate::alerting::AlertConf;

fn default_interval_sec() -> u64 {
    10
}

fn default_timeout_sec() -> u64 {
    10
}

/// A regex check against probe payloads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorConf {
    /// Validator name, used in failure counters
    pub name: String,
    /// Pattern the payload must match
    pub regex: String,
}

/// One configured probe.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSettings {
    /// Probe name, unique within the agent
    pub name: String,
    /// External command configuration
    #[serde(flatten)]
    pub external: ExternalProbeConf,
    /// Seconds between probe cycles
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u64,
    /// Cycle deadline, shared across the cycle's targets
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    /// Latency granularity: `s`, `ms`, `us` or `ns`
    #[serde(default)]
    pub latency_unit: Option<String>,
    /// When set, latency is exported as a histogram over these buckets
    /// (comma-separated upper bounds)
    #[serde(default)]
    pub latency_distribution: Option<String>,
    /// Labels added to every sample this probe emits
    #[serde(default)]
    pub additional_labels: BTreeMap<String, String>,
    /// Payload validators
    #[serde(default)]
    pub validators: Vec<ValidatorConf>,
    /// Fixed targets to probe
    #[serde(default)]
    pub targets: Vec<Endpoint>,
    /// Alerting on this probe's results
    #[serde(default)]
    pub alert: Option<AlertConf>,
}

impl ProbeSettings {
    fn parse_latency_unit(&self) -> Result<Duration> {
        Ok(match self.latency_unit.as_deref() {
            None | Some("ms") => Duration::from_millis(1),
            Some("s") => Duration::from_secs(1),
            Some("us") => Duration::from_micros(1),
            Some("ns") => Duration::from_nanos(1),
            Some(other) => bail!("invalid latency unit {other:?}"),
        })
    }

    /// Build the probe's [`ProbeOptions`] from these settings.
    pub fn probe_options(&self) -> Result<ProbeOptions> {
        let validators = self
            .validators
            .iter()
            .map(|v| {
                RegexValidator::new(&v.name, &v.regex)
                    .map(|rv| Arc::new(rv) as Arc<dyn Validator>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ProbeOptions {
            interval: Duration::from_secs(self.interval_sec),
            timeout: Duration::from_secs(self.timeout_sec),
            latency_unit: self.parse_latency_unit()?,
            latency_dist: self
                .latency_distribution
                .as_deref()
                .map(Distribution::from_spec)
                .transpose()?,
            additional_labels: self
                .additional_labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            validators,
            targets: Arc::new(StaticTargets::new(self.targets.clone())),
        })
    }
}

/// Cloud surfacer settings: the surfacer config plus the backend bearer
/// token (acquired out-of-band, e.g. by the deployment environment).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSurfacerSettings {
    /// Surfacer configuration
    #[serde(flatten)]
    pub conf: CloudSurfacerConf,
    /// Bearer token for the monitoring API
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Full prober agent settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProberSettings {
    /// Shared agent settings
    #[serde(flatten)]
    pub base: Settings,
    /// Probes to run
    #[serde(default)]
    pub probes: Vec<ProbeSettings>,
    /// Cloud surfacer; samples are only logged when unset
    #[serde(default)]
    pub surfacer: Option<CloudSurfacerSettings>,
}

impl AsRef<Settings> for ProberSettings {
    fn as_ref(&self) -> &Settings {
        &self.base
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probes::external::Mode;

    #[test]
    fn probe_settings_deserialize_and_build_options() {
        let json = serde_json::json!({
            "name": "ping-fleet",
            "command": "/usr/bin/probe --target=@target@",
            "mode": "server",
            "intervalSec": 30,
            "timeoutSec": 5,
            "latencyUnit": "us",
            "latencyDistribution": "1,2,4,8",
            "additionalLabels": {"env": "prod"},
            "validators": [{"name": "has-ok", "regex": "OK"}],
            "targets": [{"name": "web1", "port": 8080}]
        });
        let settings: ProbeSettings = serde_json::from_value(json).unwrap();
        assert_eq!(settings.external.mode, Mode::Server);
        assert_eq!(settings.external.command, "/usr/bin/probe --target=@target@");

        let opts = settings.probe_options().unwrap();
        assert_eq!(opts.interval, Duration::from_secs(30));
        assert_eq!(opts.timeout, Duration::from_secs(5));
        assert_eq!(opts.latency_unit, Duration::from_micros(1));
        assert!(opts.latency_dist.is_some());
        assert_eq!(opts.validators.len(), 1);
        assert_eq!(opts.targets.list_endpoints()[0].name, "web1");
    }

    #[test]
    fn bad_latency_unit_is_rejected() {
        let json = serde_json::json!({
            "name": "p",
            "command": "true",
            "mode": "once",
            "latencyUnit": "fortnights"
        });
        let settings: ProbeSettings = serde_json::from_value(json).unwrap();
        assert!(settings.probe_options().is_err());
    }
}
