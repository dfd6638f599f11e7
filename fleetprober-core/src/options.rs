use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::metrics::Distribution;
use crate::validators::Validator;
use crate::{Endpoint, TargetError};

/// Source of probe targets. Discovery itself lives outside this workspace;
/// probes only ever see this contract.
#[async_trait]
pub trait TargetProvider: Send + Sync + Debug {
    /// Current set of endpoints to probe. Probes call this once per cycle,
    /// so membership changes take effect on the next cycle.
    fn list_endpoints(&self) -> Vec<Endpoint>;

    /// Resolve a target name to an address, for `@address@` substitution.
    async fn resolve(&self, name: &str) -> Result<IpAddr, TargetError>;
}

/// A fixed list of endpoints, resolved from their configured addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticTargets {
    endpoints: Vec<Endpoint>,
}

impl StaticTargets {
    /// Provider over a fixed endpoint list.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl TargetProvider for StaticTargets {
    fn list_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.clone()
    }

    async fn resolve(&self, name: &str) -> Result<IpAddr, TargetError> {
        let ep = self
            .endpoints
            .iter()
            .find(|ep| ep.name == name)
            .ok_or_else(|| TargetError::UnknownTarget(name.to_string()))?;
        ep.ip.ok_or_else(|| TargetError::Unresolvable(name.to_string()))
    }
}

/// Options shared by all probe types: scheduling, latency accounting,
/// validators and the target source.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Time between probe cycles
    pub interval: Duration,
    /// Deadline for one whole cycle, shared across its targets
    pub timeout: Duration,
    /// Granularity used when exporting latency
    pub latency_unit: Duration,
    /// When set, latency is recorded into this distribution instead of a
    /// scalar sum
    pub latency_dist: Option<Distribution>,
    /// Labels added to every sample the probe emits
    pub additional_labels: Vec<(String, String)>,
    /// Payload validators
    pub validators: Vec<Arc<dyn Validator>>,
    /// Target source
    pub targets: Arc<dyn TargetProvider>,
}

impl ProbeOptions {
    /// Options with the given target source and defaults everywhere else:
    /// 10s interval and timeout, millisecond latency unit, no validators.
    pub fn new(targets: Arc<dyn TargetProvider>) -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(10),
            latency_unit: Duration::from_millis(1),
            latency_dist: None,
            additional_labels: Vec::new(),
            validators: Vec::new(),
            targets,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn static_targets_resolve_from_configured_ip() {
        let targets = StaticTargets::new(vec![
            Endpoint {
                name: "web1".into(),
                ip: Some("10.0.0.7".parse().unwrap()),
                ..Default::default()
            },
            Endpoint::new("web2"),
        ]);

        assert_eq!(targets.list_endpoints().len(), 2);
        assert_eq!(
            targets.resolve("web1").await.unwrap(),
            "10.0.0.7".parse::<IpAddr>().unwrap()
        );
        assert!(matches!(
            targets.resolve("web2").await,
            Err(TargetError::Unresolvable(_))
        ));
        assert!(matches!(
            targets.resolve("nope").await,
            Err(TargetError::UnknownTarget(_))
        ));
    }
}
