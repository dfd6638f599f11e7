use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Deserialize;

/// A probe target: a named endpoint with an optional port, an optional
/// pre-resolved address, and free-form labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Host or service name
    pub name: String,
    /// Port, if the probe needs one
    #[serde(default)]
    pub port: Option<u16>,
    /// Address to use instead of resolving `name`
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Target labels, available to probes via `@target.label.<k>@`
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Endpoint {
    /// Endpoint with just a name. Mostly useful in tests.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Stable identity for per-target bookkeeping: name, port and sorted
    /// labels. Two endpoints with the same key are the same target.
    pub fn key(&self) -> String {
        let mut key = self.name.clone();
        if let Some(port) = self.port {
            key.push_str(&format!(":{port}"));
        }
        for (k, v) in &self.labels {
            key.push_str(&format!("+{k}={v}"));
        }
        key
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}
