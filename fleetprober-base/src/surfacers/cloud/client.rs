//! Wire types and HTTP client for the cloud monitoring v3 REST API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use fleetprober_core::metrics::Distribution;

use crate::surfacers::SurfacerError;

/// Identifies a metric stream: the fully-qualified type URL plus its labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metric {
    /// Metric type URL, e.g. `custom.googleapis.com/fleetprober/success`
    #[serde(rename = "type")]
    pub r#type: String,
    /// Metric labels
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// The monitored resource writes are attributed to.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitoredResource {
    /// Resource type, e.g. `gce_instance`
    #[serde(rename = "type")]
    pub r#type: String,
    /// Resource labels, e.g. `instance_id` and `zone`
    pub labels: BTreeMap<String, String>,
}

/// Half-open window a point applies to, RFC3339 with nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInterval {
    /// Interval start
    pub start_time: String,
    /// Interval end
    pub end_time: String,
}

/// Histogram payload for `DISTRIBUTION`-typed series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionValue {
    /// Number of observations
    pub count: u64,
    /// Mean of observations
    pub mean: f64,
    /// Bucket layout
    pub bucket_options: BucketOptions,
    /// Per-bucket observation counts
    pub bucket_counts: Vec<u64>,
}

/// Explicit bucket layout wrapper.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketOptions {
    /// Explicit bucket bounds
    pub explicit_buckets: ExplicitBuckets,
}

/// Explicit bucket bounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExplicitBuckets {
    /// Bucket upper bounds
    pub bounds: Vec<f64>,
}

impl From<&Distribution> for DistributionValue {
    fn from(dist: &Distribution) -> Self {
        Self {
            count: dist.count(),
            mean: dist.mean(),
            bucket_options: BucketOptions {
                explicit_buckets: ExplicitBuckets {
                    bounds: dist.bounds().to_vec(),
                },
            },
            bucket_counts: dist.counts().to_vec(),
        }
    }
}

/// Exactly one of the value fields is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedValue {
    /// Scalar value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub double_value: Option<f64>,
    /// Histogram value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution_value: Option<DistributionValue>,
}

impl TypedValue {
    /// A `DOUBLE` value.
    pub fn double(v: f64) -> Self {
        Self {
            double_value: Some(v),
            ..Default::default()
        }
    }

    /// A `DISTRIBUTION` value.
    pub fn distribution(v: DistributionValue) -> Self {
        Self {
            distribution_value: Some(v),
            ..Default::default()
        }
    }
}

/// One interval + value observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Point {
    /// Window the value applies to
    pub interval: TimeInterval,
    /// The observed value
    pub value: TypedValue,
}

/// A single time series write: metric identity, resource, kind and exactly
/// one point.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeries {
    /// Metric identity
    pub metric: Metric,
    /// Resource the series is attributed to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<MonitoredResource>,
    /// `GAUGE` or `CUMULATIVE`
    pub metric_kind: String,
    /// `DOUBLE` or `DISTRIBUTION`
    pub value_type: String,
    /// Unit, e.g. `ms`; `1` for plain numbers
    pub unit: String,
    /// The single data point
    pub points: Vec<Point>,
}

/// Declares a metric's labels, kind, value type and unit ahead of the first
/// write, so the backend records units (auto-created descriptors don't).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptor {
    /// Full descriptor resource name
    pub name: String,
    /// Metric type URL
    #[serde(rename = "type")]
    pub r#type: String,
    /// `GAUGE` or `CUMULATIVE`
    pub metric_kind: String,
    /// Declared labels
    pub labels: Vec<LabelDescriptor>,
    /// Unit
    pub unit: String,
    /// `DOUBLE` or `DISTRIBUTION`
    pub value_type: String,
}

/// One declared label on a metric descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDescriptor {
    /// Label key
    pub key: String,
    /// Always `STRING` for probe labels
    pub value_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimeSeriesRequest {
    time_series: Vec<TimeSeries>,
}

/// Client seam for the monitoring backend, mockable in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MonitoringClient: Send + Sync {
    /// Write a batch of time series.
    async fn create_time_series(&self, time_series: Vec<TimeSeries>) -> Result<(), SurfacerError>;

    /// Register a metric descriptor.
    async fn create_metric_descriptor(
        &self,
        descriptor: MetricDescriptor,
    ) -> Result<(), SurfacerError>;
}

/// REST client against the monitoring v3 API. Credential acquisition happens
/// outside this workspace; the bearer token is handed in ready to use.
#[derive(Debug)]
pub struct HttpMonitoringClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
    auth_token: String,
}

impl HttpMonitoringClient {
    const DEFAULT_BASE_URL: &'static str = "https://monitoring.googleapis.com/v3";

    /// Client for `project`, authenticating with `auth_token`.
    pub fn new(project: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self::with_base_url(Self::DEFAULT_BASE_URL, project, auth_token)
    }

    /// Client pointed at a non-default API endpoint, for tests and emulators.
    pub fn with_base_url(
        base_url: impl Into<String>,
        project: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            project: project.into(),
            auth_token: auth_token.into(),
        }
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<(), SurfacerError> {
        let url = format!("{}/projects/{}/{path}", self.base_url, self.project);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.auth_token)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(SurfacerError::Api {
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl MonitoringClient for HttpMonitoringClient {
    async fn create_time_series(&self, time_series: Vec<TimeSeries>) -> Result<(), SurfacerError> {
        self.post("timeSeries", &CreateTimeSeriesRequest { time_series })
            .await
    }

    async fn create_metric_descriptor(
        &self,
        descriptor: MetricDescriptor,
    ) -> Result<(), SurfacerError> {
        self.post("metricDescriptors", &descriptor).await
    }
}

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";

async fn metadata_value(http: &reqwest::Client, path: &str) -> Option<String> {
    http.get(format!("{METADATA_BASE}/{path}"))
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .text()
        .await
        .ok()
}

/// Detect the `gce_instance` monitored resource from the GCE metadata
/// server. Returns `None` off-GCE (the lookup times out quickly).
pub async fn detect_gce_resource(project: &str) -> Option<MonitoredResource> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
        .ok()?;

    let instance_id = metadata_value(&http, "instance/id").await?;
    // zone is returned as projects/<num>/zones/<zone>
    let zone_path = metadata_value(&http, "instance/zone").await?;
    let zone = zone_path.rsplit('/').next().unwrap_or(&zone_path).to_string();
    debug!(project, instance_id, zone, "detected gce_instance resource");

    let mut labels = BTreeMap::new();
    labels.insert("project_id".to_string(), project.to_string());
    labels.insert("instance_id".to_string(), instance_id);
    labels.insert("zone".to_string(), zone);
    Some(MonitoredResource {
        r#type: "gce_instance".to_string(),
        labels,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn time_series_serializes_to_the_v3_shape() {
        let mut labels = BTreeMap::new();
        labels.insert("dst".to_string(), "web1".to_string());
        let ts = TimeSeries {
            metric: Metric {
                r#type: "custom.googleapis.com/fleetprober/total".to_string(),
                labels,
            },
            resource: None,
            metric_kind: "CUMULATIVE".to_string(),
            value_type: "DOUBLE".to_string(),
            unit: "1".to_string(),
            points: vec![Point {
                interval: TimeInterval {
                    start_time: "1970-01-01T00:00:00.000000000Z".to_string(),
                    end_time: "1970-01-01T00:00:10.000000000Z".to_string(),
                },
                value: TypedValue::double(5.0),
            }],
        };

        let json = serde_json::to_value(&ts).unwrap();
        assert_eq!(json["metric"]["type"], "custom.googleapis.com/fleetprober/total");
        assert_eq!(json["metricKind"], "CUMULATIVE");
        assert_eq!(json["points"][0]["value"]["doubleValue"], 5.0);
        assert_eq!(
            json["points"][0]["interval"]["startTime"],
            "1970-01-01T00:00:00.000000000Z"
        );
        // unset resource and distribution value stay off the wire
        assert!(json.get("resource").is_none());
        assert!(json["points"][0]["value"].get("distributionValue").is_none());
    }

    #[test]
    fn distribution_value_from_distribution() {
        let mut dist = Distribution::from_spec("1,2,4").unwrap();
        for s in [0.5, 1.5, 3.0, 9.0] {
            dist.add_sample(s);
        }
        let dv = DistributionValue::from(&dist);
        assert_eq!(dv.count, 4);
        assert_eq!(dv.mean, 3.5);
        assert_eq!(dv.bucket_counts, vec![1, 1, 1, 1]);
        assert_eq!(dv.bucket_options.explicit_buckets.bounds, vec![1.0, 2.0, 4.0]);
    }
}
