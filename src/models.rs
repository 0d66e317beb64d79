use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::{GatewayError, Result};

/// Namespace used when a caller leaves the namespace empty.
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleValue {
    #[serde(with = "float_json")]
    pub value: f64,
    pub timestamp_ms: i64,
}

/// JSON for `f64` that keeps non-finite values: `"NaN"`, `"Infinity"` and
/// `"-Infinity"` are written as strings, the way proto3 JSON does.
pub(crate) mod float_json {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        match *value {
            v if v.is_nan() => s.serialize_str("NaN"),
            v if v == f64::INFINITY => s.serialize_str("Infinity"),
            v if v == f64::NEG_INFINITY => s.serialize_str("-Infinity"),
            v => s.serialize_f64(v),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        d.deserialize_any(FloatVisitor)
    }

    struct FloatVisitor;

    impl<'de> Visitor<'de> for FloatVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number, \"NaN\", \"Infinity\" or \"-Infinity\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            match v {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => other
                    .parse()
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(other), &self)),
            }
        }
    }
}

/// A single metric observation as returned by the metrics backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "values")]
    pub value: Option<SampleValue>,
}

impl LabeledSample {
    pub fn new(labels: BTreeMap<String, String>, value: f64, timestamp_ms: i64) -> Self {
        Self {
            labels,
            value: Some(SampleValue {
                value,
                timestamp_ms,
            }),
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// Outcome of one backend call.
pub type QueryResult = Result<Vec<LabeledSample>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    RequestRate,
    SuccessRate,
    Latency,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::RequestRate => "request_rate",
            MetricKind::SuccessRate => "success_rate",
            MetricKind::Latency => "latency",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Deployment,
    Pod,
}

impl ResourceType {
    /// Every resource type that `all` expands to.
    pub const ALL: [ResourceType; 2] = [ResourceType::Deployment, ResourceType::Pod];

    /// Label the metrics store groups by to yield one series per resource.
    ///
    /// Pods are grouped by template hash since individual pod names do not
    /// survive rescheduling.
    pub fn grouping_label(self) -> &'static str {
        match self {
            ResourceType::Deployment => "k8s_deployment",
            ResourceType::Pod => "k8s_pod_template_hash",
        }
    }

    pub fn category(self) -> &'static str {
        match self {
            ResourceType::Deployment => "deployments",
            ResourceType::Pod => "pods",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
    All,
    Single(ResourceType),
}

impl ResourceScope {
    pub fn resource_types(self) -> Vec<ResourceType> {
        match self {
            ResourceScope::All => ResourceType::ALL.to_vec(),
            ResourceScope::Single(resource) => vec![resource],
        }
    }
}

impl FromStr for ResourceScope {
    type Err = GatewayError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "all" => Ok(ResourceScope::All),
            "deployments" | "deployment" => Ok(ResourceScope::Single(ResourceType::Deployment)),
            "pods" | "pod" => Ok(ResourceScope::Single(ResourceType::Pod)),
            other => Err(GatewayError::InvalidResource(format!("{:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Window {
    TenSeconds,
    OneMinute,
    #[default]
    TenMinutes,
    OneHour,
}

impl Window {
    /// Range selector duration in the query language.
    pub fn as_range(self) -> &'static str {
        match self {
            Window::TenSeconds => "10s",
            Window::OneMinute => "1m",
            Window::TenMinutes => "10m",
            Window::OneHour => "1h",
        }
    }
}

impl FromStr for Window {
    type Err = GatewayError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "10s" => Ok(Window::TenSeconds),
            "1m" => Ok(Window::OneMinute),
            "10m" => Ok(Window::TenMinutes),
            "1h" => Ok(Window::OneHour),
            other => Err(GatewayError::Decode(format!(
                "unsupported window {:?}, expected one of 10s, 1m, 10m, 1h",
                other
            ))),
        }
    }
}

/// Normalized intent of one stat call.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRequest {
    pub scope: ResourceScope,
    pub namespace: String,
    pub metrics: BTreeSet<MetricKind>,
    pub window: Window,
    pub include_inventory: bool,
}

impl AggregationRequest {
    pub fn new(
        scope: ResourceScope,
        namespace: impl Into<String>,
        metrics: impl IntoIterator<Item = MetricKind>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            scope,
            namespace: if namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                namespace
            },
            metrics: metrics.into_iter().collect(),
            window: Window::default(),
            include_inventory: false,
        }
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    pub fn with_inventory(mut self, include_inventory: bool) -> Self {
        self.include_inventory = include_inventory;
        self
    }
}

/// One resource's datapoints within a series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesEntry {
    pub labels: BTreeMap<String, String>,
    pub datapoints: Vec<SampleValue>,
}

impl From<&SeriesEntry> for LabeledSample {
    fn from(entry: &SeriesEntry) -> Self {
        LabeledSample {
            labels: entry.labels.clone(),
            value: entry.datapoints.last().copied(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeries {
    pub kind: MetricKind,
    pub resource: ResourceType,
    /// Keyed by resource identity (deployment name or pod template hash).
    pub entries: BTreeMap<String, SeriesEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationResponse {
    pub series: Vec<MetricSeries>,
}

impl AggregationResponse {
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn series(&self, kind: MetricKind, resource: ResourceType) -> Option<&MetricSeries> {
        self.series
            .iter()
            .find(|series| series.kind == kind && series.resource == resource)
    }

    /// Flattens one metric kind into `category -> identity -> sample`.
    pub fn by_category(&self, kind: MetricKind) -> NewStatResponse {
        let mut result = NewStatResponse::new();
        for series in self.series.iter().filter(|series| series.kind == kind) {
            let category = result.entry(series.resource.category().to_string()).or_default();
            for (identity, entry) in &series.entries {
                category.insert(identity.clone(), LabeledSample::from(entry));
            }
        }
        result
    }
}

/// Body of the ad-hoc stat route.
pub type NewStatResponse = BTreeMap<String, BTreeMap<String, LabeledSample>>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scope_parsing() {
        assert_eq!("all".parse::<ResourceScope>().unwrap(), ResourceScope::All);
        assert_eq!(
            "pods".parse::<ResourceScope>().unwrap(),
            ResourceScope::Single(ResourceType::Pod)
        );
        let err = "services".parse::<ResourceScope>().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResource(_)));
    }

    #[test]
    fn empty_namespace_defaults() {
        let req = AggregationRequest::new(ResourceScope::All, "", [MetricKind::RequestRate]);
        assert_eq!(req.namespace, DEFAULT_NAMESPACE);
        assert_eq!(req.window, Window::TenMinutes);
    }

    #[test]
    fn new_stat_shape_round_trips() {
        let mut labels = BTreeMap::new();
        labels.insert("k8s_deployment".to_string(), "web".to_string());
        let mut entries = BTreeMap::new();
        entries.insert(
            "web".to_string(),
            SeriesEntry {
                labels,
                datapoints: vec![SampleValue {
                    value: 1.5,
                    timestamp_ms: 1_700_000_000_000,
                }],
            },
        );
        entries.insert("idle".to_string(), SeriesEntry::default());
        let response = AggregationResponse {
            series: vec![MetricSeries {
                kind: MetricKind::RequestRate,
                resource: ResourceType::Deployment,
                entries,
            }],
        };

        let shaped = response.by_category(MetricKind::RequestRate);
        let encoded = serde_json::to_string(&shaped).unwrap();
        let decoded: NewStatResponse = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, shaped);
        assert_eq!(decoded["deployments"]["idle"].value, None);
        assert_eq!(decoded["deployments"]["web"].label("k8s_deployment"), Some("web"));
    }

    #[test]
    fn non_finite_samples_survive_json() {
        let mut labels = BTreeMap::new();
        labels.insert("k8s_deployment".to_string(), "idle".to_string());
        let mut entries = BTreeMap::new();
        entries.insert(
            "idle".to_string(),
            SeriesEntry {
                labels,
                datapoints: vec![SampleValue {
                    value: f64::NAN,
                    timestamp_ms: 1,
                }],
            },
        );
        let response = AggregationResponse {
            series: vec![MetricSeries {
                kind: MetricKind::SuccessRate,
                resource: ResourceType::Deployment,
                entries,
            }],
        };

        let shaped = response.by_category(MetricKind::SuccessRate);
        let encoded = serde_json::to_string(&shaped).unwrap();
        assert!(encoded.contains(r#""value":"NaN""#));
        let decoded: NewStatResponse = serde_json::from_str(&encoded).unwrap();
        assert!(decoded["deployments"]["idle"].value.unwrap().value.is_nan());

        for (value, text) in [(f64::INFINITY, "Infinity"), (f64::NEG_INFINITY, "-Infinity")] {
            let sample = SampleValue {
                value,
                timestamp_ms: 1,
            };
            let encoded = serde_json::to_value(sample).unwrap();
            assert_eq!(encoded["value"], text);
            assert_eq!(serde_json::from_value::<SampleValue>(encoded).unwrap(), sample);
        }

        let plain: SampleValue = serde_json::from_str(r#"{"value":3,"timestamp_ms":1}"#).unwrap();
        assert_eq!(plain.value, 3.0);
    }
}
