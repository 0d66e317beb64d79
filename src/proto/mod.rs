//! Messages of the public API.
//!
//! Each message is a prost message, so it has a binary encoding, and it
//! derives serde with the canonical JSON mapping: lowerCamelCase field names,
//! every field emitted, and enums written by name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{MetricKind, Window};

/// Protobuf enums that are written by name in JSON.
pub trait NamedEnum {
    fn name_of(value: i32) -> Option<&'static str>;
    fn value_of(name: &str) -> Option<i32>;
}

macro_rules! named_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str_name(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)+
                }
            }

            pub fn from_str_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }

        impl NamedEnum for $ty {
            fn name_of(value: i32) -> Option<&'static str> {
                $ty::from_i32(value).map(|variant| variant.as_str_name())
            }

            fn value_of(name: &str) -> Option<i32> {
                $ty::from_str_name(name).map(i32::from)
            }
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MetricName {
    RequestRate = 0,
    SuccessRate = 1,
    Latency = 2,
}

named_enum!(MetricName {
    RequestRate => "REQUEST_RATE",
    SuccessRate => "SUCCESS_RATE",
    Latency => "LATENCY",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TimeWindow {
    TenMin = 0,
    TenSec = 1,
    OneMin = 2,
    OneHour = 3,
}

named_enum!(TimeWindow {
    TenMin => "TEN_MIN",
    TenSec => "TEN_SEC",
    OneMin => "ONE_MIN",
    OneHour => "ONE_HOUR",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CheckStatus {
    Ok = 0,
    Fail = 1,
    Error = 2,
}

named_enum!(CheckStatus {
    Ok => "OK",
    Fail => "FAIL",
    Error => "ERROR",
});

mod enum_json {
    use super::NamedEnum;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Name(String),
        Number(i32),
    }

    #[derive(Serialize)]
    #[serde(untagged)]
    enum Out {
        Name(&'static str),
        Number(i32),
    }

    fn out<E: NamedEnum>(value: i32) -> Out {
        E::name_of(value).map(Out::Name).unwrap_or(Out::Number(value))
    }

    fn parse<E: NamedEnum, DeError: Error>(raw: Raw) -> Result<i32, DeError> {
        match raw {
            Raw::Name(name) => E::value_of(&name)
                .ok_or_else(|| DeError::custom(format!("unknown enum value {:?}", name))),
            Raw::Number(value) => Ok(value),
        }
    }

    pub fn serialize<E: NamedEnum, S: Serializer>(value: &i32, s: S) -> Result<S::Ok, S::Error> {
        out::<E>(*value).serialize(s)
    }

    pub fn deserialize<'de, E: NamedEnum, D: Deserializer<'de>>(d: D) -> Result<i32, D::Error> {
        parse::<E, D::Error>(Raw::deserialize(d)?)
    }

    pub fn serialize_list<E: NamedEnum, S: Serializer>(
        values: &[i32],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.collect_seq(values.iter().map(|value| out::<E>(*value)))
    }

    pub fn deserialize_list<'de, E: NamedEnum, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Vec<i32>, D::Error> {
        Vec::<Raw>::deserialize(d)?
            .into_iter()
            .map(parse::<E, D::Error>)
            .collect()
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricRequest {
    #[prost(enumeration = "MetricName", repeated, tag = "1")]
    #[serde(
        serialize_with = "enum_json::serialize_list::<MetricName, _>",
        deserialize_with = "enum_json::deserialize_list::<MetricName, _>"
    )]
    pub metrics: Vec<i32>,
    #[prost(enumeration = "TimeWindow", tag = "2")]
    #[serde(
        serialize_with = "enum_json::serialize::<TimeWindow, _>",
        deserialize_with = "enum_json::deserialize::<TimeWindow, _>"
    )]
    pub window: i32,
    #[prost(string, tag = "3")]
    pub namespace: String,
    #[prost(string, tag = "4")]
    pub resource: String,
    #[prost(bool, tag = "5")]
    pub include_inventory: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricResponse {
    #[prost(message, repeated, tag = "1")]
    pub metrics: Vec<MetricSeries>,
    /// Causes of a partial failure; empty when every query succeeded.
    #[prost(string, repeated, tag = "2")]
    pub errors: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricSeries {
    #[prost(enumeration = "MetricName", tag = "1")]
    #[serde(
        serialize_with = "enum_json::serialize::<MetricName, _>",
        deserialize_with = "enum_json::deserialize::<MetricName, _>"
    )]
    pub name: i32,
    #[prost(string, tag = "2")]
    pub resource: String,
    #[prost(string, tag = "3")]
    pub identity: String,
    #[prost(btree_map = "string, string", tag = "4")]
    pub metadata: BTreeMap<String, String>,
    #[prost(message, repeated, tag = "5")]
    pub datapoints: Vec<MetricDatapoint>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricDatapoint {
    #[prost(message, optional, tag = "1")]
    pub value: Option<MetricValue>,
    #[prost(int64, tag = "2")]
    pub timestamp_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricValue {
    #[prost(oneof = "metric_value::Value", tags = "1, 2")]
    #[serde(flatten)]
    pub value: Option<metric_value::Value>,
}

pub mod metric_value {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum Value {
        #[prost(uint64, tag = "1")]
        Counter(u64),
        #[prost(double, tag = "2")]
        #[serde(with = "crate::models::float_json")]
        Gauge(f64),
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionInfo {
    #[prost(string, tag = "1")]
    pub release_version: String,
    #[prost(string, tag = "2")]
    pub build_date: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListPodsResponse {
    #[prost(message, repeated, tag = "1")]
    pub pods: Vec<Pod>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pod {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub namespace: String,
    #[prost(string, tag = "3")]
    pub pod_ip: String,
    #[prost(string, tag = "4")]
    pub deployment: String,
    #[prost(string, tag = "5")]
    pub status: String,
    #[prost(bool, tag = "6")]
    pub control_plane: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelfCheckRequest {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelfCheckResponse {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<CheckResult>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckResult {
    #[prost(string, tag = "1")]
    pub subsystem_name: String,
    #[prost(string, tag = "2")]
    pub check_description: String,
    #[prost(enumeration = "CheckStatus", tag = "3")]
    #[serde(
        serialize_with = "enum_json::serialize::<CheckStatus, _>",
        deserialize_with = "enum_json::deserialize::<CheckStatus, _>"
    )]
    pub status: i32,
    #[prost(string, tag = "4")]
    pub friendly_message_to_user: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TapRequest {
    #[prost(string, tag = "1")]
    pub target_pod: String,
    #[prost(string, tag = "2")]
    pub target_deployment: String,
    #[prost(float, tag = "3")]
    pub max_rps: f32,
    #[prost(string, tag = "4")]
    pub to_ip: String,
    #[prost(uint32, tag = "5")]
    pub to_port: u32,
    #[prost(string, tag = "6")]
    pub from_ip: String,
    #[prost(uint32, tag = "7")]
    pub from_port: u32,
    #[prost(string, tag = "8")]
    pub scheme: String,
    #[prost(string, tag = "9")]
    pub method: String,
    #[prost(string, tag = "10")]
    pub authority: String,
    #[prost(string, tag = "11")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TapEvent {
    #[prost(string, tag = "1")]
    pub source: String,
    #[prost(string, tag = "2")]
    pub destination: String,
    #[prost(btree_map = "string, string", tag = "3")]
    pub source_meta: BTreeMap<String, String>,
    #[prost(btree_map = "string, string", tag = "4")]
    pub destination_meta: BTreeMap<String, String>,
    #[prost(message, optional, tag = "5")]
    pub http: Option<TapHttpEvent>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TapHttpEvent {
    #[prost(oneof = "tap_http_event::Event", tags = "1, 2, 3")]
    #[serde(flatten)]
    pub event: Option<tap_http_event::Event>,
}

pub mod tap_http_event {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum Event {
        #[prost(message, tag = "1")]
        RequestInit(super::RequestInit),
        #[prost(message, tag = "2")]
        ResponseInit(super::ResponseInit),
        #[prost(message, tag = "3")]
        ResponseEnd(super::ResponseEnd),
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestInit {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(string, tag = "3")]
    pub scheme: String,
    #[prost(string, tag = "4")]
    pub authority: String,
    #[prost(string, tag = "5")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseInit {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(uint64, tag = "2")]
    pub since_request_init_ms: u64,
    #[prost(uint32, tag = "3")]
    pub http_status: u32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseEnd {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(uint64, tag = "2")]
    pub since_response_init_ms: u64,
    #[prost(uint64, tag = "3")]
    pub response_bytes: u64,
    #[prost(uint32, tag = "4")]
    pub grpc_status: u32,
}

impl From<MetricName> for MetricKind {
    fn from(name: MetricName) -> Self {
        match name {
            MetricName::RequestRate => MetricKind::RequestRate,
            MetricName::SuccessRate => MetricKind::SuccessRate,
            MetricName::Latency => MetricKind::Latency,
        }
    }
}

impl From<MetricKind> for MetricName {
    fn from(kind: MetricKind) -> Self {
        match kind {
            MetricKind::RequestRate => MetricName::RequestRate,
            MetricKind::SuccessRate => MetricName::SuccessRate,
            MetricKind::Latency => MetricName::Latency,
        }
    }
}

impl From<TimeWindow> for Window {
    fn from(window: TimeWindow) -> Self {
        match window {
            TimeWindow::TenSec => Window::TenSeconds,
            TimeWindow::OneMin => Window::OneMinute,
            TimeWindow::TenMin => Window::TenMinutes,
            TimeWindow::OneHour => Window::OneHour,
        }
    }
}

impl From<Window> for TimeWindow {
    fn from(window: Window) -> Self {
        match window {
            Window::TenSeconds => TimeWindow::TenSec,
            Window::OneMinute => TimeWindow::OneMin,
            Window::TenMinutes => TimeWindow::TenMin,
            Window::OneHour => TimeWindow::OneHour,
        }
    }
}
