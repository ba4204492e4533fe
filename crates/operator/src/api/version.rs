use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, EnvVar, HostAlias, ResourceRequirements, Toleration};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `minReplicas` value marking a version whose workload and autoscaler must be removed.
pub const REMOVED: i32 = -1;

/// Kind of service the app is; gateways and services expose a diagnostics port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppRole {
    Gateway,
    Service,
    Worker,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Grpc,
    #[serde(rename = "none")]
    Plain,
}

impl Protocol {
    /// Prefix of the Service port name; Istio sniffs the protocol from it.
    pub fn port_prefix(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Grpc => "grpc",
            Protocol::Plain => "tcp",
        }
    }
}

/// Who owns the replica count: our autoscaler or something outside the operator.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScalingEngine {
    #[default]
    Hpa,
    External,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, JsonSchema, PartialEq, Eq)]
pub enum RolloutKind {
    #[default]
    #[serde(alias = "rollingUpdate", alias = "rollingupdate")]
    RollingUpdate,
    #[serde(alias = "recreate")]
    Recreate,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exec_command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_path: Option<String>,
    #[serde(default)]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub initial_delay_seconds: i32,
}

/// One concurrently running version of the app.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub version: String,
    pub image: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub port: i32,
    #[serde(default)]
    pub protocol: Protocol,
    /// Changing this value rolls the pods without any other spec change.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart_mark: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<ProbeSpec>,
    #[serde(default)]
    pub scaling_engine: ScalingEngine,
    #[serde(default)]
    pub rolling_update_type: RolloutKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_aliases: Vec<HostAlias>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Istio sidecar requests and limits, rendered as pod template annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_resources: Option<ResourceRequirements>,
}

impl VersionEntry {
    pub fn is_removed(&self) -> bool { self.min_replicas == REMOVED }

    /// Image the container runs. Build pipelines suffix repositories with `_<version>`; that suffix is dropped.
    pub fn image_reference(&self) -> String {
        if self.version.is_empty() { return self.image.clone(); }
        self.image.replace(&format!("_{}", self.version), "")
    }

    /// Tag of the image reference (`latest` when untagged).
    pub fn image_tag(&self) -> &str {
        let last = self.image.rsplit('/').next().unwrap_or(&self.image);
        let last = last.split('@').next().unwrap_or(last);
        last.rsplit_once(':').map_or("latest", |(_, tag)| tag)
    }
}
