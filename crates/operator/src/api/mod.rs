//! `CompositeApp` custom resource: one logical service running as several versions.
mod gateway;
mod policy;
mod validate;
mod version;

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use gateway::{CorsSpec, GatewaySpec, VersionRoute, DEFAULT_INGRESS_GATEWAY};
pub use policy::{proto_duration, AbortSpec, DelaySpec, FaultSpec, OutlierSpec, RetrySpec, TrafficPolicySpec};
pub use validate::ValidationError;
pub use version::{AppRole, ProbeSpec, Protocol, RolloutKind, ScalingEngine, VersionEntry, REMOVED};

/// Label carrying the owning app name on every child and pod.
pub const APP_LABEL: &str = "apps.composite.dev/app";
/// Label carrying the version on per-version children and pods.
pub const VERSION_LABEL: &str = "version";

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[kube(
    group = "apps.composite.dev",
    version = "v1",
    kind = "CompositeApp",
    plural = "compositeapps",
    shortname = "capp",
    namespaced,
    status = "CompositeAppStatus",
    printcolumn = r#"{"name":"Success","type":"boolean","jsonPath":".status.success"}"#,
    printcolumn = r#"{"name":"Replicas","type":"string","jsonPath":".status.desc.replicas"}"#,
    printcolumn = r#"{"name":"Images","type":"string","jsonPath":".status.desc.images"}"#,
    printcolumn = r#"{"name":"Weights","type":"string","jsonPath":".status.desc.weights"}"#,
    printcolumn = r#"{"name":"Prefix","type":"string","jsonPath":".status.desc.prefixPath"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CompositeAppSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<AppRole>,
    #[serde(default)]
    pub apps: Vec<VersionEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewaySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<TrafficPolicySpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompositeAppStatus {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub available_replicas: BTreeMap<String, i32>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub desc: StatusDesc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Human-readable summary rendered in the printer columns.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusDesc {
    #[serde(default)]
    pub replicas: String,
    #[serde(default)]
    pub images: String,
    #[serde(default)]
    pub weights: String,
    #[serde(default)]
    pub prefix_path: String,
}

impl CompositeApp {
    pub fn namespace_or_default(&self) -> String { self.namespace().unwrap_or_else(|| "default".into()) }

    /// `namespace/name`, used as the reconcile key in logs.
    pub fn key(&self) -> String { format!("{}/{}", self.namespace_or_default(), self.name_any()) }

    /// Name shared by per-version children: `<app>-<version>`.
    pub fn version_name(&self, entry: &VersionEntry) -> String { format!("{}-{}", self.name_any(), entry.version) }

    pub fn version(&self, version: &str) -> Option<&VersionEntry> { self.spec.apps.iter().find(|e| e.version == version) }

    /// Selector matching every pod of the app regardless of version.
    pub fn selector(&self) -> BTreeMap<String, String> { BTreeMap::from([(APP_LABEL.to_string(), self.name_any())]) }

    pub fn version_selector(&self, entry: &VersionEntry) -> BTreeMap<String, String> {
        let mut labels = self.selector();
        labels.insert(VERSION_LABEL.into(), entry.version.clone());
        labels
    }

    /// Parent labels plus the app label; stamped on per-app children.
    pub fn child_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels().clone();
        labels.extend(self.selector());
        labels
    }

    pub fn version_labels(&self, entry: &VersionEntry) -> BTreeMap<String, String> {
        let mut labels = self.labels().clone();
        labels.extend(self.version_selector(entry));
        labels
    }

    /// In-mesh host name of the app Service.
    pub fn service_host(&self) -> String { format!("{}.{}.svc.cluster.local", self.name_any(), self.namespace_or_default()) }

    /// External URI prefix: empty without a gateway or when explicitly set empty,
    /// `/<name>` when unset, otherwise the configured prefix with a leading slash.
    pub fn prefix_path(&self) -> String {
        let Some(gateway) = &self.spec.gateway else { return String::new() };
        match gateway.path_prefix.as_deref() {
            None => format!("/{}", self.name_any()),
            Some("") => String::new(),
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => format!("/{p}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(gateway: Option<GatewaySpec>) -> CompositeApp {
        let mut app = CompositeApp::new("shop", CompositeAppSpec { gateway, ..Default::default() });
        app.metadata.namespace = Some("prod".into());
        app
    }

    fn gateway(prefix: Option<&str>) -> GatewaySpec {
        GatewaySpec { hosts: vec!["shop.example.com".into()], path_prefix: prefix.map(Into::into), ..Default::default() }
    }

    #[test]
    fn prefix_path_variants() {
        assert_eq!(app(None).prefix_path(), "");
        assert_eq!(app(Some(gateway(None))).prefix_path(), "/shop");
        assert_eq!(app(Some(gateway(Some("")))).prefix_path(), "");
        assert_eq!(app(Some(gateway(Some("api")))).prefix_path(), "/api");
        assert_eq!(app(Some(gateway(Some("/api/v2")))).prefix_path(), "/api/v2");
    }

    #[test]
    fn names_and_labels() {
        let mut a = app(None);
        a.metadata.labels = Some(BTreeMap::from([("team".into(), "core".into())]));
        let entry = VersionEntry { version: "blue".into(), ..Default::default() };
        assert_eq!(a.key(), "prod/shop");
        assert_eq!(a.version_name(&entry), "shop-blue");
        assert_eq!(a.service_host(), "shop.prod.svc.cluster.local");
        let labels = a.version_labels(&entry);
        assert_eq!(labels.get("team").map(String::as_str), Some("core"));
        assert_eq!(labels.get(VERSION_LABEL).map(String::as_str), Some("blue"));
        assert!(!a.version_selector(&entry).contains_key("team"));
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = CompositeAppStatus {
            available_replicas: BTreeMap::from([("v1".into(), 2)]),
            success: true,
            desc: StatusDesc { prefix_path: "/shop".into(), ..Default::default() },
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["availableReplicas"]["v1"], 2);
        assert_eq!(json["desc"]["prefixPath"], "/shop");
        assert!(json.get("message").is_none());
    }
}
