use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_INGRESS_GATEWAY: &str = "istio-system/gateway";

/// External exposure through the mesh ingress gateway.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    pub hosts: Vec<String>,
    /// Unset means `/<app name>`; empty means no prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    /// Version name to traffic share; shares sum to 100.
    #[serde(default)]
    pub weights: BTreeMap<String, i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routes: BTreeMap<String, VersionRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

impl GatewaySpec {
    pub fn ingress_gateway(&self) -> &str { self.gateway.as_deref().filter(|g| !g.is_empty()).unwrap_or(DEFAULT_INGRESS_GATEWAY) }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorsSpec {
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default)]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
}

/// Extra header matches that pin a request to one version.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionRoute {
    #[serde(default)]
    pub headers_match: Vec<BTreeMap<String, String>>,
}
