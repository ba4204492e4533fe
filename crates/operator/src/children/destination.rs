//! The app-wide DestinationRule: version subsets plus connection and ejection policy.
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::{ChildKind, Desired, Scope};
use crate::api::{proto_duration, CompositeApp, TrafficPolicySpec, VersionEntry};
use crate::istio::{
    ConnectionPoolSettings, DestinationRule, DestinationRuleSpec, HttpPoolSettings, LoadBalancerSettings, OutlierDetection, Subset,
    TrafficPolicy,
};

pub struct DestinationPolicy;

impl ChildKind for DestinationPolicy {
    type Object = DestinationRule;
    type Projection = (BTreeMap<String, String>, DestinationRuleSpec);

    const KIND: &'static str = "DestinationRule";
    const SCOPE: Scope = Scope::App;

    fn generate(app: &CompositeApp, _entry: Option<&VersionEntry>, _observed: Option<&DestinationRule>) -> Desired<DestinationRule> { generate(app) }

    fn project(obj: &DestinationRule) -> Self::Projection { (obj.labels().clone(), obj.spec.clone()) }
}

pub fn generate(app: &CompositeApp) -> Desired<DestinationRule> {
    if app.spec.apps.is_empty() { return Desired::Absent; }
    let subsets = app.spec.apps.iter().map(|e| Subset { name: app.version_name(e), labels: app.version_labels(e) }).collect();
    let spec = DestinationRuleSpec { host: app.service_host(), traffic_policy: Some(traffic_policy(app.spec.policy.as_ref())), subsets };
    let mut rule = DestinationRule::new(&app.name_any(), spec);
    rule.metadata = ObjectMeta {
        name: Some(app.name_any()),
        namespace: Some(app.namespace_or_default()),
        labels: Some(app.child_labels()),
        ..Default::default()
    };
    Desired::Present(rule)
}

fn traffic_policy(policy: Option<&TrafficPolicySpec>) -> TrafficPolicy {
    let positive = |v: i32| (v > 0).then_some(v);
    TrafficPolicy {
        load_balancer: Some(LoadBalancerSettings { simple: Some("ROUND_ROBIN".into()) }),
        connection_pool: policy.and_then(|p| p.max_requests).map(|n| ConnectionPoolSettings {
            http: Some(HttpPoolSettings { http1_max_pending_requests: Some(n), http2_max_requests: Some(n) }),
        }),
        outlier_detection: policy.and_then(|p| p.outlier_detection.as_ref()).map(|o| OutlierDetection {
            consecutive_5xx_errors: Some(o.consecutive_errors),
            interval: o.interval.as_deref().and_then(proto_duration),
            base_ejection_time: o.ejection_time.as_deref().and_then(proto_duration),
            max_ejection_percent: positive(o.max_ejection_percent),
            min_health_percent: positive(o.min_health_percent),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api::OutlierSpec;
    use crate::test_support::{app, version};

    #[test]
    fn subsets_per_version() {
        let a = app("shop", vec![version("v1", "shop:1", 1, 2), version("v2", "shop:2", -1, 0)]);
        let Desired::Present(rule) = generate(&a) else { panic!("expected a destination rule") };
        let names: Vec<_> = rule.spec.subsets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["shop-v1", "shop-v2"]);
        assert_eq!(rule.spec.subsets[0].labels.get("version").map(String::as_str), Some("v1"));
        assert_eq!(rule.spec.host, "shop.default.svc.cluster.local");
        assert!(rule.spec.traffic_policy.unwrap().connection_pool.is_none());
    }

    #[test]
    fn policy_limits_and_ejection() {
        let mut a = app("shop", vec![version("v1", "shop:1", 1, 2)]);
        a.spec.policy = Some(TrafficPolicySpec {
            max_requests: Some(64),
            outlier_detection: Some(OutlierSpec {
                consecutive_errors: 5,
                interval: Some("10s".into()),
                ejection_time: Some("1m".into()),
                max_ejection_percent: 50,
                min_health_percent: 0,
            }),
            ..Default::default()
        });
        let Desired::Present(rule) = generate(&a) else { panic!("expected a destination rule") };
        assert_eq!(
            serde_json::to_value(rule.spec.traffic_policy.unwrap()).unwrap(),
            json!({
                "loadBalancer": {"simple": "ROUND_ROBIN"},
                "connectionPool": {"http": {"http1MaxPendingRequests": 64, "http2MaxRequests": 64}},
                "outlierDetection": {"consecutive5xxErrors": 5, "interval": "10s", "baseEjectionTime": "60s", "maxEjectionPercent": 50}
            })
        );
    }
}
