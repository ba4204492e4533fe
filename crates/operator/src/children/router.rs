//! The app-wide VirtualService: per-version pinning plus weighted default routing.
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::{ChildKind, Desired, Scope};
use crate::api::{proto_duration, CompositeApp, CorsSpec, GatewaySpec, TrafficPolicySpec, VersionEntry, VERSION_LABEL};
use crate::istio::{
    CorsPolicy, Destination, FaultAbort, FaultDelay, HttpFaultInjection, HttpMatchRequest, HttpRetry, HttpRewrite, HttpRoute,
    HttpRouteDestination, Percent, PortSelector, StringMatch, VirtualService, VirtualServiceSpec,
};

/// Header that pins a request to one version.
pub const VERSION_HEADER: &str = "VERSION";
pub const MESH_GATEWAY: &str = "mesh";

const CORS_METHODS: [&str; 5] = ["POST", "GET", "OPTIONS", "DELETE", "PUT"];
const CORS_HEADERS: [&str; 2] = ["Origin", "x-token"];
const CORS_MAX_AGE: &str = "86400s";

pub struct TrafficRouter;

impl ChildKind for TrafficRouter {
    type Object = VirtualService;
    type Projection = (BTreeMap<String, String>, VirtualServiceSpec);

    const KIND: &'static str = "VirtualService";
    const SCOPE: Scope = Scope::App;

    fn generate(app: &CompositeApp, _entry: Option<&VersionEntry>, _observed: Option<&VirtualService>) -> Desired<VirtualService> { generate(app) }

    fn project(obj: &VirtualService) -> Self::Projection { (obj.labels().clone(), obj.spec.clone()) }
}

pub fn generate(app: &CompositeApp) -> Desired<VirtualService> {
    if app.spec.apps.is_empty() { return Desired::Absent; }
    let spec = match &app.spec.gateway {
        None => mesh_routes(app),
        Some(gateway) => gateway_routes(app, gateway),
    };
    let mut vs = VirtualService::new(&app.name_any(), spec);
    vs.metadata = ObjectMeta {
        name: Some(app.name_any()),
        namespace: Some(app.namespace_or_default()),
        labels: Some(app.child_labels()),
        ..Default::default()
    };
    Desired::Present(vs)
}

/// In-mesh callers reach the version matching their own `version` label.
fn mesh_routes(app: &CompositeApp) -> VirtualServiceSpec {
    let namespace = app.namespace_or_default();
    let http = app
        .spec
        .apps
        .iter()
        .map(|entry| {
            let matched = HttpMatchRequest {
                source_labels: BTreeMap::from([(VERSION_LABEL.to_string(), entry.version.clone())]),
                source_namespace: Some(namespace.clone()),
                ..Default::default()
            };
            rule(app, vec![matched], None, vec![destination(app, entry, 100)], None)
        })
        .collect();
    VirtualServiceSpec { hosts: vec![app.service_host()], gateways: vec![MESH_GATEWAY.into()], http }
}

fn gateway_routes(app: &CompositeApp, gateway: &GatewaySpec) -> VirtualServiceSpec {
    let prefix = app.prefix_path();
    let cors = cors_policy(gateway.cors.as_ref());
    let mut http = Vec::with_capacity(app.spec.apps.len() + 1);
    for entry in &app.spec.apps {
        let mut matches = Vec::new();
        for headers in gateway.routes.get(&entry.version).map(|r| r.headers_match.as_slice()).unwrap_or_default() {
            let headers: BTreeMap<_, _> = headers.iter().map(|(k, v)| (k.clone(), StringMatch::Exact(v.clone()))).collect();
            matches.extend(prefixed(&prefix, &headers));
        }
        let pinned = BTreeMap::from([(VERSION_HEADER.to_string(), StringMatch::Exact(entry.version.clone()))]);
        matches.extend(prefixed(&prefix, &pinned));
        http.push(rule(app, matches, Some(rewrite()), vec![destination(app, entry, 100)], cors.clone()));
    }
    let weighted = app.spec.apps.iter().map(|e| destination(app, e, gateway.weights.get(&e.version).copied().unwrap_or(0))).collect();
    http.push(rule(app, prefixed(&prefix, &BTreeMap::new()), Some(rewrite()), weighted, cors));
    VirtualServiceSpec { hosts: gateway.hosts.clone(), gateways: vec![gateway.ingress_gateway().to_string()], http }
}

/// URI-prefix matches for `<prefix>/` and `<prefix>`, each carrying `headers`.
fn prefixed(prefix: &str, headers: &BTreeMap<String, StringMatch>) -> Vec<HttpMatchRequest> {
    let with_slash = format!("{prefix}/");
    let mut uris = vec![with_slash];
    if !prefix.is_empty() { uris.push(prefix.to_string()); }
    uris.into_iter()
        .map(|uri| HttpMatchRequest { uri: Some(StringMatch::Prefix(uri)), headers: headers.clone(), ..Default::default() })
        .collect()
}

fn rewrite() -> HttpRewrite { HttpRewrite { uri: "/".into() } }

fn destination(app: &CompositeApp, entry: &VersionEntry, weight: i32) -> HttpRouteDestination {
    HttpRouteDestination {
        destination: Destination {
            host: app.service_host(),
            subset: Some(app.version_name(entry)),
            port: u32::try_from(entry.port).ok().map(|number| PortSelector { number }),
        },
        weight,
    }
}

fn rule(app: &CompositeApp, matches: Vec<HttpMatchRequest>, rewrite: Option<HttpRewrite>, route: Vec<HttpRouteDestination>, cors: Option<CorsPolicy>) -> HttpRoute {
    let policy = app.spec.policy.as_ref();
    HttpRoute {
        matches,
        rewrite,
        route,
        timeout: policy.and_then(|p| p.timeout.as_deref()).and_then(proto_duration),
        retries: policy.and_then(retries),
        fault: policy.and_then(fault),
        cors_policy: cors,
    }
}

fn retries(policy: &TrafficPolicySpec) -> Option<HttpRetry> {
    let retries = policy.retries.as_ref()?;
    Some(HttpRetry {
        attempts: retries.attempts,
        per_try_timeout: retries.per_try_timeout.as_deref().and_then(proto_duration),
        retry_on: retries.retry_on.clone().filter(|r| !r.is_empty()),
    })
}

fn fault(policy: &TrafficPolicySpec) -> Option<HttpFaultInjection> {
    let fault = policy.fault.as_ref()?;
    let delay = fault.delay.as_ref().and_then(|d| {
        Some(FaultDelay { percentage: Some(Percent { value: d.percent }), fixed_delay: proto_duration(&d.delay)? })
    });
    let abort = fault.abort.as_ref().map(|a| FaultAbort { percentage: Some(Percent { value: a.percent }), http_status: a.http_status });
    (delay.is_some() || abort.is_some()).then_some(HttpFaultInjection { delay, abort })
}

fn cors_policy(cors: Option<&CorsSpec>) -> Option<CorsPolicy> {
    let cors = cors?;
    let or_default = |given: &[String], default: &[&str]| {
        if given.is_empty() { default.iter().map(|s| s.to_string()).collect() } else { given.to_vec() }
    };
    Some(CorsPolicy {
        allow_origins: cors.allow_origins.iter().map(|o| StringMatch::Exact(o.clone())).collect(),
        allow_methods: or_default(&cors.allow_methods, &CORS_METHODS),
        allow_headers: or_default(&cors.allow_headers, &CORS_HEADERS),
        expose_headers: cors.expose_headers.clone(),
        max_age: Some(CORS_MAX_AGE.into()),
        allow_credentials: Some(true),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api::{DelaySpec, FaultSpec, RetrySpec, VersionRoute};
    use crate::test_support::{app, version};

    fn spec(d: Desired<VirtualService>) -> VirtualServiceSpec {
        let Desired::Present(vs) = d else { panic!("expected a virtual service") };
        vs.spec
    }

    fn gateway(weights: &[(&str, i32)]) -> GatewaySpec {
        GatewaySpec {
            hosts: vec!["shop.example.com".into()],
            weights: weights.iter().map(|(v, w)| (v.to_string(), *w)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn mesh_routing_by_source_label() {
        let a = app("shop", vec![version("v1", "shop:1", 1, 2), version("v2", "shop:2", 1, 2)]);
        let vs = spec(generate(&a));
        assert_eq!(vs.hosts, ["shop.default.svc.cluster.local"]);
        assert_eq!(vs.gateways, [MESH_GATEWAY]);
        assert_eq!(vs.http.len(), 2);
        assert_eq!(
            serde_json::to_value(&vs.http[1]).unwrap(),
            json!({
                "match": [{"sourceLabels": {"version": "v2"}, "sourceNamespace": "default"}],
                "route": [{"destination": {"host": "shop.default.svc.cluster.local", "subset": "shop-v2", "port": {"number": 8080}}, "weight": 100}]
            })
        );
    }

    #[test]
    fn gateway_routing_with_weights_and_header_pins() {
        let mut a = app("shop", vec![version("blue", "shop:1", 1, 2), version("green", "shop:2", 1, 2)]);
        let mut gw = gateway(&[("blue", 90), ("green", 10)]);
        gw.routes.insert("green".into(), VersionRoute { headers_match: vec![BTreeMap::from([("x-canary".into(), "yes".into())])] });
        a.spec.gateway = Some(gw);
        let vs = spec(generate(&a));
        assert_eq!(vs.gateways, ["istio-system/gateway"]);
        assert_eq!(vs.http.len(), 3);

        let green = &vs.http[1];
        let uris: Vec<_> = green.matches.iter().map(|m| m.uri.clone().unwrap()).collect();
        assert_eq!(uris, [
            StringMatch::Prefix("/shop/".into()),
            StringMatch::Prefix("/shop".into()),
            StringMatch::Prefix("/shop/".into()),
            StringMatch::Prefix("/shop".into())
        ]);
        assert!(green.matches[0].headers.contains_key("x-canary"));
        assert_eq!(green.matches[2].headers.get(VERSION_HEADER), Some(&StringMatch::Exact("green".into())));
        assert_eq!(green.rewrite, Some(rewrite()));

        let default = vs.http.last().unwrap();
        let weights: Vec<_> = default.route.iter().map(|r| (r.destination.subset.clone().unwrap(), r.weight)).collect();
        assert_eq!(weights, [("shop-blue".to_string(), 90), ("shop-green".to_string(), 10)]);
        assert!(default.matches.iter().all(|m| m.headers.is_empty()));
    }

    #[test]
    fn empty_prefix_matches_root_only() {
        let mut a = app("shop", vec![version("v1", "shop:1", 1, 2)]);
        a.spec.gateway = Some(GatewaySpec { path_prefix: Some(String::new()), ..gateway(&[("v1", 100)]) });
        let vs = spec(generate(&a));
        assert_eq!(vs.http.last().unwrap().matches.len(), 1);
        assert_eq!(vs.http.last().unwrap().matches[0].uri, Some(StringMatch::Prefix("/".into())));
    }

    #[test]
    fn policy_and_cors_on_every_rule() {
        let mut a = app("shop", vec![version("v1", "shop:1", 1, 2)]);
        a.spec.gateway = Some(GatewaySpec { cors: Some(CorsSpec { allow_origins: vec!["*".into()], ..Default::default() }), ..gateway(&[("v1", 100)]) });
        a.spec.policy = Some(TrafficPolicySpec {
            timeout: Some("3s".into()),
            retries: Some(RetrySpec { attempts: 2, per_try_timeout: Some("500ms".into()), retry_on: None }),
            fault: Some(FaultSpec { delay: Some(DelaySpec { percent: 5.0, delay: "2s".into() }), abort: None }),
            ..Default::default()
        });
        for route in spec(generate(&a)).http {
            assert_eq!(route.timeout.as_deref(), Some("3s"));
            assert_eq!(route.retries.as_ref().unwrap().per_try_timeout.as_deref(), Some("0.500s"));
            assert_eq!(route.fault.as_ref().unwrap().delay.as_ref().unwrap().fixed_delay, "2s");
            let cors = route.cors_policy.unwrap();
            assert_eq!(cors.allow_methods, CORS_METHODS);
            assert_eq!(cors.allow_headers, CORS_HEADERS);
            assert_eq!(cors.max_age.as_deref(), Some("86400s"));
        }
    }

    #[test]
    fn missing_weight_routes_nothing() {
        let mut a = app("shop", vec![version("v1", "shop:1", 1, 2), version("v2", "shop:2", 1, 2)]);
        a.spec.gateway = Some(gateway(&[("v1", 100)]));
        let vs = spec(generate(&a));
        assert_eq!(vs.http.last().unwrap().route[1].weight, 0);
    }
}
