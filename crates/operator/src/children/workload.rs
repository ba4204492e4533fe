//! Per-version Deployment.
use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, ExecAction, HTTPGetAction, HostAlias, HostPathVolumeSource,
    LocalObjectReference, PodSecurityContext, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, TCPSocketAction, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{ChildKind, Desired, Scope};
use crate::api::{CompositeApp, CompositeAppStatus, ProbeSpec, RolloutKind, VersionEntry};
use crate::quantity::{nano_units, same_resource_list};

pub const RESTART_MARK: &str = "apps.composite.dev/restart-mark";
pub const TZ_VOLUME: &str = "tz-config";
pub const LOCALTIME: &str = "/etc/localtime";
pub const DEFAULT_LOG_PATH: &str = "/app/logs/";

/// Sidecar annotation per (section, resource) of `proxyResources`.
const PROXY_ANNOTATIONS: [(&str, &str, &str); 4] = [
    ("requests", "cpu", "sidecar.istio.io/proxyCPU"),
    ("limits", "cpu", "sidecar.istio.io/proxyCPULimit"),
    ("requests", "memory", "sidecar.istio.io/proxyMemory"),
    ("limits", "memory", "sidecar.istio.io/proxyMemoryLimit"),
];

const PROGRESS_DEADLINE_SECONDS: i32 = 600;
const REVISION_HISTORY_LIMIT: i32 = 10;
const GRACE_PERIOD_SECONDS: i64 = 30;

pub struct Workload;

impl ChildKind for Workload {
    type Object = Deployment;
    type Projection = WorkloadProjection;

    const KIND: &'static str = "Deployment";
    const SCOPE: Scope = Scope::Version;
    const OBSERVES: bool = true;

    fn generate(app: &CompositeApp, entry: Option<&VersionEntry>, observed: Option<&Deployment>) -> Desired<Deployment> {
        entry.map_or(Desired::Unmanaged, |entry| generate(app, entry, observed))
    }

    fn project(obj: &Deployment) -> WorkloadProjection { WorkloadProjection::of(obj) }

    fn observe(entry: Option<&VersionEntry>, observed: Option<&Deployment>, status: &mut CompositeAppStatus) {
        let (Some(entry), Some(deployment)) = (entry, observed) else { return };
        let available = deployment.status.as_ref().and_then(|s| s.available_replicas).unwrap_or(0);
        status.available_replicas.insert(entry.version.clone(), available);
    }
}

/// Desired Deployment for `entry`, adjusted by what is already running.
pub fn generate(app: &CompositeApp, entry: &VersionEntry, observed: Option<&Deployment>) -> Desired<Deployment> {
    if entry.is_removed() { return Desired::Absent; }
    let mut deployment = build(app, entry);
    if let Some(current) = observed { carry_forward(&mut deployment, current, entry); }
    Desired::Present(deployment)
}

fn build(app: &CompositeApp, entry: &VersionEntry) -> Deployment {
    let name = app.version_name(entry);
    let mut template_labels = app.version_labels(entry);
    template_labels.extend(entry.template_labels.clone());
    let mut annotations = entry.template_annotations.clone();
    if !entry.restart_mark.is_empty() { annotations.insert(RESTART_MARK.into(), entry.restart_mark.clone()); }
    if let Some(proxy) = &entry.proxy_resources { annotations.extend(proxy_annotations(proxy)); }
    let logs = format!("{}-logs", app.name_any());

    let container = Container {
        name: name.clone(),
        image: Some(entry.image_reference()),
        image_pull_policy: Some("Always".into()),
        ports: Some(vec![ContainerPort { container_port: entry.port, protocol: Some("TCP".into()), ..Default::default() }]),
        resources: Some(entry.resources.clone()),
        env: non_empty(entry.env.iter().cloned().map(with_field_api_version).collect()),
        readiness_probe: entry.readiness_probe.as_ref().map(|p| probe(p, entry.port)),
        liveness_probe: entry.liveness_probe.as_ref().map(|p| probe(p, entry.port)),
        termination_message_path: Some("/dev/termination-log".into()),
        termination_message_policy: Some("File".into()),
        volume_mounts: Some(vec![
            VolumeMount { name: TZ_VOLUME.into(), mount_path: LOCALTIME.into(), ..Default::default() },
            VolumeMount {
                name: logs.clone(),
                mount_path: entry.log_path.clone().filter(|p| !p.is_empty()).unwrap_or_else(|| DEFAULT_LOG_PATH.into()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let pod = PodSpec {
        containers: vec![container],
        volumes: Some(vec![
            Volume {
                name: TZ_VOLUME.into(),
                host_path: Some(HostPathVolumeSource { path: LOCALTIME.into(), type_: Some(String::new()) }),
                ..Default::default()
            },
            Volume { name: logs, empty_dir: Some(EmptyDirVolumeSource::default()), ..Default::default() },
        ]),
        restart_policy: Some("Always".into()),
        dns_policy: Some("ClusterFirst".into()),
        scheduler_name: Some("default-scheduler".into()),
        security_context: Some(PodSecurityContext::default()),
        termination_grace_period_seconds: Some(entry.termination_grace_period_seconds.filter(|s| *s > 0).unwrap_or(GRACE_PERIOD_SECONDS)),
        image_pull_secrets: entry.image_pull_secret.clone().filter(|s| !s.is_empty()).map(|s| vec![LocalObjectReference { name: s.into() }]),
        node_selector: non_empty_map(entry.node_selector.clone()),
        host_aliases: non_empty(entry.host_aliases.clone()),
        affinity: entry.affinity.clone(),
        tolerations: non_empty(entry.tolerations.clone()),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(app.namespace_or_default()),
            labels: Some(app.version_labels(entry)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(entry.min_replicas),
            progress_deadline_seconds: Some(PROGRESS_DEADLINE_SECONDS),
            revision_history_limit: Some(REVISION_HISTORY_LIMIT),
            selector: LabelSelector { match_labels: Some(app.version_selector(entry)), ..Default::default() },
            strategy: Some(strategy(entry.rolling_update_type)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(template_labels), annotations: non_empty_map(annotations), ..Default::default() }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn strategy(kind: RolloutKind) -> DeploymentStrategy {
    match kind {
        RolloutKind::Recreate => DeploymentStrategy { type_: Some("Recreate".into()), rolling_update: None },
        RolloutKind::RollingUpdate => DeploymentStrategy {
            type_: Some("RollingUpdate".into()),
            rolling_update: Some(RollingUpdateDeployment {
                max_surge: Some(IntOrString::String("25%".into())),
                max_unavailable: Some(IntOrString::String("25%".into())),
            }),
        },
    }
}

fn probe(spec: &ProbeSpec, port: i32) -> Probe {
    let positive = |v: i32, default: i32| if v > 0 { v } else { default };
    let mut probe = Probe {
        initial_delay_seconds: Some(positive(spec.initial_delay_seconds, 10)),
        timeout_seconds: Some(positive(spec.timeout_seconds, 3)),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    };
    match (spec.http_path.as_ref().filter(|p| !p.is_empty()), spec.exec_command.is_empty()) {
        (Some(path), _) => {
            probe.http_get =
                Some(HTTPGetAction { path: Some(path.clone()), port: IntOrString::Int(port), scheme: Some("HTTP".into()), ..Default::default() })
        }
        (None, false) => probe.exec = Some(ExecAction { command: Some(spec.exec_command.clone()) }),
        (None, true) => probe.tcp_socket = Some(TCPSocketAction { port: IntOrString::Int(port), host: None }),
    }
    probe
}

/// Keep what the cluster or a human legitimately changed on the running Deployment.
fn carry_forward(desired: &mut Deployment, observed: &Deployment, entry: &VersionEntry) {
    let Some(current) = observed.spec.as_ref() else { return };
    let Some(spec) = desired.spec.as_mut() else { return };

    if let Some(replicas) = current.replicas.filter(|r| (entry.min_replicas..=entry.max_replicas).contains(r)) {
        spec.replicas = Some(replicas);
    }

    if entry.restart_mark.is_empty() {
        let mark = current.template.metadata.as_ref().and_then(|m| m.annotations.as_ref()).and_then(|a| a.get(RESTART_MARK));
        if let Some(mark) = mark {
            let meta = spec.template.metadata.get_or_insert_with(Default::default);
            meta.annotations.get_or_insert_with(Default::default).insert(RESTART_MARK.into(), mark.clone());
        }
    }

    let observed_resources = current.template.spec.as_ref().and_then(|p| p.containers.first()).and_then(|c| c.resources.as_ref());
    let desired_container = spec.template.spec.as_mut().and_then(|p| p.containers.first_mut());
    if let (Some(seen), Some(container)) = (observed_resources, desired_container) {
        if equivalent_resources(container.resources.as_ref(), Some(seen)) { container.resources = Some(seen.clone()); }
    }
}

fn equivalent_resources(a: Option<&ResourceRequirements>, b: Option<&ResourceRequirements>) -> bool {
    let (a, b) = (a.cloned().unwrap_or_default(), b.cloned().unwrap_or_default());
    same_resource_list(a.limits.as_ref(), b.limits.as_ref()) && same_resource_list(a.requests.as_ref(), b.requests.as_ref())
}

/// The API server stores `fieldRef.apiVersion` as `v1` when omitted.
fn with_field_api_version(mut var: EnvVar) -> EnvVar {
    if let Some(field_ref) = var.value_from.as_mut().and_then(|v| v.field_ref.as_mut()) {
        field_ref.api_version.get_or_insert_with(|| "v1".into());
    }
    var
}

fn proxy_annotations(proxy: &ResourceRequirements) -> BTreeMap<String, String> {
    let section = |name: &str| if name == "limits" { proxy.limits.as_ref() } else { proxy.requests.as_ref() };
    PROXY_ANNOTATIONS
        .iter()
        .filter_map(|(sec, resource, key)| {
            let quantity = section(*sec)?.get(*resource)?;
            (nano_units(quantity) != Some(0)).then(|| (key.to_string(), quantity.0.clone()))
        })
        .collect()
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> { (!v.is_empty()).then_some(v) }

fn non_empty_map(m: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> { (!m.is_empty()).then_some(m) }

/// The Deployment fields this operator owns.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadProjection {
    pub labels: BTreeMap<String, String>,
    pub replicas: Option<i32>,
    pub selector: Option<BTreeMap<String, String>>,
    pub strategy: Option<DeploymentStrategy>,
    pub template_labels: Option<BTreeMap<String, String>>,
    pub template_annotations: Option<BTreeMap<String, String>>,
    pub volumes: Option<Vec<Volume>>,
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub host_aliases: Option<Vec<HostAlias>>,
    pub affinity: Option<Affinity>,
    pub tolerations: Option<Vec<Toleration>>,
    pub grace_period: Option<i64>,
    pub containers: Vec<ContainerProjection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerProjection {
    pub name: String,
    pub image: Option<String>,
    pub ports: Option<Vec<ContainerPort>>,
    pub resources: Option<ResourceRequirements>,
    pub env: Option<Vec<EnvVar>>,
    pub readiness_probe: Option<Probe>,
    pub liveness_probe: Option<Probe>,
    pub volume_mounts: Option<Vec<VolumeMount>>,
}

impl WorkloadProjection {
    fn of(d: &Deployment) -> Self {
        let spec = d.spec.clone().unwrap_or_default();
        let template_meta = spec.template.metadata.unwrap_or_default();
        let pod = spec.template.spec.unwrap_or_default();
        Self {
            labels: d.labels().clone(),
            replicas: spec.replicas,
            selector: spec.selector.match_labels,
            strategy: spec.strategy,
            template_labels: template_meta.labels,
            template_annotations: template_meta.annotations,
            volumes: pod.volumes,
            image_pull_secrets: pod.image_pull_secrets,
            node_selector: pod.node_selector,
            host_aliases: pod.host_aliases,
            affinity: pod.affinity,
            tolerations: pod.tolerations,
            grace_period: pod.termination_grace_period_seconds,
            containers: pod
                .containers
                .into_iter()
                .map(|c| ContainerProjection {
                    name: c.name,
                    image: c.image,
                    ports: c.ports,
                    resources: c.resources,
                    env: c.env,
                    readiness_probe: c.readiness_probe,
                    liveness_probe: c.liveness_probe,
                    volume_mounts: c.volume_mounts,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{EnvVarSource, ObjectFieldSelector};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;
    use crate::test_support::{app, version};

    fn present(d: Desired<Deployment>) -> Deployment {
        match d {
            Desired::Present(d) => d,
            other => panic!("expected a deployment, got {other:?}"),
        }
    }

    fn with_replicas(mut d: Deployment, n: i32) -> Deployment {
        d.spec.as_mut().unwrap().replicas = Some(n);
        d
    }

    fn annotations(d: &Deployment) -> BTreeMap<String, String> {
        d.spec.as_ref().unwrap().template.metadata.as_ref().unwrap().annotations.clone().unwrap_or_default()
    }

    #[test]
    fn removed_version_is_absent() {
        let a = app("shop", vec![version("v1", "shop:1", -1, 0)]);
        assert!(matches!(generate(&a, &a.spec.apps[0], None), Desired::Absent));
    }

    #[test]
    fn builds_named_deployment_with_defaults() {
        let a = app("shop", vec![version("v1", "shop:1", 2, 5)]);
        let d = present(generate(&a, &a.spec.apps[0], None));
        assert_eq!(d.name_any(), "shop-v1");
        let spec = d.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.progress_deadline_seconds, Some(600));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.termination_grace_period_seconds, Some(30));
        let names: Vec<_> = pod.volumes.as_ref().unwrap().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["tz-config", "shop-logs"]);
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[1].mount_path, DEFAULT_LOG_PATH);
        assert!(!annotations(&d).contains_key(RESTART_MARK));
    }

    #[test]
    fn probe_defaults_and_overrides() {
        let spec = ProbeSpec { http_path: Some("/healthz".into()), timeout_seconds: 5, ..Default::default() };
        let p = probe(&spec, 8080);
        assert_eq!((p.initial_delay_seconds, p.timeout_seconds, p.period_seconds), (Some(10), Some(5), Some(10)));
        assert_eq!((p.success_threshold, p.failure_threshold), (Some(1), Some(3)));
        assert_eq!(p.http_get.unwrap().path.as_deref(), Some("/healthz"));
        let exec = probe(&ProbeSpec { exec_command: vec!["true".into()], ..Default::default() }, 8080);
        assert!(exec.exec.is_some() && exec.http_get.is_none());
    }

    #[test]
    fn recreate_strategy_has_no_rolling_params() {
        let mut a = app("shop", vec![version("v1", "shop:1", 1, 1)]);
        a.spec.apps[0].rolling_update_type = RolloutKind::Recreate;
        let d = present(generate(&a, &a.spec.apps[0], None));
        let strategy = d.spec.unwrap().strategy.unwrap();
        assert_eq!(strategy.type_.as_deref(), Some("Recreate"));
        assert!(strategy.rolling_update.is_none());
    }

    #[test]
    fn keeps_observed_replicas_within_bounds() {
        let a = app("shop", vec![version("v1", "shop:1", 2, 10)]);
        let base = present(generate(&a, &a.spec.apps[0], None));
        let scaled = present(generate(&a, &a.spec.apps[0], Some(&with_replicas(base.clone(), 4))));
        assert_eq!(scaled.spec.unwrap().replicas, Some(4));
        let shrunk = present(generate(&a, &a.spec.apps[0], Some(&with_replicas(base, 1))));
        assert_eq!(shrunk.spec.unwrap().replicas, Some(2));
    }

    #[test]
    fn carries_restart_mark_forward() {
        let mut a = app("shop", vec![version("v1", "shop:1", 1, 3)]);
        a.spec.apps[0].restart_mark = "R7".into();
        let marked = present(generate(&a, &a.spec.apps[0], None));
        assert_eq!(annotations(&marked).get(RESTART_MARK).map(String::as_str), Some("R7"));

        a.spec.apps[0].restart_mark.clear();
        let next = present(generate(&a, &a.spec.apps[0], Some(&marked)));
        assert_eq!(annotations(&next).get(RESTART_MARK).map(String::as_str), Some("R7"));
        assert_eq!(WorkloadProjection::of(&next), WorkloadProjection::of(&marked));
    }

    #[test]
    fn adopts_equivalent_observed_resources() {
        let mut a = app("shop", vec![version("v1", "shop:1", 1, 3)]);
        a.spec.apps[0].resources =
            ResourceRequirements { limits: Some(BTreeMap::from([("cpu".into(), Quantity("1".into()))])), ..Default::default() };
        let mut observed = present(generate(&a, &a.spec.apps[0], None));
        let container = &mut observed.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0];
        container.resources =
            Some(ResourceRequirements { limits: Some(BTreeMap::from([("cpu".into(), Quantity("1000m".into()))])), ..Default::default() });

        let next = present(generate(&a, &a.spec.apps[0], Some(&observed)));
        assert_eq!(WorkloadProjection::of(&next), WorkloadProjection::of(&observed));

        a.spec.apps[0].resources.limits = Some(BTreeMap::from([("cpu".into(), Quantity("2".into()))]));
        let bumped = present(generate(&a, &a.spec.apps[0], Some(&observed)));
        assert_ne!(WorkloadProjection::of(&bumped), WorkloadProjection::of(&observed));
    }

    #[test]
    fn empty_http_path_falls_through() {
        let exec = probe(&ProbeSpec { http_path: Some(String::new()), exec_command: vec!["true".into()], ..Default::default() }, 8080);
        assert!(exec.http_get.is_none() && exec.exec.is_some());
        let tcp = probe(&ProbeSpec { http_path: Some(String::new()), ..Default::default() }, 8080);
        assert_eq!(tcp.tcp_socket.map(|t| t.port), Some(IntOrString::Int(8080)));
    }

    #[test]
    fn field_ref_env_gets_api_version() {
        let mut a = app("shop", vec![version("v1", "shop:1", 1, 3)]);
        a.spec.apps[0].env = vec![
            EnvVar {
                name: "POD_IP".into(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector { field_path: "status.podIP".into(), api_version: None }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar { name: "MODE".into(), value: Some("prod".into()), ..Default::default() },
        ];
        let d = present(generate(&a, &a.spec.apps[0], None));
        let env = d.spec.unwrap().template.spec.unwrap().containers[0].env.clone().unwrap();
        let field_ref = env[0].value_from.as_ref().and_then(|v| v.field_ref.as_ref()).unwrap();
        assert_eq!(field_ref.api_version.as_deref(), Some("v1"));
        assert_eq!(env[1].value.as_deref(), Some("prod"));
    }

    #[test]
    fn renders_scheduling_and_host_aliases() {
        let mut a = app("shop", vec![version("v1", "shop_v1:1.2", 1, 3)]);
        let entry = &mut a.spec.apps[0];
        entry.host_aliases = vec![HostAlias { ip: "10.0.0.5".into(), hostnames: Some(vec!["db.internal".into()]) }];
        entry.tolerations = vec![Toleration { key: Some("dedicated".into()), operator: Some("Exists".into()), ..Default::default() }];
        entry.affinity = Some(Affinity::default());
        let d = present(generate(&a, &a.spec.apps[0], None));
        let pod = d.spec.as_ref().unwrap().template.spec.clone().unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("shop:1.2"));
        assert_eq!(pod.host_aliases.unwrap()[0].ip, "10.0.0.5");
        assert_eq!(pod.tolerations.unwrap()[0].key.as_deref(), Some("dedicated"));
        assert!(pod.affinity.is_some());

        let mut plain = present(generate(&a, &a.spec.apps[0], None));
        plain.spec.as_mut().unwrap().template.spec.as_mut().unwrap().tolerations = None;
        assert_ne!(WorkloadProjection::of(&plain), WorkloadProjection::of(&d));
    }

    #[test]
    fn proxy_resources_become_sidecar_annotations() {
        let mut a = app("shop", vec![version("v1", "shop:1", 1, 3)]);
        a.spec.apps[0].proxy_resources = Some(ResourceRequirements {
            requests: Some(BTreeMap::from([("cpu".into(), Quantity("100m".into())), ("memory".into(), Quantity("0".into()))])),
            limits: Some(BTreeMap::from([("memory".into(), Quantity("256Mi".into()))])),
            ..Default::default()
        });
        let d = present(generate(&a, &a.spec.apps[0], None));
        let annotations = annotations(&d);
        assert_eq!(annotations.get("sidecar.istio.io/proxyCPU").map(String::as_str), Some("100m"));
        assert_eq!(annotations.get("sidecar.istio.io/proxyMemoryLimit").map(String::as_str), Some("256Mi"));
        assert!(!annotations.contains_key("sidecar.istio.io/proxyMemory"));
        assert!(!annotations.contains_key("sidecar.istio.io/proxyCPULimit"));
    }

    #[test]
    fn observe_records_available_replicas() {
        let a = app("shop", vec![version("v1", "shop:1", 1, 3)]);
        let mut d = present(generate(&a, &a.spec.apps[0], None));
        d.status = Some(k8s_openapi::api::apps::v1::DeploymentStatus { available_replicas: Some(2), ..Default::default() });
        let mut status = CompositeAppStatus::default();
        Workload::observe(Some(&a.spec.apps[0]), Some(&d), &mut status);
        Workload::observe(Some(&a.spec.apps[0]), None, &mut status);
        assert_eq!(status.available_replicas.get("v1"), Some(&2));
    }
}
