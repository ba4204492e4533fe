//! The app-wide ClusterIP Service.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{ChildKind, Desired, Scope};
use crate::api::{AppRole, CompositeApp, VersionEntry};

pub const DIAGNOSTICS_PORT: i32 = 9000;

pub struct NetworkEndpoint;

impl ChildKind for NetworkEndpoint {
    type Object = Service;
    type Projection = EndpointProjection;

    const KIND: &'static str = "Service";
    const SCOPE: Scope = Scope::App;

    fn generate(app: &CompositeApp, _entry: Option<&VersionEntry>, _observed: Option<&Service>) -> Desired<Service> { generate(app) }

    fn project(obj: &Service) -> EndpointProjection {
        let spec = obj.spec.clone().unwrap_or_default();
        EndpointProjection {
            labels: obj.labels().clone(),
            type_: spec.type_,
            selector: spec.selector,
            ports: spec.ports,
            session_affinity: spec.session_affinity,
        }
    }

    /// The API server assigns the cluster IP and rejects updates that drop it.
    fn prepare_update(desired: &mut Service, observed: &Service) {
        desired.metadata.resource_version = observed.metadata.resource_version.clone();
        if let (Some(spec), Some(seen)) = (desired.spec.as_mut(), observed.spec.as_ref()) {
            spec.cluster_ip = seen.cluster_ip.clone();
            spec.cluster_ips = seen.cluster_ips.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointProjection {
    pub labels: BTreeMap<String, String>,
    pub type_: Option<String>,
    pub selector: Option<BTreeMap<String, String>>,
    pub ports: Option<Vec<ServicePort>>,
    pub session_affinity: Option<String>,
}

pub fn generate(app: &CompositeApp) -> Desired<Service> {
    let mut ports: Vec<ServicePort> = Vec::new();
    for entry in &app.spec.apps {
        if ports.iter().any(|p| p.port == entry.port) { continue; }
        ports.push(port(format!("{}-{}", entry.protocol.port_prefix(), entry.port), entry.port));
    }
    if ports.is_empty() { return Desired::Absent; }
    if matches!(app.spec.role, Some(AppRole::Gateway | AppRole::Service)) && !ports.iter().any(|p| p.port == DIAGNOSTICS_PORT) {
        ports.push(port("diagnostics".into(), DIAGNOSTICS_PORT));
    }
    Desired::Present(Service {
        metadata: ObjectMeta {
            name: Some(app.name_any()),
            namespace: Some(app.namespace_or_default()),
            labels: Some(app.child_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some(app.selector()),
            ports: Some(ports),
            session_affinity: Some("None".into()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn port(name: String, number: i32) -> ServicePort {
    ServicePort { name: Some(name), port: number, protocol: Some("TCP".into()), target_port: Some(IntOrString::Int(number)), ..Default::default() }
}
