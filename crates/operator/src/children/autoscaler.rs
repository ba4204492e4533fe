//! Per-version CPU autoscaler.
use k8s_openapi::api::autoscaling::v1::{CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{ChildKind, Desired, Scope};
use crate::api::{CompositeApp, ScalingEngine, VersionEntry};

pub const TARGET_CPU_PERCENT: i32 = 80;

pub struct Autoscaler;

impl ChildKind for Autoscaler {
    type Object = HorizontalPodAutoscaler;
    type Projection = Option<HorizontalPodAutoscalerSpec>;

    const KIND: &'static str = "HorizontalPodAutoscaler";
    const SCOPE: Scope = Scope::Version;

    fn generate(app: &CompositeApp, entry: Option<&VersionEntry>, _observed: Option<&HorizontalPodAutoscaler>) -> Desired<HorizontalPodAutoscaler> {
        entry.map_or(Desired::Unmanaged, |entry| generate(app, entry))
    }

    fn project(obj: &HorizontalPodAutoscaler) -> Self::Projection { obj.spec.clone() }
}

pub fn generate(app: &CompositeApp, entry: &VersionEntry) -> Desired<HorizontalPodAutoscaler> {
    if entry.scaling_engine == ScalingEngine::External { return Desired::Unmanaged; }
    if entry.is_removed() { return Desired::Absent; }
    let name = app.version_name(entry);
    Desired::Present(HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(app.namespace_or_default()),
            labels: Some(app.version_labels(entry)),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            min_replicas: Some(entry.min_replicas),
            max_replicas: entry.max_replicas,
            scale_target_ref: CrossVersionObjectReference { api_version: Some("apps/v1".into()), kind: "Deployment".into(), name },
            target_cpu_utilization_percentage: Some(TARGET_CPU_PERCENT),
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{app, version};

    #[test]
    fn targets_the_version_deployment() {
        let a = app("shop", vec![version("v1", "shop:1", 2, 6)]);
        let Desired::Present(hpa) = generate(&a, &a.spec.apps[0]) else { panic!("expected an autoscaler") };
        let spec = hpa.spec.unwrap();
        assert_eq!((spec.min_replicas, spec.max_replicas), (Some(2), 6));
        assert_eq!(spec.scale_target_ref.name, "shop-v1");
        assert_eq!(spec.scale_target_ref.kind, "Deployment");
        assert_eq!(spec.target_cpu_utilization_percentage, Some(80));
    }

    #[test]
    fn external_scaling_is_unmanaged_even_when_removed() {
        let mut a = app("shop", vec![version("v1", "shop:1", -1, 0)]);
        assert!(matches!(generate(&a, &a.spec.apps[0]), Desired::Absent));
        a.spec.apps[0].scaling_engine = ScalingEngine::External;
        assert!(matches!(generate(&a, &a.spec.apps[0]), Desired::Unmanaged));
    }
}
