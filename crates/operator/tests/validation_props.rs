use composite_operator::api::GatewaySpec;
use composite_operator::children::{self, Desired};
use composite_operator::test_support::{app, version};
use composite_operator::CompositeApp;
use proptest::prelude::*;

fn weighted_app(weights: &[i32]) -> CompositeApp {
    let apps = (0..weights.len()).map(|i| version(&format!("v{i}"), "shop:1", 1, 3)).collect();
    let mut a = app("shop", apps);
    a.spec.gateway = Some(GatewaySpec {
        hosts: vec!["shop.example.com".into()],
        weights: weights.iter().enumerate().map(|(i, w)| (format!("v{i}"), *w)).collect(),
        ..Default::default()
    });
    a
}

proptest! {
    #[test]
    fn weights_are_accepted_only_when_they_sum_to_hundred(weights in prop::collection::vec(0i32..=100, 1..5)) {
        let sum: i32 = weights.iter().sum();
        prop_assert_eq!(weighted_app(&weights).validate().is_ok(), sum == 100);
    }

    #[test]
    fn accepted_weights_reach_the_default_route(split in 0i32..=100) {
        let a = weighted_app(&[split, 100 - split]);
        prop_assert!(a.validate().is_ok());
        let Desired::Present(vs) = children::router::generate(&a) else { panic!("router must be present") };
        let default_rule = vs.spec.http.last().unwrap();
        let routed: Vec<i32> = default_rule.route.iter().map(|d| d.weight).collect();
        prop_assert_eq!(routed, vec![split, 100 - split]);
    }

    #[test]
    fn replica_bounds_follow_min_and_max(min in -3i32..6, max in 0i32..6) {
        let a = app("shop", vec![version("v1", "shop:1", min, max)]);
        let expected = min == -1 || (min > 0 && max >= min);
        prop_assert_eq!(a.validate().is_ok(), expected);
    }

    #[test]
    fn version_names_must_be_dns_labels(name in "[a-zA-Z0-9_.-]{0,12}") {
        let a = app("shop", vec![version(&name, "shop:1", 1, 1)]);
        let expected = !name.is_empty()
            && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            && !name.starts_with('-')
            && !name.ends_with('-');
        prop_assert_eq!(a.validate().is_ok(), expected);
    }
}
