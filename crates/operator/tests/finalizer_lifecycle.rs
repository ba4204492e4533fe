use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use composite_operator::error::Error;
use composite_operator::lifecycle::{FinalizerState, PreDeleteHook, FINALIZER};
use composite_operator::store::Store;
use composite_operator::telemetry::Metrics;
use composite_operator::test_support::{app, version, MemoryCluster, RecordingEvents, Verb, DELETION_TIMESTAMP};
use composite_operator::{CompositeApp, PassOutcome, Reconciler};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

#[derive(Default)]
struct CountingHook {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl PreDeleteHook for CountingHook {
    async fn pre_delete(&self, _app: &CompositeApp) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail { anyhow::bail!("drain still running") }
        Ok(())
    }
}

fn setup(hook: Arc<CountingHook>) -> (Arc<MemoryCluster>, Reconciler<MemoryCluster>) {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.seed(&app("shop", vec![version("v1", "shop:1.0", 1, 3), version("v2", "shop:2.0", 1, 3)]));
    let reconciler = Reconciler::new(cluster.clone(), hook, Arc::new(RecordingEvents::default()), Arc::new(Metrics::new().unwrap()));
    (cluster, reconciler)
}

fn stored(cluster: &MemoryCluster) -> Option<CompositeApp> { cluster.object("default", "shop") }

async fn request_deletion(cluster: &MemoryCluster) {
    <MemoryCluster as Store<CompositeApp>>::delete(cluster, "default", "shop").await.unwrap();
}

#[tokio::test]
async fn first_pass_registers_the_finalizer() {
    let (cluster, reconciler) = setup(Arc::default());
    let fresh = stored(&cluster).unwrap();
    assert_eq!(FinalizerState::of(&fresh), FinalizerState::Unregistered);

    reconciler.reconcile(&fresh).await.unwrap();
    let app = stored(&cluster).unwrap();
    assert_eq!(app.finalizers(), [FINALIZER.to_string()]);
    assert_eq!(cluster.count::<Deployment>(), 2);
}

#[tokio::test]
async fn deletion_runs_the_hook_and_releases_everything() {
    let hook = Arc::new(CountingHook::default());
    let (cluster, reconciler) = setup(hook.clone());
    reconciler.reconcile(&stored(&cluster).unwrap()).await.unwrap();

    request_deletion(&cluster).await;
    let terminating = stored(&cluster).expect("finalizer blocks removal");
    assert_eq!(FinalizerState::of(&terminating), FinalizerState::Finalizing);
    cluster.clear_calls();

    assert_eq!(reconciler.reconcile(&terminating).await.unwrap(), PassOutcome::Finalized);
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    assert!(stored(&cluster).is_none());
    assert_eq!(cluster.count::<Deployment>(), 0);
    assert_eq!(cluster.count::<Service>(), 0);
    assert!(cluster.calls().iter().all(|c| c.kind == "CompositeApp"), "{:?}", cluster.calls());
}

#[tokio::test]
async fn failing_hook_keeps_the_app_terminating() {
    let hook = Arc::new(CountingHook { fail: true, ..Default::default() });
    let (cluster, reconciler) = setup(hook.clone());
    reconciler.reconcile(&stored(&cluster).unwrap()).await.unwrap();
    request_deletion(&cluster).await;
    cluster.clear_calls();

    let err = reconciler.reconcile(&stored(&cluster).unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::Hook(_)), "{err:?}");
    assert!(err.to_string().contains("drain still running"));
    assert!(cluster.writes().is_empty());
    let app = stored(&cluster).unwrap();
    assert_eq!(FinalizerState::of(&app), FinalizerState::Finalizing);
    assert_eq!(cluster.count::<Deployment>(), 2);
    assert_eq!(reconciler.metrics().passes("error"), 1);
}

#[tokio::test]
async fn released_app_is_left_alone() {
    let (cluster, reconciler) = setup(Arc::default());
    let mut app = stored(&cluster).unwrap();
    app.metadata.deletion_timestamp = Some(Time(DELETION_TIMESTAMP.parse().unwrap()));
    cluster.clear_calls();

    assert_eq!(reconciler.reconcile(&app).await.unwrap(), PassOutcome::Released);
    assert!(cluster.calls().is_empty());
    assert_eq!(cluster.calls_of(Verb::Create, "Deployment"), 0);
}

#[tokio::test]
async fn stale_unregistered_copy_asks_for_retry() {
    let (cluster, reconciler) = setup(Arc::default());
    let stale = stored(&cluster).unwrap();
    cluster.seed(&stale);
    cluster.clear_calls();

    assert_eq!(reconciler.reconcile(&stale).await.unwrap(), PassOutcome::Retry);
    assert_eq!(reconciler.metrics().passes("retry"), 1);
    assert_eq!(reconciler.metrics().passes("error"), 0);
    assert!(stored(&cluster).unwrap().finalizers().is_empty());
    assert_eq!(cluster.count::<Deployment>(), 0);

    assert!(matches!(reconciler.reconcile(&stored(&cluster).unwrap()).await.unwrap(), PassOutcome::Converged { success: true, .. }));
    assert_eq!(stored(&cluster).unwrap().finalizers(), [FINALIZER.to_string()]);
}
