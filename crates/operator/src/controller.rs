//! Wires the reconciler into `kube_runtime::Controller`.
use std::fmt::Debug;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context as _;
use futures_util::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment, autoscaling::v1::HorizontalPodAutoscaler, core::v1::Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{api::ListParams, Api, Client, Resource};
use kube_runtime::{
    controller::{self, Action},
    watcher, Controller,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::api::CompositeApp;
use crate::config::OperatorConfig;
use crate::error::Error;
use crate::events::KubeEvents;
use crate::istio::{DestinationRule, VirtualService};
use crate::lifecycle::NoopHook;
use crate::reconciler::{PassOutcome, Reconciler};
use crate::store::KubeStore;
use crate::telemetry::Metrics;

pub struct Context {
    pub reconciler: Reconciler<KubeStore>,
    pub config: OperatorConfig,
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Requeue policy for a finished pass.
pub fn next_action(outcome: &PassOutcome, config: &OperatorConfig) -> Action {
    match outcome {
        PassOutcome::Converged { success: true, .. } => Action::requeue(config.resync_interval),
        PassOutcome::Converged { success: false, .. } => Action::requeue(config.error_backoff),
        PassOutcome::Retry => Action::requeue(config.retry_interval),
        PassOutcome::Rejected(_) | PassOutcome::Finalized | PassOutcome::Released => Action::await_change(),
    }
}

async fn reconcile(app: Arc<CompositeApp>, ctx: Arc<Context>) -> Result<Action, Error> {
    let outcome = ctx.reconciler.reconcile(&app).await?;
    Ok(next_action(&outcome, &ctx.config))
}

fn error_policy(app: Arc<CompositeApp>, err: &Error, ctx: Arc<Context>) -> Action {
    warn!(app = %app.key(), error = %err, "reconcile.error_policy");
    Action::requeue(ctx.config.error_backoff)
}

/// Run until SIGINT/SIGTERM. Flips `ready` once the CompositeApp API answers.
pub async fn run(client: Client, config: OperatorConfig, metrics: Arc<Metrics>, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    let ns = config.namespace.as_deref();
    let apps = scoped::<CompositeApp>(&client, ns);
    apps.list(&ListParams::default().limit(1)).await.context("CompositeApp CRD is not served; install it with crd-gen")?;

    let reconciler = Reconciler::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(NoopHook),
        Arc::new(KubeEvents::new(client.clone(), &config.reporter)),
        metrics,
    );
    let concurrency = config.max_concurrent_reconciles;
    let ctx = Arc::new(Context { reconciler, config: config.clone() });
    ready.store(true, Ordering::Relaxed);
    info!(namespace = ns.unwrap_or("*"), concurrency, "controller.started");

    Controller::new(apps, watcher::Config::default())
        .owns(scoped::<Deployment>(&client, ns), watcher::Config::default())
        .owns(scoped::<Service>(&client, ns), watcher::Config::default())
        .owns(scoped::<VirtualService>(&client, ns), watcher::Config::default())
        .owns(scoped::<HorizontalPodAutoscaler>(&client, ns), watcher::Config::default())
        .owns(scoped::<DestinationRule>(&client, ns), watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(app = %obj.name, "reconcile.done"),
                Err(e) => warn!(error = %e, "reconcile.failed"),
            }
        })
        .await;
    ready.store(false, Ordering::Relaxed);
    info!("controller.stopped");
    Ok(())
}
