pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, ObjectKey, ObjectStore, Requeue, Result, error_policy,
    pooler_error_policy, reconcile, reconcile_cluster, reconcile_pooler,
    reconcile_pooler_resource,
};
pub use crd::{PostgresCluster, PostgresPooler};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::runtime::Controller;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use crate::controller::certificates::{tracked_config_maps, tracked_secrets};

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Outcome of one reconciliation as reported by the controller stream
type ReconcileOutcome<K> = std::result::Result<
    (ObjectRef<K>, Action),
    kube::runtime::controller::Error<Error, kube::runtime::watcher::Error>,
>;

/// Clusters in the same namespace as `object` that satisfy `references`
fn referencing_clusters<K, F>(
    clusters: &Store<PostgresCluster>,
    object: &K,
    references: F,
) -> Vec<ObjectRef<PostgresCluster>>
where
    K: Resource,
    F: Fn(&PostgresCluster, &str) -> bool,
{
    let namespace = object.meta().namespace.clone();
    let name = object.meta().name.clone().unwrap_or_default();
    let mut refs = Vec::new();
    for cluster in clusters.state() {
        if cluster.namespace() == namespace && references(&cluster, &name) {
            refs.push(ObjectRef::<PostgresCluster>::from_obj(&cluster));
        }
    }
    refs
}

fn log_outcome<K: Resource>(kind: &str, result: ReconcileOutcome<K>) {
    match result {
        Ok((obj, _action)) => {
            tracing::debug!("Reconciled {}: {}", kind, obj.name);
        }
        Err(e) => {
            // NotFound errors are expected after deletion when related watch
            // events trigger reconciliation for a deleted object.
            let is_not_found = matches!(
                &e,
                kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
            );
            if is_not_found {
                tracing::debug!("{} no longer exists (likely deleted): {:?}", kind, e);
            } else {
                tracing::error!("{} reconciliation error: {:?}", kind, e);
            }
        }
    }
}

/// Run the PostgresCluster controller.
///
/// Owns volume claims, bootstrap jobs, instance pods and services. Certificate
/// secrets and monitoring config maps are not owned; a change to one of them
/// is mapped back to every cluster naming it, so rotations are picked up
/// without polling.
pub async fn run_cluster_controller(client: Client, ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    tracing::info!(
        "Starting controller for PostgresCluster resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace);
    let volume_claims: Api<PersistentVolumeClaim> = scoped_api(client.clone(), namespace);
    let jobs: Api<Job> = scoped_api(client.clone(), namespace);
    let pods: Api<Pod> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(client.clone(), namespace);
    let config_maps: Api<ConfigMap> = scoped_api(client.clone(), namespace);

    // Use any_semantic() for more reliable resource discovery
    let watcher_config = WatcherConfig::default().any_semantic();

    let controller = Controller::new(clusters, watcher_config.clone());
    let secret_index = controller.store();
    let config_map_index = controller.store();

    controller
        .owns(volume_claims, watcher_config.clone())
        .owns(jobs, watcher_config.clone())
        .owns(pods, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .watches(secrets, watcher_config.clone(), move |secret| {
            referencing_clusters(&secret_index, &secret, |cluster, name| {
                tracked_secrets(cluster.spec.certificates.as_ref())
                    .iter()
                    .any(|s| s.name == name)
            })
        })
        .watches(config_maps, watcher_config, move |config_map| {
            referencing_clusters(&config_map_index, &config_map, |cluster, name| {
                tracked_config_maps(cluster).iter().any(|n| n == name)
            })
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move { log_outcome("PostgresCluster", result) })
        .await;

    // This should never complete in normal operation
    tracing::error!("Cluster controller stream ended unexpectedly");
}

/// Run the PostgresPooler controller.
///
/// Owns PgBouncer deployments and watches clusters, mapping a cluster change
/// to every pooler that references it.
pub async fn run_pooler_controller(client: Client, ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    tracing::info!(
        "Starting controller for PostgresPooler resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    let poolers: Api<PostgresPooler> = scoped_api(client.clone(), namespace);
    let deployments: Api<Deployment> = scoped_api(client.clone(), namespace);
    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    let controller = Controller::new(poolers, watcher_config.clone());
    let pooler_index = controller.store();

    controller
        .owns(deployments, watcher_config.clone())
        .watches(clusters, watcher_config, move |cluster| {
            let namespace = cluster.namespace();
            let name = cluster.name_any();
            let mut refs = Vec::new();
            for pooler in pooler_index.state() {
                if pooler.namespace() == namespace && pooler.spec.cluster.name == name {
                    refs.push(ObjectRef::<PostgresPooler>::from_obj(&pooler));
                }
            }
            refs
        })
        .run(reconcile_pooler_resource, pooler_error_policy, ctx)
        .for_each(|result| async move { log_outcome("PostgresPooler", result) })
        .await;

    tracing::error!("Pooler controller stream ended unexpectedly");
}
