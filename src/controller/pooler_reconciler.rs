//! Reconciliation of PostgresPooler resources
//!
//! A pooler only reads its cluster. It resolves the service endpoint for the
//! requested role and keeps one PgBouncer deployment pointed at it.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::controller::context::Context;
use crate::controller::error::{Error, Requeue, Result};
use crate::controller::status::ConditionBuilder;
use crate::controller::store::{
    ChildKind, ChildObject, Mutation, ObjectKey, ObjectStore, apply_mutation,
};
use crate::controller::validation::validate_pooler_spec;
use crate::crd::{PostgresCluster, PostgresPooler, PostgresPoolerStatus};
use crate::resources::common::service_endpoint;
use crate::resources::pgbouncer::{DeploymentFingerprint, apply_desired, generate_pooler_deployment};

/// What to do with the pooler deployment this pass
#[derive(Debug, Clone, PartialEq)]
pub enum PoolerAction {
    Create(Deployment),
    /// Live deployment carrying the desired fields
    Update(Deployment),
    None,
}

impl PoolerAction {
    pub fn into_mutation(self) -> Option<Mutation> {
        match self {
            PoolerAction::Create(d) => Some(Mutation::Create(ChildObject::Deployment(d))),
            PoolerAction::Update(d) => Some(Mutation::Update(ChildObject::Deployment(d))),
            PoolerAction::None => None,
        }
    }
}

/// Desired deployment for a pooler of an existing cluster
pub fn desired_deployment(
    pooler: &PostgresPooler,
    cluster: &PostgresCluster,
    config: &OperatorConfig,
) -> Deployment {
    let endpoint = service_endpoint(&cluster.name_any(), pooler.spec.type_);
    generate_pooler_deployment(pooler, &endpoint, config)
}

/// Diff the desired deployment against the live one
///
/// Only the replica count, pool mode, target endpoint and parameters are
/// compared; anything else on the live object is left alone.
pub fn ensure_pooler_deployment(
    pooler: &PostgresPooler,
    cluster: &PostgresCluster,
    live: Option<&Deployment>,
    config: &OperatorConfig,
) -> PoolerAction {
    let desired = desired_deployment(pooler, cluster, config);
    match live {
        None => PoolerAction::Create(desired),
        Some(live) if DeploymentFingerprint::of(live) != DeploymentFingerprint::of(&desired) => {
            PoolerAction::Update(apply_desired(&desired, live))
        }
        Some(_) => PoolerAction::None,
    }
}

fn ready_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// Build the pooler status from the live deployment
///
/// `desired` is `None` when the referenced cluster does not exist.
pub fn pooler_status(
    pooler: &PostgresPooler,
    desired: Option<&Deployment>,
    live: Option<&Deployment>,
) -> PostgresPoolerStatus {
    let generation = pooler.metadata.generation;
    let existing = pooler.status.clone().unwrap_or_default();
    let fingerprint = live.map(DeploymentFingerprint::of);
    let ready = live.map(ready_replicas).unwrap_or(0);

    let builder = ConditionBuilder::from_existing(existing.conditions, generation);
    let conditions = match desired {
        None => {
            let message = format!("PostgresCluster {} not found", pooler.spec.cluster.name);
            builder
                .cluster_found(false, "ClusterNotFound", &message)
                .ready(false, "ClusterNotFound", &message)
                .build()
        }
        Some(desired) => {
            let converged = fingerprint.as_ref() == Some(&DeploymentFingerprint::of(desired));
            let is_ready = converged && ready >= pooler.spec.instances;
            let message = format!("{} of {} replicas ready", ready, pooler.spec.instances);
            builder
                .cluster_found(true, "ClusterFound", "Referenced cluster exists")
                .ready(
                    is_ready,
                    if is_ready { "PoolerReady" } else { "NotReady" },
                    &message,
                )
                .build()
        }
    };

    PostgresPoolerStatus {
        instances: ready,
        target_endpoint: fingerprint.as_ref().and_then(|f| f.target_endpoint.clone()),
        pool_mode: fingerprint.as_ref().and_then(|f| f.pool_mode),
        observed_generation: generation,
        conditions,
    }
}

fn is_ready(status: &PostgresPoolerStatus) -> bool {
    status
        .conditions
        .iter()
        .any(|c| c.type_ == crate::controller::status::condition_types::READY && c.status == "True")
}

/// Outcome of one pooler pass
#[derive(Debug, Clone)]
pub struct PoolerReport {
    pub requeue: Requeue,
    pub applied: Vec<Mutation>,
    pub status: Option<PostgresPoolerStatus>,
}

async fn write_status_if_changed(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    pooler: &PostgresPooler,
    status: &PostgresPoolerStatus,
) -> Result<()> {
    if pooler.status.as_ref() == Some(status) {
        debug!("Status of {} unchanged", key);
        return Ok(());
    }
    store.patch_pooler_status(key, status).await
}

async fn get_deployment(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<Deployment>> {
    Ok(store
        .get(&key.namespace, ChildKind::Deployment, &key.name)
        .await?
        .and_then(ChildObject::into_deployment))
}

/// Run one reconciliation pass for the pooler addressed by `key`
///
/// A missing cluster is recorded in status and returned as
/// [`Error::ClusterNotFound`] so the caller retries with backoff.
pub async fn reconcile_pooler(key: &ObjectKey, ctx: &Context) -> Result<PoolerReport> {
    let store = ctx.store.as_ref();
    let Some(pooler) = store.get_pooler(key).await? else {
        debug!("PostgresPooler {} no longer exists", key);
        return Ok(PoolerReport {
            requeue: Requeue::Never,
            applied: Vec::new(),
            status: None,
        });
    };

    if let Err(e) = validate_pooler_spec(&pooler) {
        let message = e.to_string();
        warn!("Configuration error for {}: {}", key, message);
        let existing = pooler.status.clone().unwrap_or_default();
        let status = PostgresPoolerStatus {
            observed_generation: pooler.metadata.generation,
            conditions: ConditionBuilder::from_existing(
                existing.conditions.clone(),
                pooler.metadata.generation,
            )
            .ready(false, "ConfigurationError", &message)
            .build(),
            ..existing
        };
        write_status_if_changed(store, key, &pooler, &status).await?;
        return Ok(PoolerReport {
            requeue: Requeue::Never,
            applied: Vec::new(),
            status: Some(status),
        });
    }

    let live = get_deployment(store, key).await?;
    let cluster_key = ObjectKey::new(key.namespace.clone(), pooler.spec.cluster.name.clone());
    let Some(cluster) = store.get_cluster(&cluster_key).await? else {
        let status = pooler_status(&pooler, None, live.as_ref());
        write_status_if_changed(store, key, &pooler, &status).await?;
        return Err(Error::ClusterNotFound(cluster_key.to_string()));
    };

    let desired = desired_deployment(&pooler, &cluster, &ctx.config);
    let action = ensure_pooler_deployment(&pooler, &cluster, live.as_ref(), &ctx.config);

    let mut applied = Vec::new();
    let mut requeue = Requeue::Never;
    let observed = match action.into_mutation() {
        None => live,
        Some(mutation) => {
            requeue = Requeue::Now;
            match apply_mutation(store, &key.namespace, &mutation).await {
                Ok(()) => {
                    info!("Applied {} for {}", mutation, key);
                    applied.push(mutation);
                }
                Err(e) if e.is_conflict() => {
                    warn!("Stale view while applying {}: {}; retrying", mutation, e);
                }
                Err(e) => return Err(e),
            }
            get_deployment(store, key).await?
        }
    };

    let status = pooler_status(&pooler, Some(&desired), observed.as_ref());
    write_status_if_changed(store, key, &pooler, &status).await?;

    if requeue == Requeue::Never && !is_ready(&status) {
        requeue = Requeue::Now;
    }
    Ok(PoolerReport {
        requeue,
        applied,
        status: Some(status),
    })
}

/// Controller entry point for PostgresPooler resources
#[instrument(skip(pooler, ctx), fields(name = %pooler.name_any(), namespace = pooler.namespace().unwrap_or_default()))]
pub async fn reconcile_pooler_resource(
    pooler: Arc<PostgresPooler>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let start = Instant::now();
    let key = ObjectKey::from_resource(pooler.as_ref())?;

    info!("Reconciling PostgresPooler");
    let report = reconcile_pooler(&key, &ctx).await?;

    let metrics = &ctx.health_state.metrics;
    for mutation in &report.applied {
        metrics.record_mutation(mutation.kind().as_str(), mutation.verb());
    }
    if let Some(ref status) = report.status {
        metrics.set_pooler_instances(&key.namespace, &key.name, i64::from(status.instances));
    }
    metrics.record_reconcile(
        "PostgresPooler",
        &key.namespace,
        &key.name,
        start.elapsed().as_secs_f64(),
    );
    ctx.health_state.touch_reconcile();

    Ok(ctx.action_for("PostgresPooler", &key, report.requeue))
}

/// Error policy for the pooler controller
pub fn pooler_error_policy(pooler: Arc<PostgresPooler>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = pooler.name_any();
    ctx.health_state
        .metrics
        .record_error("PostgresPooler", error.metric_label());

    let key = ObjectKey::from_resource(pooler.as_ref()).ok();
    let delay = ctx.error_delay("PostgresPooler", key.as_ref(), error);
    match error {
        Error::ClusterNotFound(cluster) => {
            info!(
                "Pooler {} waits for cluster {}, requeuing in {:?}",
                name, cluster, delay
            );
        }
        e if e.is_retryable() => {
            warn!(
                "Retryable error for {}: {:?}, requeuing in {:?}",
                name, error, delay
            );
        }
        _ => {
            error!(
                "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
                name, error, delay
            );
        }
    }
    Action::requeue(delay)
}
