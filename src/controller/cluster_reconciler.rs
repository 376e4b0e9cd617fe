//! Reconciliation of PostgresCluster resources
//!
//! A pass reads one snapshot of the cluster and its children, plans every
//! stage against that snapshot, applies the resulting mutations, then
//! re-reads the children to compute status. Stages gate each other through
//! the snapshot: bootstrap only sees volume claims that already existed when
//! the pass began, and instances only see ordinals whose bootstrap had
//! already succeeded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::controller::bootstrap::plan_bootstrap;
use crate::controller::certificates::{
    LiveSecretVersions, check_config_map_rotation, check_rotation, tracked_config_maps,
    tracked_secrets,
};
use crate::controller::context::Context;
use crate::controller::error::{Error, Requeue, Result};
use crate::controller::instances::ensure_instances;
use crate::controller::status::{
    ClusterObservation, build_cluster_status, configuration_error_status, spec_changed,
};
use crate::controller::storage::ensure_volumes;
use crate::controller::store::{
    ChildKind, ChildObject, Mutation, ObjectKey, ObjectStore, apply_mutation,
};
use crate::controller::validation::validate_spec;
use crate::crd::{ClusterPhase, PostgresCluster, PostgresClusterStatus};
use crate::resources::common::{
    Component, LABEL_CLUSTER, component_selector, parse_instance_ordinal, service_name,
};
use crate::resources::service::{
    SERVICE_ROLES, generate_cluster_service, service_needs_update, with_desired_selector,
};

/// Everything a pass knows about one cluster, read at a single point in time
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub cluster: PostgresCluster,
    pub volume_claims: Vec<PersistentVolumeClaim>,
    pub jobs: Vec<Job>,
    pub pods: Vec<Pod>,
    pub services: Vec<Service>,
    /// Resource version by name, for the tracked secrets that exist
    pub secret_versions: BTreeMap<String, String>,
    /// Resource version by name, for the monitoring config maps that exist
    pub config_map_versions: BTreeMap<String, String>,
}

impl ClusterSnapshot {
    /// Read the children of a cluster from the store
    pub async fn fetch(store: &dyn ObjectStore, cluster: PostgresCluster) -> Result<Self> {
        let namespace = cluster
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = cluster.name_any();
        let owned = BTreeMap::from([(LABEL_CLUSTER.to_string(), name.clone())]);

        let volume_claims = store
            .list(&namespace, ChildKind::VolumeClaim, &owned)
            .await?
            .into_iter()
            .filter_map(ChildObject::into_volume_claim)
            .collect();
        let jobs = store
            .list(&namespace, ChildKind::Job, &owned)
            .await?
            .into_iter()
            .filter_map(ChildObject::into_job)
            .collect();
        // Bootstrap job pods carry the cluster label too; select instances only
        let pods = store
            .list(
                &namespace,
                ChildKind::Instance,
                &component_selector(&name, Component::Instance),
            )
            .await?
            .into_iter()
            .filter_map(ChildObject::into_instance)
            .collect();
        let services = store
            .list(
                &namespace,
                ChildKind::Service,
                &component_selector(&name, Component::Service),
            )
            .await?
            .into_iter()
            .filter_map(ChildObject::into_service)
            .collect();

        let mut secret_versions = BTreeMap::new();
        for secret in tracked_secrets(cluster.spec.certificates.as_ref()) {
            if let Some(object) = store
                .get(&namespace, ChildKind::Secret, &secret.name)
                .await?
            {
                let version = object.resource_version().unwrap_or_default().to_string();
                secret_versions.insert(secret.name, version);
            }
        }

        let mut config_map_versions = BTreeMap::new();
        for config_map in tracked_config_maps(&cluster) {
            if let Some(object) = store
                .get(&namespace, ChildKind::ConfigMap, &config_map)
                .await?
            {
                let version = object.resource_version().unwrap_or_default().to_string();
                config_map_versions.insert(config_map, version);
            }
        }

        Ok(Self {
            cluster,
            volume_claims,
            jobs,
            pods,
            services,
            secret_versions,
            config_map_versions,
        })
    }
}

/// Decisions of one pass, derived purely from a snapshot
#[derive(Debug, Clone)]
pub struct ClusterPlan {
    /// In application order: storage, bootstrap, instances, services
    pub mutations: Vec<Mutation>,
    pub status: PostgresClusterStatus,
    /// Certificate secrets whose version moved past the recorded watermark
    pub rotated: BTreeSet<String>,
    pub rotated_config_maps: BTreeSet<String>,
    pub requeue: Requeue,
}

/// Services to create or re-point, and foreign services carrying our labels
fn plan_services(cluster: &PostgresCluster, live: &[Service]) -> (Vec<Mutation>, Vec<String>) {
    let cluster_name = cluster.name_any();
    let mut mutations = Vec::new();

    for role in SERVICE_ROLES {
        let desired = generate_cluster_service(cluster, role);
        let name = service_name(&cluster_name, role);
        match live.iter().find(|svc| svc.name_any() == name) {
            None => mutations.push(Mutation::Create(ChildObject::Service(desired))),
            Some(current) if service_needs_update(&desired, current) => {
                mutations.push(Mutation::Update(ChildObject::Service(
                    with_desired_selector(&desired, current),
                )));
            }
            Some(_) => {}
        }
    }

    let known: BTreeSet<String> = SERVICE_ROLES
        .iter()
        .map(|role| service_name(&cluster_name, *role))
        .collect();
    let unexpected = live
        .iter()
        .map(|svc| svc.name_any())
        .filter(|name| !known.contains(name))
        .collect();
    (mutations, unexpected)
}

fn qualified(kind: ChildKind, names: &[String]) -> impl Iterator<Item = String> + '_ {
    names.iter().map(move |name| format!("{}/{}", kind, name))
}

/// Plan a full pass over a snapshot
pub fn plan_cluster(snapshot: &ClusterSnapshot, config: &OperatorConfig) -> ClusterPlan {
    let cluster = &snapshot.cluster;
    let cluster_name = cluster.name_any();
    let existing = cluster.status.clone().unwrap_or_default();

    let volumes = ensure_volumes(cluster, &snapshot.volume_claims);
    let bootstrap = plan_bootstrap(cluster, &volumes, &snapshot.jobs, &snapshot.pods, config);
    let secrets = LiveSecretVersions::observe(
        &tracked_secrets(cluster.spec.certificates.as_ref()),
        &snapshot.secret_versions,
    );
    let previous_target = existing
        .target_primary
        .as_deref()
        .and_then(|name| parse_instance_ordinal(&cluster_name, name));
    let instances = ensure_instances(
        cluster,
        &bootstrap.bootstrapped(),
        &snapshot.pods,
        &secrets,
        previous_target,
        config,
    );
    let (service_mutations, foreign_services) = plan_services(cluster, &snapshot.services);

    let mut mutations: Vec<Mutation> = Vec::new();
    mutations.extend(
        volumes
            .to_create
            .iter()
            .cloned()
            .map(|pvc| Mutation::Create(ChildObject::VolumeClaim(pvc))),
    );
    mutations.extend(
        bootstrap
            .to_mark
            .iter()
            .cloned()
            .map(|pvc| Mutation::Update(ChildObject::VolumeClaim(pvc))),
    );
    mutations.extend(
        bootstrap
            .to_create
            .iter()
            .cloned()
            .map(|job| Mutation::Create(ChildObject::Job(job))),
    );
    mutations.extend(bootstrap.to_delete.iter().map(|name| Mutation::Delete {
        kind: ChildKind::Job,
        name: name.clone(),
    }));
    mutations.extend(
        instances
            .to_create
            .iter()
            .cloned()
            .map(|pod| Mutation::Create(ChildObject::Instance(pod))),
    );
    mutations.extend(
        instances
            .to_relabel
            .iter()
            .cloned()
            .map(|pod| Mutation::Update(ChildObject::Instance(pod))),
    );
    mutations.extend(instances.to_delete.iter().map(|name| Mutation::Delete {
        kind: ChildKind::Instance,
        name: name.clone(),
    }));
    mutations.extend(service_mutations);

    let unexpected = qualified(ChildKind::VolumeClaim, &volumes.unexpected)
        .chain(qualified(ChildKind::Job, &bootstrap.unexpected))
        .chain(qualified(ChildKind::Instance, &instances.unexpected))
        .chain(qualified(ChildKind::Service, &foreign_services))
        .collect();

    let status = build_cluster_status(
        cluster,
        &ClusterObservation {
            volumes: &volumes,
            bootstrap: &bootstrap,
            instances: &instances,
            secrets: &secrets,
            config_maps: &snapshot.config_map_versions,
            unexpected,
        },
    );

    let rotated = check_rotation(&existing.secrets_resource_version, &secrets);
    let rotated_config_maps = check_config_map_rotation(
        &existing.config_map_resource_version,
        &snapshot.config_map_versions,
    );

    let requeue = if !mutations.is_empty() {
        Requeue::Now
    } else if status.phase == ClusterPhase::Healthy {
        Requeue::Never
    } else if !bootstrap.failures.is_empty() || !secrets.complete() {
        Requeue::AfterBackoff
    } else {
        Requeue::Now
    };

    ClusterPlan {
        mutations,
        status,
        rotated,
        rotated_config_maps,
        requeue,
    }
}

/// Outcome of one cluster pass
#[derive(Debug, Clone)]
pub struct PassReport {
    pub requeue: Requeue,
    /// Mutations the store accepted, in order
    pub applied: Vec<Mutation>,
    pub rotated: BTreeSet<String>,
    /// Status computed at the end of the pass
    pub status: Option<PostgresClusterStatus>,
}

impl PassReport {
    fn idle() -> Self {
        Self {
            requeue: Requeue::Never,
            applied: Vec::new(),
            rotated: BTreeSet::new(),
            status: None,
        }
    }
}

async fn write_status_if_changed(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    cluster: &PostgresCluster,
    status: &PostgresClusterStatus,
) -> Result<()> {
    if cluster.status.as_ref() == Some(status) {
        debug!("Status of {} unchanged", key);
        return Ok(());
    }
    store.patch_cluster_status(key, status).await
}

/// Run one reconciliation pass for the cluster addressed by `key`
pub async fn reconcile_cluster(key: &ObjectKey, ctx: &Context) -> Result<PassReport> {
    let store = ctx.store.as_ref();
    let Some(cluster) = store.get_cluster(key).await? else {
        debug!("PostgresCluster {} no longer exists", key);
        return Ok(PassReport::idle());
    };

    if let Err(e) = validate_spec(&cluster) {
        let message = e.to_string();
        warn!("Configuration error for {}: {}", key, message);
        let status = configuration_error_status(&cluster, &message);
        write_status_if_changed(store, key, &cluster, &status).await?;
        return Ok(PassReport {
            status: Some(status),
            ..PassReport::idle()
        });
    }

    let snapshot = ClusterSnapshot::fetch(store, cluster).await?;
    let plan = plan_cluster(&snapshot, &ctx.config);

    for secret in &plan.rotated {
        info!(secret = %secret, "Certificate secret rotated for {}", key);
    }
    for config_map in &plan.rotated_config_maps {
        info!(config_map = %config_map, "Monitoring config map changed for {}", key);
    }

    let mut applied = Vec::new();
    let mut conflicted = false;
    for mutation in &plan.mutations {
        match apply_mutation(store, &key.namespace, mutation).await {
            Ok(()) => {
                info!("Applied {} for {}", mutation, key);
                applied.push(mutation.clone());
            }
            Err(e) if e.is_conflict() => {
                warn!("Stale view while applying {}: {}; retrying", mutation, e);
                conflicted = true;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    if plan.mutations.is_empty() {
        write_status_if_changed(store, key, &snapshot.cluster, &plan.status).await?;
        return Ok(PassReport {
            requeue: plan.requeue,
            applied,
            rotated: plan.rotated,
            status: Some(plan.status),
        });
    }

    // Status reflects what the store reports after the writes, not the plan
    let Some(cluster) = store.get_cluster(key).await? else {
        debug!("PostgresCluster {} deleted during the pass", key);
        return Ok(PassReport {
            applied,
            ..PassReport::idle()
        });
    };
    let recorded = cluster.clone();
    let mut refreshed = ClusterSnapshot::fetch(store, cluster).await?;
    // Status has not caught up yet; the target chosen this pass still holds
    refreshed
        .cluster
        .status
        .get_or_insert_with(Default::default)
        .target_primary = plan.status.target_primary.clone();
    let observed = plan_cluster(&refreshed, &ctx.config);
    write_status_if_changed(store, key, &recorded, &observed.status).await?;

    if conflicted {
        debug!("Pass for {} ended early on a conflict", key);
    }
    Ok(PassReport {
        requeue: Requeue::Now,
        applied,
        rotated: plan.rotated,
        status: Some(observed.status),
    })
}

/// Controller entry point for PostgresCluster resources
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let key = ObjectKey::from_resource(cluster.as_ref())?;

    info!("Reconciling PostgresCluster");
    if spec_changed(&cluster) {
        info!(
            "Spec changed (generation: {:?} -> {:?})",
            cluster.status.as_ref().and_then(|s| s.observed_generation),
            cluster.metadata.generation
        );
    }
    let report = reconcile_cluster(&key, &ctx).await?;

    let metrics = &ctx.health_state.metrics;
    for mutation in &report.applied {
        metrics.record_mutation(mutation.kind().as_str(), mutation.verb());
    }
    if !report.rotated.is_empty() {
        metrics.record_rotations(&key.namespace, &key.name, report.rotated.len() as u64);
    }
    if let Some(ref status) = report.status {
        metrics.set_cluster_instances(
            &key.namespace,
            &key.name,
            i64::from(cluster.spec.instances),
            i64::from(status.ready_instances),
        );
    }
    metrics.record_reconcile(
        "PostgresCluster",
        &key.namespace,
        &key.name,
        start.elapsed().as_secs_f64(),
    );
    ctx.health_state.touch_reconcile();

    debug!(
        "Reconciliation completed: {} mutations, requeue {:?}",
        report.applied.len(),
        report.requeue
    );
    Ok(ctx.action_for("PostgresCluster", &key, report.requeue))
}

/// Error policy for the cluster controller with exponential backoff
pub fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    ctx.health_state
        .metrics
        .record_error("PostgresCluster", error.metric_label());

    let key = ObjectKey::from_resource(cluster.as_ref()).ok();
    let delay = ctx.error_delay("PostgresCluster", key.as_ref(), error);
    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }
    Action::requeue(delay)
}
