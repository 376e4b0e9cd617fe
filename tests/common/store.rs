//! In-memory object store
//!
//! Implements [`ObjectStore`] over a map of objects and records every
//! mutating call, so tests can assert exactly what a reconciliation pass
//! did. Resource versions are assigned from a counter; replacing an object
//! with a stale version fails with a conflict, as the API server would.
//!
//! Helpers that simulate the platform (a job finishing, a pod turning
//! ready, a secret rotated by an external issuer) bypass the call log.
//! Deletion is immediate unless a finalizer is simulated with
//! [`MemoryStore::hold_terminating`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{ConfigMap, PodCondition, PodStatus, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use pgcluster_operator::config::OperatorConfig;
use pgcluster_operator::controller::cluster_reconciler::{PassReport, reconcile_cluster};
use pgcluster_operator::controller::error::{Error, Requeue, Result};
use pgcluster_operator::controller::pooler_reconciler::{PoolerReport, reconcile_pooler};
use pgcluster_operator::controller::store::{ChildKind, ChildObject, ObjectKey, ObjectStore};
use pgcluster_operator::controller::Context;
use pgcluster_operator::crd::{
    PostgresCluster, PostgresClusterStatus, PostgresPooler, PostgresPoolerStatus,
};
use pgcluster_operator::health::HealthState;

/// A mutating call received by the store
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(ChildKind, String),
    Replace(ChildKind, String),
    Delete(ChildKind, String),
    PatchClusterStatus(String),
    PatchPoolerStatus(String),
}

#[allow(dead_code)]
impl Call {
    /// Whether the call touched a child object rather than an owner's status
    pub fn is_child_mutation(&self) -> bool {
        !matches!(
            self,
            Call::PatchClusterStatus(_) | Call::PatchPoolerStatus(_)
        )
    }
}

type ChildId = (ChildKind, String, String);

#[derive(Default)]
struct Inner {
    clusters: BTreeMap<ObjectKey, PostgresCluster>,
    poolers: BTreeMap<ObjectKey, PostgresPooler>,
    children: BTreeMap<ChildId, ChildObject>,
    /// Objects a simulated finalizer keeps around after deletion
    held: BTreeSet<ChildId>,
    next_version: u64,
    calls: Vec<Call>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn mark_terminating(object: &mut ChildObject) {
    object
        .meta_mut()
        .deletion_timestamp
        .get_or_insert_with(|| Time(chrono::Utc::now()));
}

fn labels_match(object: &ChildObject, selector: &BTreeMap<String, String>) -> bool {
    let labels = object.meta().labels.clone().unwrap_or_default();
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Carry the status of the stored object over to its replacement
///
/// Status is a subresource; a full replace never changes it.
fn keep_status(stored: &ChildObject, replacement: &mut ChildObject) {
    match (stored, replacement) {
        (ChildObject::VolumeClaim(old), ChildObject::VolumeClaim(new)) => {
            new.status = old.status.clone()
        }
        (ChildObject::Job(old), ChildObject::Job(new)) => new.status = old.status.clone(),
        (ChildObject::Instance(old), ChildObject::Instance(new)) => {
            new.status = old.status.clone()
        }
        (ChildObject::Deployment(old), ChildObject::Deployment(new)) => {
            new.status = old.status.clone()
        }
        (ChildObject::Service(old), ChildObject::Service(new)) => new.status = old.status.clone(),
        _ => {}
    }
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Create or replace a cluster, bumping its generation when the spec changes
    pub fn put_cluster(&self, mut cluster: PostgresCluster) -> ObjectKey {
        let key = ObjectKey::from_resource(&cluster).unwrap();
        let mut inner = self.lock();
        let previous = inner.clusters.get(&key).cloned();
        let version = inner.bump();
        cluster.metadata.resource_version = Some(version);
        match previous {
            Some(previous) => {
                cluster.status = previous.status.clone();
                let generation = previous.metadata.generation.unwrap_or(1);
                cluster.metadata.generation = if previous.spec == cluster.spec {
                    Some(generation)
                } else {
                    Some(generation + 1)
                };
            }
            None => {
                cluster.metadata.generation.get_or_insert(1);
            }
        }
        inner.clusters.insert(key.clone(), cluster);
        key
    }

    /// Change the spec of a stored cluster
    pub fn update_cluster(&self, key: &ObjectKey, f: impl FnOnce(&mut PostgresCluster)) {
        let mut cluster = self.cluster(key).unwrap();
        f(&mut cluster);
        self.put_cluster(cluster);
    }

    pub fn put_pooler(&self, mut pooler: PostgresPooler) -> ObjectKey {
        let key = ObjectKey::from_resource(&pooler).unwrap();
        let mut inner = self.lock();
        let version = inner.bump();
        pooler.metadata.resource_version = Some(version);
        pooler.metadata.generation.get_or_insert(1);
        inner.poolers.insert(key.clone(), pooler);
        key
    }

    pub fn cluster(&self, key: &ObjectKey) -> Option<PostgresCluster> {
        self.lock().clusters.get(key).cloned()
    }

    pub fn cluster_status(&self, key: &ObjectKey) -> PostgresClusterStatus {
        self.cluster(key).and_then(|c| c.status).unwrap_or_default()
    }

    pub fn pooler(&self, key: &ObjectKey) -> Option<PostgresPooler> {
        self.lock().poolers.get(key).cloned()
    }

    pub fn pooler_status(&self, key: &ObjectKey) -> PostgresPoolerStatus {
        self.pooler(key).and_then(|p| p.status).unwrap_or_default()
    }

    /// Insert an object as if another actor had created it
    pub fn seed(&self, namespace: &str, mut object: ChildObject) {
        let mut inner = self.lock();
        let version = inner.bump();
        object.meta_mut().resource_version = Some(version);
        object.meta_mut().namespace = Some(namespace.to_string());
        let id = (object.kind(), namespace.to_string(), object.name());
        inner.children.insert(id, object);
    }

    pub fn put_secret(&self, namespace: &str, name: &str) {
        self.seed(
            namespace,
            ChildObject::Secret(Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }),
        );
    }

    /// Simulate an external rotation: same secret, new resource version
    pub fn rotate_secret(&self, namespace: &str, name: &str) {
        self.put_secret(namespace, name);
    }

    pub fn put_config_map(&self, namespace: &str, name: &str) {
        self.seed(
            namespace,
            ChildObject::ConfigMap(ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }),
        );
    }

    /// Remove an object without going through the operator
    pub fn external_delete(&self, kind: ChildKind, namespace: &str, name: &str) {
        self.lock()
            .children
            .remove(&(kind, namespace.to_string(), name.to_string()));
    }

    /// Deleting the object leaves it terminating until released
    pub fn hold_terminating(&self, kind: ChildKind, namespace: &str, name: &str) {
        self.lock()
            .held
            .insert((kind, namespace.to_string(), name.to_string()));
    }

    /// Delete an object from outside the operator while a finalizer holds it
    pub fn terminate(&self, kind: ChildKind, namespace: &str, name: &str) {
        let id = (kind, namespace.to_string(), name.to_string());
        let mut inner = self.lock();
        inner.held.insert(id.clone());
        if let Some(object) = inner.children.get_mut(&id) {
            mark_terminating(object);
        }
    }

    /// Drop the finalizer; a terminating object goes away
    pub fn release_terminating(&self, kind: ChildKind, namespace: &str, name: &str) {
        let id = (kind, namespace.to_string(), name.to_string());
        let mut inner = self.lock();
        inner.held.remove(&id);
        let terminating = inner
            .children
            .get(&id)
            .is_some_and(|o| o.meta().deletion_timestamp.is_some());
        if terminating {
            inner.children.remove(&id);
        }
    }

    pub fn object(&self, kind: ChildKind, namespace: &str, name: &str) -> Option<ChildObject> {
        self.lock()
            .children
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn objects(&self, kind: ChildKind, namespace: &str) -> Vec<ChildObject> {
        self.lock()
            .children
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Sorted names of the objects of a kind
    pub fn names(&self, kind: ChildKind, namespace: &str) -> Vec<String> {
        self.objects(kind, namespace)
            .iter()
            .map(ChildObject::name)
            .collect()
    }

    fn edit(&self, kind: ChildKind, namespace: &str, f: impl Fn(&mut ChildObject)) {
        let mut inner = self.lock();
        for ((k, ns, _), object) in inner.children.iter_mut() {
            if *k == kind && ns == namespace {
                f(object);
            }
        }
    }

    /// Every job in the namespace reports success
    pub fn complete_jobs(&self, namespace: &str) {
        self.edit(ChildKind::Job, namespace, |object| {
            if let ChildObject::Job(job) = object {
                job.status = Some(JobStatus {
                    succeeded: Some(1),
                    conditions: Some(vec![JobCondition {
                        type_: "Complete".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
            }
        });
    }

    pub fn fail_job(&self, namespace: &str, name: &str) {
        self.edit(ChildKind::Job, namespace, |object| {
            if let ChildObject::Job(job) = object
                && job.metadata.name.as_deref() == Some(name)
            {
                job.status = Some(JobStatus {
                    failed: Some(1),
                    conditions: Some(vec![JobCondition {
                        type_: "Failed".to_string(),
                        status: "True".to_string(),
                        reason: Some("BackoffLimitExceeded".to_string()),
                        message: Some("Job has reached the specified backoff limit".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
            }
        });
    }

    /// Every pod in the namespace is running and ready
    pub fn ready_pods(&self, namespace: &str) {
        self.edit(ChildKind::Instance, namespace, |object| {
            if let ChildObject::Instance(pod) = object {
                pod.status = Some(PodStatus {
                    phase: Some("Running".to_string()),
                    conditions: Some(vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
            }
        });
    }

    pub fn fail_pod(&self, namespace: &str, name: &str) {
        self.edit(ChildKind::Instance, namespace, |object| {
            if let ChildObject::Instance(pod) = object
                && pod.metadata.name.as_deref() == Some(name)
            {
                pod.status = Some(PodStatus {
                    phase: Some("Failed".to_string()),
                    ..Default::default()
                });
            }
        });
    }

    /// Every deployment reports all desired replicas ready
    pub fn ready_deployments(&self, namespace: &str) {
        self.edit(ChildKind::Deployment, namespace, |object| {
            if let ChildObject::Deployment(deployment) = object {
                let replicas = deployment.spec.as_ref().and_then(|s| s.replicas);
                deployment.status = Some(DeploymentStatus {
                    replicas,
                    ready_replicas: replicas,
                    ..Default::default()
                });
            }
        });
    }

    /// Annotate a deployment the way platform controllers do
    pub fn annotate_deployment(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.edit(ChildKind::Deployment, namespace, |object| {
            if let ChildObject::Deployment(deployment) = object
                && deployment.metadata.name.as_deref() == Some(name)
            {
                deployment
                    .metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(key.to_string(), value.to_string());
                if let Some(meta) = deployment
                    .spec
                    .as_mut()
                    .and_then(|s| s.template.metadata.as_mut())
                {
                    meta.annotations
                        .get_or_insert_with(BTreeMap::new)
                        .insert(key.to_string(), value.to_string());
                }
            }
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Calls that created, replaced or deleted a child object
    pub fn child_mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(Call::is_child_mutation)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<PostgresCluster>> {
        Ok(self.cluster(key))
    }

    async fn get_pooler(&self, key: &ObjectKey) -> Result<Option<PostgresPooler>> {
        Ok(self.pooler(key))
    }

    async fn patch_cluster_status(
        &self,
        key: &ObjectKey,
        status: &PostgresClusterStatus,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(Call::PatchClusterStatus(key.to_string()));
        let version = inner.bump();
        let cluster = inner
            .clusters
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        cluster.status = Some(status.clone());
        cluster.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn patch_pooler_status(
        &self,
        key: &ObjectKey,
        status: &PostgresPoolerStatus,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(Call::PatchPoolerStatus(key.to_string()));
        let version = inner.bump();
        let pooler = inner
            .poolers
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        pooler.status = Some(status.clone());
        pooler.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn list(
        &self,
        namespace: &str,
        kind: ChildKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ChildObject>> {
        Ok(self
            .objects(kind, namespace)
            .into_iter()
            .filter(|o| labels_match(o, selector))
            .collect())
    }

    async fn get(
        &self,
        namespace: &str,
        kind: ChildKind,
        name: &str,
    ) -> Result<Option<ChildObject>> {
        Ok(self.object(kind, namespace, name))
    }

    async fn create(&self, namespace: &str, object: &ChildObject) -> Result<()> {
        let mut inner = self.lock();
        let id = (object.kind(), namespace.to_string(), object.name());
        inner.calls.push(Call::Create(id.0, id.2.clone()));
        if inner.children.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("{} {}", id.0, id.2)));
        }
        let mut object = object.clone();
        let version = inner.bump();
        object.meta_mut().resource_version = Some(version);
        object.meta_mut().namespace = Some(namespace.to_string());
        inner.children.insert(id, object);
        Ok(())
    }

    async fn replace(&self, namespace: &str, object: &ChildObject) -> Result<()> {
        let mut inner = self.lock();
        let id = (object.kind(), namespace.to_string(), object.name());
        inner.calls.push(Call::Replace(id.0, id.2.clone()));
        let Some(stored) = inner.children.get(&id).cloned() else {
            return Err(Error::NotFound(format!("{} {}", id.0, id.2)));
        };
        if stored.resource_version() != object.resource_version() {
            return Err(Error::Conflict(format!("{} {}", id.0, id.2)));
        }
        let mut object = object.clone();
        keep_status(&stored, &mut object);
        let version = inner.bump();
        object.meta_mut().resource_version = Some(version);
        inner.children.insert(id, object);
        Ok(())
    }

    async fn delete(&self, namespace: &str, kind: ChildKind, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(Call::Delete(kind, name.to_string()));
        let id = (kind, namespace.to_string(), name.to_string());
        if inner.held.contains(&id) {
            let version = inner.bump();
            let object = inner
                .children
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("{} {}", kind, name)))?;
            mark_terminating(object);
            object.meta_mut().resource_version = Some(version);
            return Ok(());
        }
        inner
            .children
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{} {}", kind, name)))
    }
}

/// A store plus a context wired to it
#[allow(dead_code)]
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ctx: Context,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let ctx = Context::with_store(
            store.clone(),
            OperatorConfig::default(),
            Arc::new(HealthState::new()),
        );
        Self { store, ctx }
    }

    /// Run one cluster pass, starting with an empty call log
    pub async fn pass(&self, key: &ObjectKey) -> PassReport {
        self.store.clear_calls();
        reconcile_cluster(key, &self.ctx).await.unwrap()
    }

    /// Run one pooler pass, starting with an empty call log
    pub async fn pooler_pass(&self, key: &ObjectKey) -> Result<PoolerReport> {
        self.store.clear_calls();
        reconcile_pooler(key, &self.ctx).await
    }

    /// Pass until nothing is left to do, letting jobs finish and pods
    /// become ready between passes
    ///
    /// Returns every pass report in order.
    pub async fn converge(&self, key: &ObjectKey) -> Vec<PassReport> {
        let mut reports = Vec::new();
        for _ in 0..30 {
            self.store.complete_jobs(&key.namespace);
            self.store.ready_pods(&key.namespace);
            let report = self.pass(key).await;
            let done = report.requeue == Requeue::Never && report.applied.is_empty();
            reports.push(report);
            if done {
                return reports;
            }
        }
        panic!("cluster {} did not converge: {:?}", key, reports.last());
    }
}
