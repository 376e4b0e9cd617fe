//! Access to the platform object store
//!
//! Reconcilers never talk to `kube::Api` directly. They read and write
//! through [`ObjectStore`], injected via [`crate::controller::Context`], so
//! every pass can be driven against an in-memory store in tests.
//!
//! Child resources are a closed set of kinds, represented by [`ChildKind`]
//! and [`ChildObject`] rather than by dynamic objects.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::{PostgresCluster, PostgresClusterStatus, PostgresPooler, PostgresPoolerStatus};
use crate::resources::common::{FIELD_MANAGER, selector_string};

/// Namespace and name of an owner object; the reconciliation key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced resource
    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self> {
        let namespace = obj
            .meta()
            .namespace
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        Ok(Self { namespace, name })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kinds of child objects the operator reads or manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    VolumeClaim,
    Job,
    Instance,
    Deployment,
    Service,
    Secret,
    ConfigMap,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::VolumeClaim => "PersistentVolumeClaim",
            ChildKind::Job => "Job",
            ChildKind::Instance => "Pod",
            ChildKind::Deployment => "Deployment",
            ChildKind::Service => "Service",
            ChildKind::Secret => "Secret",
            ChildKind::ConfigMap => "ConfigMap",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A child object of one of the known kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ChildObject {
    VolumeClaim(PersistentVolumeClaim),
    Job(Job),
    Instance(Pod),
    Deployment(Deployment),
    Service(Service),
    Secret(Secret),
    ConfigMap(ConfigMap),
}

impl ChildObject {
    pub fn kind(&self) -> ChildKind {
        match self {
            ChildObject::VolumeClaim(_) => ChildKind::VolumeClaim,
            ChildObject::Job(_) => ChildKind::Job,
            ChildObject::Instance(_) => ChildKind::Instance,
            ChildObject::Deployment(_) => ChildKind::Deployment,
            ChildObject::Service(_) => ChildKind::Service,
            ChildObject::Secret(_) => ChildKind::Secret,
            ChildObject::ConfigMap(_) => ChildKind::ConfigMap,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ChildObject::VolumeClaim(o) => &o.metadata,
            ChildObject::Job(o) => &o.metadata,
            ChildObject::Instance(o) => &o.metadata,
            ChildObject::Deployment(o) => &o.metadata,
            ChildObject::Service(o) => &o.metadata,
            ChildObject::Secret(o) => &o.metadata,
            ChildObject::ConfigMap(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ChildObject::VolumeClaim(o) => &mut o.metadata,
            ChildObject::Job(o) => &mut o.metadata,
            ChildObject::Instance(o) => &mut o.metadata,
            ChildObject::Deployment(o) => &mut o.metadata,
            ChildObject::Service(o) => &mut o.metadata,
            ChildObject::Secret(o) => &mut o.metadata,
            ChildObject::ConfigMap(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    pub fn into_volume_claim(self) -> Option<PersistentVolumeClaim> {
        match self {
            ChildObject::VolumeClaim(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_job(self) -> Option<Job> {
        match self {
            ChildObject::Job(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_instance(self) -> Option<Pod> {
        match self {
            ChildObject::Instance(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_deployment(self) -> Option<Deployment> {
        match self {
            ChildObject::Deployment(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_service(self) -> Option<Service> {
        match self {
            ChildObject::Service(o) => Some(o),
            _ => None,
        }
    }
}

/// A single change a reconciliation pass wants applied
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create(ChildObject),
    /// Full replacement; carries the observed resource version
    Update(ChildObject),
    Delete { kind: ChildKind, name: String },
}

impl Mutation {
    pub fn verb(&self) -> &'static str {
        match self {
            Mutation::Create(_) => "create",
            Mutation::Update(_) => "update",
            Mutation::Delete { .. } => "delete",
        }
    }

    pub fn kind(&self) -> ChildKind {
        match self {
            Mutation::Create(o) | Mutation::Update(o) => o.kind(),
            Mutation::Delete { kind, .. } => *kind,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Mutation::Create(o) | Mutation::Update(o) => o.name(),
            Mutation::Delete { name, .. } => name.clone(),
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.verb(), self.kind(), self.name())
    }
}

/// Apply one mutation
///
/// Creating an object that already exists and deleting one that is already
/// gone both count as success. Replacing a vanished object is reported as a
/// conflict: the pass observed state that no longer holds.
pub async fn apply_mutation(
    store: &dyn ObjectStore,
    namespace: &str,
    mutation: &Mutation,
) -> Result<()> {
    let result = match mutation {
        Mutation::Create(object) => store.create(namespace, object).await,
        Mutation::Update(object) => store.replace(namespace, object).await,
        Mutation::Delete { kind, name } => store.delete(namespace, *kind, name).await,
    };
    match (mutation, result) {
        (Mutation::Create(_), Err(e)) if e.is_already_exists() => {
            debug!("{} already converged: {}", mutation, e);
            Ok(())
        }
        (Mutation::Delete { .. }, Err(e)) if e.is_not_found() => {
            debug!("{} already converged: {}", mutation, e);
            Ok(())
        }
        (Mutation::Update(_), Err(e)) if e.is_not_found() => {
            Err(Error::Conflict(format!("{} vanished before update", mutation.name())))
        }
        (_, result) => result,
    }
}

/// The platform object store
///
/// Creation of an existing object fails with [`Error::AlreadyExists`], an
/// update with a stale resource version with [`Error::Conflict`], and a
/// delete of a missing object with [`Error::NotFound`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<PostgresCluster>>;

    async fn get_pooler(&self, key: &ObjectKey) -> Result<Option<PostgresPooler>>;

    async fn patch_cluster_status(
        &self,
        key: &ObjectKey,
        status: &PostgresClusterStatus,
    ) -> Result<()>;

    async fn patch_pooler_status(&self, key: &ObjectKey, status: &PostgresPoolerStatus)
    -> Result<()>;

    /// List children of a kind whose labels contain every pair in `selector`
    async fn list(
        &self,
        namespace: &str,
        kind: ChildKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ChildObject>>;

    async fn get(&self, namespace: &str, kind: ChildKind, name: &str)
    -> Result<Option<ChildObject>>;

    async fn create(&self, namespace: &str, object: &ChildObject) -> Result<()>;

    async fn replace(&self, namespace: &str, object: &ChildObject) -> Result<()>;

    async fn delete(&self, namespace: &str, kind: ChildKind, name: &str) -> Result<()>;
}

/// [`ObjectStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Translate API failures into the store's error contract
fn classify(err: kube::Error, kind: ChildKind, name: &str) -> Error {
    match &err {
        kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists" => {
            Error::AlreadyExists(format!("{} {}", kind, name))
        }
        kube::Error::Api(api_err) if api_err.code == 409 => {
            Error::Conflict(format!("{} {}", kind, name))
        }
        kube::Error::Api(api_err) if api_err.code == 404 => {
            Error::NotFound(format!("{} {}", kind, name))
        }
        _ => Error::KubeError(err),
    }
}

async fn list_as<K>(api: Api<K>, selector: &BTreeMap<String, String>) -> Result<Vec<K>>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug,
{
    let params = ListParams::default().labels(&selector_string(selector));
    Ok(api.list(&params).await?.items)
}

async fn create_as<K>(api: Api<K>, object: &K, kind: ChildKind) -> Result<()>
where
    K: Resource + Clone + Serialize + DeserializeOwned + fmt::Debug,
{
    let params = PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    let name = object.name_any();
    api.create(&params, object)
        .await
        .map_err(|e| classify(e, kind, &name))?;
    Ok(())
}

async fn replace_as<K>(api: Api<K>, object: &K, kind: ChildKind) -> Result<()>
where
    K: Resource + Clone + Serialize + DeserializeOwned + fmt::Debug,
{
    let params = PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    let name = object.name_any();
    api.replace(&name, &params, object)
        .await
        .map_err(|e| classify(e, kind, &name))?;
    Ok(())
}

async fn delete_as<K>(api: Api<K>, name: &str, kind: ChildKind) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug,
{
    api.delete(name, &DeleteParams::background())
        .await
        .map_err(|e| classify(e, kind, name))?;
    Ok(())
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<PostgresCluster>> {
        let api: Api<PostgresCluster> = self.api(&key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn get_pooler(&self, key: &ObjectKey) -> Result<Option<PostgresPooler>> {
        let api: Api<PostgresPooler> = self.api(&key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn patch_cluster_status(
        &self,
        key: &ObjectKey,
        status: &PostgresClusterStatus,
    ) -> Result<()> {
        let api: Api<PostgresCluster> = self.api(&key.namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            &key.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        debug!("Patched status of PostgresCluster {}", key);
        Ok(())
    }

    async fn patch_pooler_status(
        &self,
        key: &ObjectKey,
        status: &PostgresPoolerStatus,
    ) -> Result<()> {
        let api: Api<PostgresPooler> = self.api(&key.namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            &key.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        debug!("Patched status of PostgresPooler {}", key);
        Ok(())
    }

    async fn list(
        &self,
        namespace: &str,
        kind: ChildKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ChildObject>> {
        let objects = match kind {
            ChildKind::VolumeClaim => list_as(self.api::<PersistentVolumeClaim>(namespace), selector)
                .await?
                .into_iter()
                .map(ChildObject::VolumeClaim)
                .collect(),
            ChildKind::Job => list_as(self.api::<Job>(namespace), selector)
                .await?
                .into_iter()
                .map(ChildObject::Job)
                .collect(),
            ChildKind::Instance => list_as(self.api::<Pod>(namespace), selector)
                .await?
                .into_iter()
                .map(ChildObject::Instance)
                .collect(),
            ChildKind::Deployment => list_as(self.api::<Deployment>(namespace), selector)
                .await?
                .into_iter()
                .map(ChildObject::Deployment)
                .collect(),
            ChildKind::Service => list_as(self.api::<Service>(namespace), selector)
                .await?
                .into_iter()
                .map(ChildObject::Service)
                .collect(),
            ChildKind::Secret => list_as(self.api::<Secret>(namespace), selector)
                .await?
                .into_iter()
                .map(ChildObject::Secret)
                .collect(),
            ChildKind::ConfigMap => list_as(self.api::<ConfigMap>(namespace), selector)
                .await?
                .into_iter()
                .map(ChildObject::ConfigMap)
                .collect(),
        };
        Ok(objects)
    }

    async fn get(
        &self,
        namespace: &str,
        kind: ChildKind,
        name: &str,
    ) -> Result<Option<ChildObject>> {
        let object = match kind {
            ChildKind::VolumeClaim => self
                .api::<PersistentVolumeClaim>(namespace)
                .get_opt(name)
                .await?
                .map(ChildObject::VolumeClaim),
            ChildKind::Job => self
                .api::<Job>(namespace)
                .get_opt(name)
                .await?
                .map(ChildObject::Job),
            ChildKind::Instance => self
                .api::<Pod>(namespace)
                .get_opt(name)
                .await?
                .map(ChildObject::Instance),
            ChildKind::Deployment => self
                .api::<Deployment>(namespace)
                .get_opt(name)
                .await?
                .map(ChildObject::Deployment),
            ChildKind::Service => self
                .api::<Service>(namespace)
                .get_opt(name)
                .await?
                .map(ChildObject::Service),
            ChildKind::Secret => self
                .api::<Secret>(namespace)
                .get_opt(name)
                .await?
                .map(ChildObject::Secret),
            ChildKind::ConfigMap => self
                .api::<ConfigMap>(namespace)
                .get_opt(name)
                .await?
                .map(ChildObject::ConfigMap),
        };
        Ok(object)
    }

    async fn create(&self, namespace: &str, object: &ChildObject) -> Result<()> {
        let kind = object.kind();
        match object {
            ChildObject::VolumeClaim(o) => create_as(self.api(namespace), o, kind).await,
            ChildObject::Job(o) => create_as(self.api(namespace), o, kind).await,
            ChildObject::Instance(o) => create_as(self.api(namespace), o, kind).await,
            ChildObject::Deployment(o) => create_as(self.api(namespace), o, kind).await,
            ChildObject::Service(o) => create_as(self.api(namespace), o, kind).await,
            ChildObject::Secret(o) => create_as(self.api(namespace), o, kind).await,
            ChildObject::ConfigMap(o) => create_as(self.api(namespace), o, kind).await,
        }
    }

    async fn replace(&self, namespace: &str, object: &ChildObject) -> Result<()> {
        let kind = object.kind();
        match object {
            ChildObject::VolumeClaim(o) => replace_as(self.api(namespace), o, kind).await,
            ChildObject::Job(o) => replace_as(self.api(namespace), o, kind).await,
            ChildObject::Instance(o) => replace_as(self.api(namespace), o, kind).await,
            ChildObject::Deployment(o) => replace_as(self.api(namespace), o, kind).await,
            ChildObject::Service(o) => replace_as(self.api(namespace), o, kind).await,
            ChildObject::Secret(o) => replace_as(self.api(namespace), o, kind).await,
            ChildObject::ConfigMap(o) => replace_as(self.api(namespace), o, kind).await,
        }
    }

    async fn delete(&self, namespace: &str, kind: ChildKind, name: &str) -> Result<()> {
        match kind {
            ChildKind::VolumeClaim => {
                delete_as(self.api::<PersistentVolumeClaim>(namespace), name, kind).await
            }
            ChildKind::Job => delete_as(self.api::<Job>(namespace), name, kind).await,
            ChildKind::Instance => delete_as(self.api::<Pod>(namespace), name, kind).await,
            ChildKind::Deployment => delete_as(self.api::<Deployment>(namespace), name, kind).await,
            ChildKind::Service => delete_as(self.api::<Service>(namespace), name, kind).await,
            ChildKind::Secret => delete_as(self.api::<Secret>(namespace), name, kind).await,
            ChildKind::ConfigMap => delete_as(self.api::<ConfigMap>(namespace), name, kind).await,
        }
    }
}
