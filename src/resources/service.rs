//! Cluster services routing to instance pods by role
//!
//! The reconciler labels each instance pod with its role, so the services
//! route traffic without any coordination beyond the pod labels:
//!
//! - `{cluster}-rw` selects the primary
//! - `{cluster}-ro` selects replicas
//! - `{cluster}-r` selects every instance

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{PoolerType, PostgresCluster};
use crate::resources::common::{
    Component, InstanceRole, LABEL_ROLE, component_labels, component_selector, owner_reference,
    service_name,
};
use crate::resources::pod::POSTGRES_PORT;

/// Every service role a cluster exposes
pub const SERVICE_ROLES: [PoolerType; 3] = [PoolerType::Rw, PoolerType::Ro, PoolerType::R];

/// Pod selector of the service for a role
pub fn service_selector(cluster_name: &str, role: PoolerType) -> BTreeMap<String, String> {
    let mut selector = component_selector(cluster_name, Component::Instance);
    match role {
        PoolerType::Rw => {
            selector.insert(
                LABEL_ROLE.to_string(),
                InstanceRole::Primary.as_str().to_string(),
            );
        }
        PoolerType::Ro => {
            selector.insert(
                LABEL_ROLE.to_string(),
                InstanceRole::Replica.as_str().to_string(),
            );
        }
        PoolerType::R => {}
    }
    selector
}

/// Generate the service for one role
pub fn generate_cluster_service(cluster: &PostgresCluster, role: PoolerType) -> Service {
    let cluster_name = cluster.name_any();
    let mut labels = component_labels(&cluster_name, Component::Service);
    labels.insert(LABEL_ROLE.to_string(), role.as_str().to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&cluster_name, role)),
            namespace: cluster.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(service_selector(&cluster_name, role)),
            ports: Some(vec![ServicePort {
                port: POSTGRES_PORT,
                target_port: Some(IntOrString::Int(POSTGRES_PORT)),
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Whether a live service routes differently than the desired one
///
/// Only the selector is compared; the platform fills in cluster IPs and
/// other defaults that must not cause churn.
pub fn service_needs_update(desired: &Service, live: &Service) -> bool {
    let selector = |svc: &Service| svc.spec.as_ref().and_then(|s| s.selector.clone());
    selector(desired) != selector(live)
}

/// Copy of the live service carrying the desired selector
pub fn with_desired_selector(desired: &Service, live: &Service) -> Service {
    let mut updated = live.clone();
    let selector = desired.spec.as_ref().and_then(|s| s.selector.clone());
    updated.spec.get_or_insert_with(ServiceSpec::default).selector = selector;
    updated.status = None;
    updated
}
