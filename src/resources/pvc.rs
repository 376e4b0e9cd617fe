//! Data volume claims, one per instance ordinal
//!
//! Claims are created once and never deleted by the operator. The
//! `pvc-status` annotation records whether the volume holds an initialized
//! data directory, which keeps bootstrap success durable after the
//! bootstrap job object is gone.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::PostgresCluster;
use crate::resources::common::{
    ANNOTATION_PVC_STATUS, Component, PVC_STATUS_INITIALIZING, PVC_STATUS_READY, instance_labels,
    instance_name, owner_reference,
};

/// Generate the data volume claim for an ordinal
pub fn generate_pvc(cluster: &PostgresCluster, ordinal: i32) -> PersistentVolumeClaim {
    let cluster_name = cluster.name_any();
    let storage = &cluster.spec.storage;

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(instance_name(&cluster_name, ordinal)),
            namespace: cluster.namespace(),
            labels: Some(instance_labels(&cluster_name, ordinal, Component::Instance)),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_PVC_STATUS.to_string(),
                PVC_STATUS_INITIALIZING.to_string(),
            )])),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Whether the claim records a completed bootstrap
pub fn pvc_is_ready(pvc: &PersistentVolumeClaim) -> bool {
    pvc.annotations()
        .get(ANNOTATION_PVC_STATUS)
        .is_some_and(|v| v == PVC_STATUS_READY)
}

/// Copy of the claim with the bootstrap-complete annotation set
///
/// The resource version is kept so the update is rejected if the claim
/// changed since it was read.
pub fn mark_pvc_ready(pvc: &PersistentVolumeClaim) -> PersistentVolumeClaim {
    let mut marked = pvc.clone();
    marked.annotations_mut().insert(
        ANNOTATION_PVC_STATUS.to_string(),
        PVC_STATUS_READY.to_string(),
    );
    // Status is server-owned; never send it back on update
    marked.status = None;
    marked
}
