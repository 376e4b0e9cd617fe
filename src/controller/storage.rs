//! Storage provisioning: one data volume claim per ordinal
//!
//! Claims are only ever created here. Claims beyond the desired range are
//! reported as dangling and left alone; removing storage is an administrative
//! action outside the operator's authority.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

use crate::crd::PostgresCluster;
use crate::resources::common::parse_instance_ordinal;
use crate::resources::pvc::generate_pvc;

/// Outcome of comparing the desired ordinals with the live claims
#[derive(Debug, Clone, Default)]
pub struct VolumePlan {
    /// Claims to create, one per missing ordinal
    pub to_create: Vec<PersistentVolumeClaim>,
    /// Usable claims within the desired range, by ordinal
    pub provisioned: BTreeMap<i32, PersistentVolumeClaim>,
    /// In-range claims that are being deleted; neither usable nor recreated
    pub terminating: Vec<i32>,
    /// Claims for ordinals beyond the desired range
    pub dangling: Vec<String>,
    /// Labelled claims whose names this cluster would never derive
    pub unexpected: Vec<String>,
}

/// Plan volume claims for `1..=spec.instances`
pub fn ensure_volumes(cluster: &PostgresCluster, live: &[PersistentVolumeClaim]) -> VolumePlan {
    let cluster_name = cluster.name_any();
    let desired = cluster.spec.instances;
    let mut plan = VolumePlan::default();
    let mut seen = BTreeMap::new();

    for pvc in live {
        let name = pvc.name_any();
        match parse_instance_ordinal(&cluster_name, &name) {
            Some(ordinal) if ordinal <= desired => {
                seen.insert(ordinal, pvc);
            }
            Some(_) => plan.dangling.push(name),
            None => plan.unexpected.push(name),
        }
    }

    for ordinal in 1..=desired {
        match seen.get(&ordinal) {
            Some(pvc) if pvc.metadata.deletion_timestamp.is_some() => {
                plan.terminating.push(ordinal);
            }
            Some(pvc) => {
                plan.provisioned.insert(ordinal, (*pvc).clone());
            }
            None => plan.to_create.push(generate_pvc(cluster, ordinal)),
        }
    }

    plan.dangling.sort();
    plan.unexpected.sort();
    plan
}
