// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for naming and cluster convergence
//!
//! These tests use proptest to generate random configurations and verify that:
//! 1. Child names are deterministic and parse back to the ordinal they encode
//! 2. Any instance count converges to exactly one claim and one pod per ordinal
//! 3. Scaling down never deletes storage
//! 4. Validation is deterministic (same input = same output)

#[path = "../common/mod.rs"]
mod common;

use proptest::prelude::*;

use pgcluster_operator::controller::store::ChildKind;
use pgcluster_operator::controller::validation::validate_spec;
use pgcluster_operator::crd::ClusterPhase;
use pgcluster_operator::resources::common::{
    instance_name, job_name, parse_instance_ordinal, parse_job_ordinal,
};

use common::*;

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

/// Cluster names that are valid DNS labels
fn cluster_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,10}(-[a-z0-9]{1,8}){0,2}"
}

fn expected_names(name: &str, n: i32) -> Vec<String> {
    let mut names: Vec<String> = (1..=n).map(|o| instance_name(name, o)).collect();
    names.sort();
    names
}

// =============================================================================
// Naming
// =============================================================================

proptest! {
    #[test]
    fn instance_names_round_trip(name in cluster_name(), ordinal in 1i32..10_000) {
        let derived = instance_name(&name, ordinal);
        prop_assert_eq!(&derived, &instance_name(&name, ordinal));
        prop_assert_eq!(parse_instance_ordinal(&name, &derived), Some(ordinal));
    }

    #[test]
    fn job_names_round_trip(name in cluster_name(), ordinal in 1i32..10_000) {
        let derived = job_name(&name, ordinal);
        prop_assert_eq!(parse_job_ordinal(&name, &derived), Some(ordinal));
        // A job is never mistaken for an instance of the same cluster
        prop_assert_eq!(parse_instance_ordinal(&name, &derived), None);
    }

    #[test]
    fn instance_names_are_injective(
        name in cluster_name(),
        a in 1i32..10_000,
        b in 1i32..10_000,
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(instance_name(&name, a), instance_name(&name, b));
    }

    #[test]
    fn non_canonical_ordinals_are_rejected(name in cluster_name(), ordinal in 1i32..1000) {
        let padded = format!("{}-0{}", name, ordinal);
        prop_assert_eq!(parse_instance_ordinal(&name, &padded), None);
        let signed = format!("{}-+{}", name, ordinal);
        prop_assert_eq!(parse_instance_ordinal(&name, &signed), None);
    }

    #[test]
    fn validation_is_deterministic(instances in -5i32..120) {
        let cluster = create_test_cluster("pg", "default", instances);
        let first = validate_spec(&cluster).is_ok();
        let second = validate_spec(&cluster).is_ok();
        prop_assert_eq!(first, second);
        prop_assert_eq!(first, instances >= 1);
    }
}

// =============================================================================
// Convergence
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn every_ordinal_gets_one_claim_and_one_pod(n in 1i32..6) {
        let (claims, pods, jobs, phase) = block_on(async {
            let harness = Harness::new();
            let key = harness.store.put_cluster(create_test_cluster("pg", "default", n));
            harness.converge(&key).await;
            (
                harness.store.names(ChildKind::VolumeClaim, "default"),
                harness.store.names(ChildKind::Instance, "default"),
                harness.store.names(ChildKind::Job, "default"),
                harness.store.cluster_status(&key).phase,
            )
        });

        prop_assert_eq!(&claims, &expected_names("pg", n));
        prop_assert_eq!(&pods, &expected_names("pg", n));
        prop_assert_eq!(jobs.len() as i32, n);
        prop_assert_eq!(phase, ClusterPhase::Healthy);
    }

    #[test]
    fn scale_down_never_deletes_storage(from in 2i32..6, to in 1i32..5) {
        prop_assume!(to < from);
        let (claims, pods, dangling, claim_deletes) = block_on(async {
            let harness = Harness::new();
            let key = harness.store.put_cluster(create_test_cluster("pg", "default", from));
            harness.converge(&key).await;

            harness.store.update_cluster(&key, |cluster| cluster.spec.instances = to);
            let reports = harness.converge(&key).await;
            let claim_deletes = reports
                .iter()
                .flat_map(|r| r.applied.iter())
                .filter(|m| m.verb() == "delete" && m.kind() == ChildKind::VolumeClaim)
                .count();
            (
                harness.store.names(ChildKind::VolumeClaim, "default"),
                harness.store.names(ChildKind::Instance, "default"),
                harness.store.cluster_status(&key).dangling_pvc,
                claim_deletes,
            )
        });

        prop_assert_eq!(claim_deletes, 0);
        prop_assert_eq!(&claims, &expected_names("pg", from));
        prop_assert_eq!(&pods, &expected_names("pg", to));

        let mut expected_dangling: Vec<String> =
            ((to + 1)..=from).map(|o| instance_name("pg", o)).collect();
        expected_dangling.sort();
        let mut dangling = dangling;
        dangling.sort();
        prop_assert_eq!(dangling, expected_dangling);
    }
}
