//! Unit tests for status management

use pgcluster_operator::controller::status::{
    ConditionBuilder, condition_status, condition_types, configuration_error_status, derive_phase,
    spec_changed,
};
use pgcluster_operator::crd::{
    ClusterPhase, Condition, InstancePhase, InstanceReadiness, InstanceStatus, PostgresCluster,
    PostgresClusterStatus,
};

use crate::common::*;

/// Helper to create a test cluster with optional status
fn create_test_cluster_with_status(
    generation: i64,
    status: Option<PostgresClusterStatus>,
) -> PostgresCluster {
    let mut cluster = PostgresClusterBuilder::new("test", "default")
        .with_generation(generation)
        .build();
    cluster.status = status;
    cluster
}

fn instance(ordinal: i32, phase: InstancePhase) -> InstanceStatus {
    InstanceStatus {
        name: format!("pg-{}", ordinal),
        ordinal,
        phase,
        readiness: InstanceReadiness::Unknown,
        refresh_pending: false,
        message: None,
    }
}

mod condition_builder_tests {
    use super::*;

    #[test]
    fn test_new_condition_builder() {
        let conditions = ConditionBuilder::new(Some(1)).build();
        assert!(conditions.is_empty());
    }

    #[test]
    fn test_set_condition_adds_new() {
        let conditions = ConditionBuilder::new(Some(1))
            .set_condition("TestCondition", "True", "TestReason", "Test message")
            .build();

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "TestCondition");
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].reason, "TestReason");
        assert_eq!(conditions[0].message, "Test message");
        assert_eq!(conditions[0].observed_generation, Some(1));
    }

    #[test]
    fn test_set_condition_updates_existing_same_status() {
        let existing = vec![Condition {
            type_: "TestCondition".to_string(),
            status: "True".to_string(),
            reason: "OldReason".to_string(),
            message: "Old message".to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            observed_generation: Some(1),
        }];

        let conditions = ConditionBuilder::from_existing(existing, Some(2))
            .set_condition("TestCondition", "True", "NewReason", "New message")
            .build();

        assert_eq!(conditions.len(), 1);
        // Status same, so transition time should NOT change
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].reason, "NewReason");
        assert_eq!(conditions[0].message, "New message");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_set_condition_updates_existing_different_status() {
        let existing = vec![Condition {
            type_: "TestCondition".to_string(),
            status: "True".to_string(),
            reason: "OldReason".to_string(),
            message: "Old message".to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            observed_generation: Some(1),
        }];

        let conditions = ConditionBuilder::from_existing(existing, Some(2))
            .set_condition("TestCondition", "False", "NewReason", "New message")
            .build();

        assert_eq!(conditions[0].status, "False");
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_cluster_found_condition_helper() {
        let conditions = ConditionBuilder::new(Some(1))
            .cluster_found(false, "ClusterNotFound", "PostgresCluster pg not found")
            .build();

        assert_eq!(conditions[0].type_, condition_types::CLUSTER_FOUND);
        assert_eq!(conditions[0].status, condition_status::FALSE);
    }

    #[test]
    fn test_multiple_conditions() {
        let conditions = ConditionBuilder::new(Some(1))
            .ready(true, "Ready", "Ready")
            .progressing(false, "Stable", "Stable")
            .degraded(false, "Healthy", "Healthy")
            .config_valid(true, "Valid", "Valid")
            .certificates_ready(true, "NotConfigured", "None")
            .build();

        assert_eq!(conditions.len(), 5);
    }
}

mod spec_changed_tests {
    use super::*;

    #[test]
    fn test_spec_changed_no_status() {
        let cluster = create_test_cluster_with_status(1, None);
        assert!(spec_changed(&cluster));
    }

    #[test]
    fn test_spec_unchanged() {
        let cluster = create_test_cluster_with_status(
            3,
            Some(PostgresClusterStatus {
                observed_generation: Some(3),
                ..Default::default()
            }),
        );
        assert!(!spec_changed(&cluster));
    }

    #[test]
    fn test_spec_changed_newer_generation() {
        let cluster = create_test_cluster_with_status(
            4,
            Some(PostgresClusterStatus {
                observed_generation: Some(3),
                ..Default::default()
            }),
        );
        assert!(spec_changed(&cluster));
    }
}

mod phase_tests {
    use super::*;

    #[test]
    fn test_all_ready_is_healthy() {
        let statuses = vec![
            instance(1, InstancePhase::Ready),
            instance(2, InstancePhase::Ready),
        ];
        assert_eq!(derive_phase(&statuses, false).0, ClusterPhase::Healthy);
    }

    #[test]
    fn test_partially_ready_is_degraded() {
        let statuses = vec![
            instance(1, InstancePhase::Ready),
            instance(2, InstancePhase::Bootstrapped),
        ];
        let (phase, reason) = derive_phase(&statuses, false);
        assert_eq!(phase, ClusterPhase::Degraded);
        assert_eq!(reason, "1 of 2 instances ready");
    }

    #[test]
    fn test_bootstrap_failure_wins() {
        let statuses = vec![
            instance(1, InstancePhase::Ready),
            instance(2, InstancePhase::Failed),
        ];
        let (phase, reason) = derive_phase(&statuses, true);
        assert_eq!(phase, ClusterPhase::Failed);
        assert!(reason.contains("pg-2"));
    }

    #[test]
    fn test_early_phases() {
        assert_eq!(
            derive_phase(&[instance(1, InstancePhase::NoVolume)], false).0,
            ClusterPhase::Provisioning
        );
        assert_eq!(
            derive_phase(&[instance(1, InstancePhase::Bootstrapping)], false).0,
            ClusterPhase::Bootstrapping
        );
        assert_eq!(
            derive_phase(&[instance(1, InstancePhase::Bootstrapped)], false).0,
            ClusterPhase::Starting
        );
    }

    #[test]
    fn test_configuration_error_keeps_observations() {
        let cluster = create_test_cluster_with_status(
            2,
            Some(PostgresClusterStatus {
                phase: ClusterPhase::Healthy,
                ready_instances: 3,
                current_primary: Some("pg-1".to_string()),
                ..Default::default()
            }),
        );
        let status = configuration_error_status(&cluster, "instance count 0 is below minimum 1");

        assert_eq!(status.phase, ClusterPhase::ConfigurationError);
        assert_eq!(status.ready_instances, 3);
        assert_eq!(status.current_primary.as_deref(), Some("pg-1"));
        assert_eq!(status.observed_generation, Some(2));
        let valid = status
            .conditions
            .iter()
            .find(|c| c.type_ == condition_types::CONFIG_VALID)
            .unwrap();
        assert_eq!(valid.status, condition_status::FALSE);
    }
}
