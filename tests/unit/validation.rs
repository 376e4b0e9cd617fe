//! Unit tests for validation logic

use pgcluster_operator::controller::validation::{
    MIN_INSTANCES, validate_pooler_spec, validate_spec,
};

use crate::common::*;

mod instance_limits_tests {
    use super::*;

    #[test]
    fn test_min_instances_constant() {
        assert_eq!(MIN_INSTANCES, 1);
    }
}

mod validate_spec_tests {
    use super::*;

    #[test]
    fn test_valid_single_instance_spec() {
        let cluster = create_test_cluster("test", "default", 1);
        assert!(validate_spec(&cluster).is_ok());
    }

    #[test]
    fn test_valid_three_instance_spec() {
        let cluster = create_test_cluster("test", "default", 3);
        assert!(validate_spec(&cluster).is_ok());
    }

    #[test]
    fn test_invalid_instances_below_min() {
        let cluster = create_test_cluster("test", "default", 0);
        let result = validate_spec(&cluster);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("below minimum"));
    }

    #[test]
    fn test_large_instance_count_is_valid() {
        let cluster = create_test_cluster("test", "default", 250);
        assert!(validate_spec(&cluster).is_ok());
    }

    #[test]
    fn test_valid_storage_sizes() {
        for size in ["1Gi", "10Gi", "500Mi", "1.5Ti", "1G"] {
            let cluster = PostgresClusterBuilder::new("test", "default")
                .with_storage(size, None)
                .build();
            assert!(validate_spec(&cluster).is_ok(), "size {} rejected", size);
        }
    }

    #[test]
    fn test_invalid_storage_size() {
        for size in ["", "Gi", "ten", "-1Gi", "1..5Gi", "0"] {
            let cluster = PostgresClusterBuilder::new("test", "default")
                .with_storage(size, None)
                .build();
            assert!(validate_spec(&cluster).is_err(), "size {:?} accepted", size);
        }
    }

    #[test]
    fn test_long_cluster_name_rejected() {
        let name = "p".repeat(51);
        let cluster = create_test_cluster(&name, "default", 1);
        assert!(validate_spec(&cluster).is_err());
    }

    #[test]
    fn test_empty_certificate_secret_rejected() {
        let cluster = PostgresClusterBuilder::new("test", "default")
            .with_certificates("server-ca", " ")
            .build();
        let err = validate_spec(&cluster).unwrap_err();
        assert!(err.to_string().contains("clientCASecret"));
    }

    #[test]
    fn test_empty_config_map_name_rejected() {
        let cluster = PostgresClusterBuilder::new("test", "default")
            .with_custom_queries("")
            .build();
        assert!(validate_spec(&cluster).is_err());
    }
}

mod validate_pooler_tests {
    use super::*;

    #[test]
    fn test_valid_pooler() {
        let pooler = create_test_pooler("pooler", "default", "pg");
        assert!(validate_pooler_spec(&pooler).is_ok());
    }

    #[test]
    fn test_pooler_scaled_to_zero_is_valid() {
        let pooler = PostgresPoolerBuilder::new("pooler", "default", "pg")
            .with_instances(0)
            .build();
        assert!(validate_pooler_spec(&pooler).is_ok());
    }

    #[test]
    fn test_negative_pooler_instances_rejected() {
        let pooler = PostgresPoolerBuilder::new("pooler", "default", "pg")
            .with_instances(-1)
            .build();
        assert!(validate_pooler_spec(&pooler).is_err());
    }

    #[test]
    fn test_missing_cluster_reference_rejected() {
        let pooler = create_test_pooler("pooler", "default", "");
        assert!(validate_pooler_spec(&pooler).is_err());
    }
}
