//! Unit tests for orbit-controller.
//!
//! These tests run without a Kubernetes cluster and exercise the public API
//! of individual components in isolation.

mod crd_tests {
    use std::collections::BTreeMap;

    use orbit_controller::crd::{ImageReplication, ReplicationStatus, Space, labels, selector_label};

    #[test]
    fn test_replication_status_display() {
        assert_eq!(ReplicationStatus::Pending.to_string(), "Pending");
        assert_eq!(ReplicationStatus::Replicating.to_string(), "Replicating");
        assert_eq!(ReplicationStatus::Complete.to_string(), "Complete");
        assert_eq!(ReplicationStatus::AlreadyReplicated.to_string(), "AlreadyReplicated");
        assert_eq!(ReplicationStatus::Failed.to_string(), "Failed");
        assert_eq!(ReplicationStatus::MaxAttemptsExceeded.to_string(), "MaxAttemptsExceeded");
    }

    #[test]
    fn test_replication_status_default() {
        assert_eq!(ReplicationStatus::default(), ReplicationStatus::Pending);
    }

    #[test]
    fn test_terminal_and_live_statuses() {
        let terminal: Vec<ReplicationStatus> = [
            ReplicationStatus::Pending,
            ReplicationStatus::Replicating,
            ReplicationStatus::Complete,
            ReplicationStatus::AlreadyReplicated,
            ReplicationStatus::Failed,
            ReplicationStatus::MaxAttemptsExceeded,
        ]
        .into_iter()
        .filter(ReplicationStatus::is_terminal)
        .collect();
        assert_eq!(
            terminal,
            vec![
                ReplicationStatus::Complete,
                ReplicationStatus::AlreadyReplicated,
                ReplicationStatus::MaxAttemptsExceeded
            ]
        );
        assert!(ReplicationStatus::Pending.is_live());
        assert!(ReplicationStatus::AlreadyReplicated.is_live());
        assert!(!ReplicationStatus::Failed.is_live());
        assert!(!ReplicationStatus::MaxAttemptsExceeded.is_live());
    }

    #[test]
    fn test_status_round_trips_as_plain_string() {
        let json = serde_json::to_string(&ReplicationStatus::MaxAttemptsExceeded).unwrap();
        assert_eq!(json, r#""MaxAttemptsExceeded""#);
    }

    #[test]
    fn test_missing_status_is_pending() {
        let ir: ImageReplication = serde_json::from_value(serde_json::json!({
            "apiVersion": "orbit.aws/v1",
            "kind": "ImageReplication",
            "metadata": {"name": "image-replication-abc12", "namespace": "orbit-system"},
            "spec": {"source": "jupyter:1", "destination": "registry/orbit/jupyter:1"}
        }))
        .unwrap();
        assert_eq!(ir.replication_status(), ReplicationStatus::Pending);
        assert_eq!(ir.attempts(), 0);
    }

    #[test]
    fn test_space_labels() {
        let team = BTreeMap::from([(labels::SPACE.to_string(), "team".to_string())]);
        let other = BTreeMap::from([(labels::SPACE.to_string(), "shared".to_string())]);
        assert_eq!(Space::from_labels(&team), Some(Space::Team));
        assert_eq!(Space::from_labels(&other), None);
        assert_eq!(Space::User.to_string(), "user");
    }

    #[test]
    fn test_pod_default_selector_label() {
        assert_eq!(selector_label("gpu"), "orbit/gpu");
    }
}

mod config_tests {
    use clap::Parser;
    use orbit_controller::{Cli, Command, WatchTarget};

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from([
            "orbit-controller",
            "watch",
            "imagereplications",
            "--repo-host",
            "123456789012.dkr.ecr.us-west-2.amazonaws.com",
            "--repo-prefix",
            "orbit-dev",
            "--codebuild-project",
            "orbit-dev-build",
        ])
        .unwrap();
        let config = &cli.config;
        assert_eq!(config.system_namespace, "orbit-system");
        assert_eq!(config.max_replication_attempts, 3);
        assert_eq!(config.inventory_path, "/var/orbit-controller/image_inventory.txt");
        assert!(config.validate(&cli.command).is_ok());

        let replication = config.replication_settings();
        assert_eq!(replication.max_attempts, 3);
        assert_eq!(replication.retry_delay.as_secs(), 30);
        assert!(matches!(
            cli.command,
            Command::Watch {
                target: WatchTarget::Imagereplications,
                workers: 2
            }
        ));
    }

    #[test]
    fn test_image_replication_watch_requires_registry_settings() {
        let cli = Cli::try_parse_from([
            "orbit-controller",
            "watch",
            "imagereplications",
            "--repo-prefix",
            "orbit-dev",
            "--codebuild-project",
            "orbit-dev-build",
        ])
        .unwrap();
        let err = cli.config.validate(&cli.command).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: REPO_HOST required for image replication"
        );

        let cli = Cli::try_parse_from(["orbit-controller", "watch", "podsettings"]).unwrap();
        assert!(cli.config.validate(&cli.command).is_ok());
    }

    #[test]
    fn test_mismatched_api_group_is_rejected() {
        let cli = Cli::try_parse_from([
            "orbit-controller",
            "--api-group",
            "example.com",
            "crd",
        ])
        .unwrap();
        assert!(cli.config.validate(&cli.command).is_err());
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        let cli = Cli::try_parse_from([
            "orbit-controller",
            "--max-replication-attempts",
            "0",
            "crd",
        ])
        .unwrap();
        assert!(cli.config.validate(&cli.command).is_err());
    }

    #[test]
    fn test_module_config_uses_target_name() {
        let cli = Cli::try_parse_from([
            "orbit-controller",
            "--worker-pause-millis",
            "250",
            "watch",
            "namespaces",
        ])
        .unwrap();
        let module = cli.config.module_config(WatchTarget::Namespaces, 0);
        assert_eq!(module.name, "namespacesWatcher");
        assert_eq!(module.workers, 1);
        assert_eq!(module.worker_pause.as_millis(), 250);
        assert_eq!(
            WatchTarget::Poddefaults.lease_name(),
            "orbit-controller-poddefaultswatcher"
        );
    }

    #[test]
    fn test_boolean_flags_take_values() {
        let cli = Cli::try_parse_from([
            "orbit-controller",
            "--replicate-external-repos",
            "yes",
            "--debug",
            "true",
            "crd",
        ])
        .unwrap();
        assert!(cli.config.image_rewrite_config().replicate_external_repos);
        assert_eq!(cli.config.log_directives(), "orbit_controller=debug,kube=info");
    }
}

mod selector_tests {
    use orbit_controller::{namespace_selector, pod_setting_selector, team_space_selector};

    #[test]
    fn test_watch_selectors() {
        assert_eq!(namespace_selector(), "orbit/space");
        assert_eq!(pod_setting_selector(), "orbit/space=team,!orbit/disable-watcher");
        assert_eq!(team_space_selector(), "orbit/space=team");
    }
}

mod crd_yaml_tests {
    #[test]
    fn test_crd_yaml_contains_owned_kinds() {
        let yaml = orbit_controller::crd_yaml().unwrap();
        assert_eq!(yaml.lines().filter(|l| *l == "---").count(), 2);
        assert!(yaml.contains("podsettings.orbit.aws"));
        assert!(yaml.contains("imagereplications.orbit.aws"));
        assert!(!yaml.contains("poddefaults"));
    }
}

mod build_tests {
    use orbit_controller::external::build::destination_repository;

    #[test]
    fn test_destination_repository() {
        let host = "123456789012.dkr.ecr.us-west-2.amazonaws.com";
        assert_eq!(
            destination_repository(host, &format!("{host}/orbit-dev/jupyter/base:1.0")),
            "orbit-dev/jupyter/base"
        );
        assert_eq!(destination_repository(host, "busybox"), "busybox");
    }
}
