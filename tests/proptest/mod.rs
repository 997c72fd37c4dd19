// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for orbit-controller.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, Namespace, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, ObjectMeta};
use orbit_controller::crd::{ContainerSelector, PodSetting, PodSettingSpec};
use orbit_controller::webhooks::{ImageRewriteConfig, ImageRewriter, apply_pod_setting, selector_matches};
use proptest::prelude::*;

const REPO_HOST: &str = "123456789012.dkr.ecr.us-west-2.amazonaws.com";

/// Strategy for label keys and values.
fn label_part() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,8}"
}

fn label_map(max: usize) -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(label_part(), label_part(), 0..max)
}

/// Strategy for image references in the shapes pods actually use.
fn image() -> impl Strategy<Value = String> {
    let name = "[a-z][a-z0-9-]{0,10}(/[a-z][a-z0-9-]{0,10}){0,2}";
    let tag = prop_oneof![
        Just(String::new()),
        "[a-z0-9.]{1,6}".prop_map(|t| format!(":{t}")),
        "[a-f0-9]{64}".prop_map(|d| format!("@sha256:{d}")),
    ];
    let registry = prop_oneof![
        Just(String::new()),
        Just("docker.io/".to_string()),
        Just("quay.io/".to_string()),
        Just("public.ecr.aws/lambda/".to_string()),
        Just("999999999999.dkr.ecr.eu-west-1.amazonaws.com/".to_string()),
    ];
    (registry, name, tag).prop_map(|(r, n, t)| format!("{r}{n}{t}"))
}

fn rewriter(replicate_external_repos: bool) -> ImageRewriter {
    ImageRewriter::new(ImageRewriteConfig {
        repo_host: REPO_HOST.to_string(),
        repo_prefix: "orbit-dev".to_string(),
        replicate_external_repos,
    })
    .unwrap()
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

proptest! {
    /// Unlabeled pods are never selected.
    #[test]
    fn unlabeled_pods_never_match(selector_labels in label_map(4)) {
        let selector = LabelSelector {
            match_labels: Some(selector_labels),
            match_expressions: None,
        };
        prop_assert!(!selector_matches(&selector, &BTreeMap::new()));
    }

    /// A selector without criteria selects nothing.
    #[test]
    fn empty_selector_never_matches(labels in label_map(6)) {
        prop_assert!(!selector_matches(&LabelSelector::default(), &labels));
    }

    /// Any non-empty subset of a pod's labels selects it.
    #[test]
    fn label_subset_matches(labels in label_map(6), take in 1usize..6) {
        prop_assume!(!labels.is_empty());
        let subset: BTreeMap<String, String> =
            labels.iter().take(take).map(|(k, v)| (k.clone(), v.clone())).collect();
        let selector = LabelSelector {
            match_labels: Some(subset),
            match_expressions: None,
        };
        prop_assert!(selector_matches(&selector, &labels));
    }

    /// `Exists` and `DoesNotExist` on the same key are mutually exclusive.
    #[test]
    fn exists_and_does_not_exist_disagree(labels in label_map(6), key in label_part()) {
        prop_assume!(!labels.is_empty());
        let expr = |operator: &str| LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: key.clone(),
                operator: operator.to_string(),
                values: None,
            }]),
        };
        prop_assert_ne!(
            selector_matches(&expr("Exists"), &labels),
            selector_matches(&expr("DoesNotExist"), &labels)
        );
    }

    /// Rewritten images either stay put or land under the internal registry,
    /// and rewriting is idempotent.
    #[test]
    fn desired_image_is_idempotent(image in image(), external in any::<bool>()) {
        let rewriter = rewriter(external);
        let desired = rewriter.desired_image(&image);
        if desired.starts_with(REPO_HOST) {
            prop_assert!(!desired.contains("@sha256"));
            prop_assert_eq!(rewriter.desired_image(&desired), desired.clone());
        } else {
            prop_assert_eq!(desired, image);
        }
    }

    /// Without external replication, foreign ECR images are left alone.
    #[test]
    fn foreign_ecr_untouched_without_external_replication(name in "[a-z]{1,10}:[0-9]{1,3}") {
        let image = format!("999999999999.dkr.ecr.eu-west-1.amazonaws.com/{name}");
        prop_assert_eq!(rewriter(false).desired_image(&image), image);
    }

    /// Env vars stay unique by name however often a PodSetting is applied.
    #[test]
    fn env_is_deduplicated_by_name(
        names in prop::collection::btree_set("[A-Z]{1,4}", 1..6),
        applications in 1usize..4,
    ) {
        let names: Vec<String> = names.into_iter().collect();
        let spec = PodSettingSpec {
            container_selector: ContainerSelector { regex: Some("*".to_string()), jsonpath: None },
            env: names.iter().map(|n| env(n, "from-setting")).collect(),
            ..Default::default()
        };
        let ps = PodSetting::new("env", spec);
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some("lake-bob".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some("nb".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "notebook".to_string(),
                    env: Some(vec![env(&names[0], "from-pod")]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        for _ in 0..applications {
            apply_pod_setting(&mut pod, &namespace, &ps).unwrap();
        }

        let vars = pod.spec.unwrap().containers[0].env.clone().unwrap();
        let mut seen: Vec<&str> = vars.iter().map(|e| e.name.as_str()).collect();
        let total = seen.len();
        seen.sort_unstable();
        seen.dedup();
        prop_assert_eq!(seen.len(), total);
    }
}
