//! Admission webhook tests: requests in, JSON patches out.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use orbit_controller::crd::{ReplicationStatus, labels};
use orbit_controller::index::{NamespaceIndex, PodSettingIndex, ReplicationIndex};
use orbit_controller::webhooks::pod_settings::{self, ENV_IMAGE, ENV_USER_SPACE, NO_CHANGES_WARNING};
use orbit_controller::webhooks::{ImageReplicationWebhook, ImageRewriteConfig, ImageRewriter};

use crate::common::fixtures::*;

fn indexes(settings: Vec<orbit_controller::crd::PodSetting>) -> (NamespaceIndex, PodSettingIndex) {
    let (namespaces, _) = store_with(vec![
        team_namespace("lake"),
        user_namespace("lake-bob", "lake", "bob"),
    ]);
    let (settings, _) = store_with(settings);
    (NamespaceIndex::new(namespaces), PodSettingIndex::new(settings))
}

fn notebook_pod() -> Pod {
    PodBuilder::new("nb-0", "lake-bob")
        .label("tier", "gpu")
        .container("notebook", "jupyter:1")
        .container("proxy", "envoy:1")
        .build()
}

#[test]
fn test_pod_settings_patch_applies_matching_settings() {
    let (namespaces, settings) = indexes(vec![
        PodSettingBuilder::new("gpu", "lake")
            .match_label("tier", "gpu")
            .containers("note")
            .env("CUDA", "11")
            .node_selector("k8s.amazonaws.com/accelerator", "nvidia-tesla-v100")
            .build(),
        PodSettingBuilder::new("cpu", "lake")
            .match_label("tier", "cpu")
            .service_account("cpu-sa")
            .build(),
    ]);
    let pod = notebook_pod();

    let response = pod_settings::mutate(&admission_request(&pod, false), &namespaces, &settings);

    assert!(response.allowed);
    let mutated = patched(&pod, response.patch.as_deref().expect("patch"));
    assert_eq!(container_env(&mutated, "notebook", "CUDA").as_deref(), Some("11"));
    assert_eq!(container_env(&mutated, "notebook", ENV_IMAGE).as_deref(), Some("jupyter:1"));
    assert_eq!(
        container_env(&mutated, "notebook", ENV_USER_SPACE).as_deref(),
        Some("lake-bob")
    );
    assert_eq!(container_env(&mutated, "proxy", "CUDA"), None);
    assert_eq!(
        mutated.annotations().get(labels::APPLIED_PODSETTINGS).map(String::as_str),
        Some("gpu")
    );
    let spec = mutated.spec.as_ref().unwrap();
    assert!(spec.service_account_name.is_none());
    assert_eq!(
        spec.node_selector.as_ref().unwrap().get("accelerator").map(String::as_str),
        Some("nvidia-tesla-v100")
    );
    assert!(
        !spec.node_selector
            .as_ref()
            .unwrap()
            .contains_key("k8s.amazonaws.com/accelerator")
    );
}

#[test]
fn test_pod_settings_jsonpath_container_selector() {
    let (namespaces, settings) = indexes(vec![
        PodSettingBuilder::new("proxy-env", "lake")
            .match_label("tier", "gpu")
            .containers_at("$.spec.containers[?(@.image == 'envoy:1')].name")
            .env("PROXY", "on")
            .build(),
    ]);
    let pod = notebook_pod();

    let response = pod_settings::mutate(&admission_request(&pod, false), &namespaces, &settings);

    let mutated = patched(&pod, response.patch.as_deref().expect("patch"));
    assert_eq!(container_env(&mutated, "proxy", "PROXY").as_deref(), Some("on"));
    assert_eq!(container_env(&mutated, "notebook", "PROXY"), None);
}

#[test]
fn test_pod_settings_passthrough_cases() {
    let (namespaces, settings) = indexes(vec![
        PodSettingBuilder::new("gpu", "lake")
            .match_label("tier", "gpu")
            .service_account("gpu-sa")
            .build(),
    ]);

    // Dry runs are never mutated.
    let response = pod_settings::mutate(&admission_request(&notebook_pod(), true), &namespaces, &settings);
    assert!(response.allowed && response.patch.is_none());

    // Unknown namespace.
    let stray = PodBuilder::new("p", "elsewhere")
        .label("tier", "gpu")
        .container("c", "busybox")
        .build();
    let response = pod_settings::mutate(&admission_request(&stray, false), &namespaces, &settings);
    assert!(response.allowed && response.patch.is_none());

    // A pod without labels matches nothing.
    let bare = PodBuilder::new("p", "lake-bob").container("c", "busybox").build();
    let response = pod_settings::mutate(&admission_request(&bare, false), &namespaces, &settings);
    assert!(response.allowed && response.patch.is_none());
}

#[test]
fn test_pod_settings_warns_when_match_changes_nothing() {
    let (namespaces, settings) = indexes(vec![
        PodSettingBuilder::new("noop", "lake")
            .match_label("tier", "gpu")
            .build(),
    ]);

    let response = pod_settings::mutate(&admission_request(&notebook_pod(), false), &namespaces, &settings);

    assert!(response.allowed);
    assert!(response.patch.is_none());
    assert_eq!(response.warnings, Some(vec![NO_CHANGES_WARNING.to_string()]));
}

fn image_webhook(existing: Vec<orbit_controller::crd::ImageReplication>) -> (ImageReplicationWebhook, Arc<FakeRequester>) {
    let (store, _) = store_with(existing);
    let requester = Arc::new(FakeRequester::default());
    let rewriter = ImageRewriter::new(ImageRewriteConfig {
        repo_host: REPO_HOST.to_string(),
        repo_prefix: REPO_PREFIX.to_string(),
        replicate_external_repos: false,
    })
    .unwrap();
    (
        ImageReplicationWebhook::new(rewriter, ReplicationIndex::new(store), requester.clone()),
        requester,
    )
}

#[tokio::test]
async fn test_image_replication_rewrites_and_requests() {
    let (webhook, requester) = image_webhook(vec![image_replication(
        "image-replication-abc",
        "envoy:1",
        Some(ReplicationStatus::Complete),
    )]);
    let pod = PodBuilder::new("nb-0", "lake-bob")
        .init_container("init", "busybox:1")
        .container("notebook", "jupyter:1")
        .container("proxy", "envoy:1")
        .container("internal", &internal("tools:2"))
        .build();

    let response = webhook.mutate(&admission_request(&pod, false)).await;

    assert!(response.allowed);
    let mutated = patched(&pod, response.patch.as_deref().expect("patch"));
    let spec = mutated.spec.as_ref().unwrap();
    assert_eq!(
        spec.init_containers.as_ref().unwrap()[0].image.as_deref(),
        Some(internal("busybox:1").as_str())
    );
    let images: Vec<_> = spec.containers.iter().map(|c| c.image.clone().unwrap()).collect();
    assert_eq!(
        images,
        vec![internal("jupyter:1"), internal("envoy:1"), internal("tools:2")]
    );
    assert_eq!(
        mutated
            .annotations()
            .get("original-container-image/notebook")
            .map(String::as_str),
        Some("jupyter:1")
    );
    assert!(!mutated.annotations().contains_key("original-container-image/internal"));

    // envoy already has a live replication; tools was never rewritten.
    let mut requests = requester.requests.lock().unwrap().clone();
    requests.sort();
    assert_eq!(
        requests,
        vec![
            ("busybox:1".to_string(), internal("busybox:1")),
            ("jupyter:1".to_string(), internal("jupyter:1")),
        ]
    );
}

#[tokio::test]
async fn test_image_replication_skips_dry_run_and_internal_pods() {
    let (webhook, requester) = image_webhook(vec![]);

    let pod = PodBuilder::new("nb-0", "lake-bob").container("nb", "jupyter:1").build();
    let response = webhook.mutate(&admission_request(&pod, true)).await;
    assert!(response.patch.is_none());

    let internal_pod = PodBuilder::new("nb-1", "lake-bob")
        .container("nb", &internal("jupyter:1"))
        .build();
    let response = webhook.mutate(&admission_request(&internal_pod, false)).await;
    assert!(response.allowed && response.patch.is_none());

    assert!(requester.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_image_replication_after_failed_attempt_requests_once() {
    let (webhook, requester) = image_webhook(vec![image_replication(
        "image-replication-old",
        "jupyter:1",
        Some(ReplicationStatus::Failed),
    )]);
    let first = PodBuilder::new("nb-0", "lake-bob").container("nb", "jupyter:1").build();
    let second = PodBuilder::new("nb-1", "lake-bob").container("nb", "jupyter:1").build();

    webhook.mutate(&admission_request(&first, false)).await;
    webhook.mutate(&admission_request(&second, false)).await;

    assert_eq!(
        *requester.requests.lock().unwrap(),
        vec![("jupyter:1".to_string(), internal("jupyter:1"))]
    );
}

#[tokio::test]
async fn test_inventory_file_primes_replications() {
    let (webhook, requester) = image_webhook(vec![
        image_replication("image-replication-live", "jupyter:1", Some(ReplicationStatus::Replicating)),
        image_replication("image-replication-done", "envoy:1", Some(ReplicationStatus::MaxAttemptsExceeded)),
        image_replication("image-replication-old", "busybox:1", Some(ReplicationStatus::Failed)),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image_inventory.txt");
    std::fs::write(&path, "jupyter:1\nenvoy:1\nbusybox:1\npython:3.9\n").unwrap();

    let mut requested = webhook.prime_from_inventory(&path).await.unwrap();
    requested.sort();

    assert_eq!(requested, vec![internal("busybox:1"), internal("python:3.9")]);
    assert_eq!(requester.requests.lock().unwrap().len(), 2);
}
