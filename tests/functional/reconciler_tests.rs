//! Reconciler scenarios across namespaces, PodSettings, PodDefaults and
//! ImageReplications.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use orbit_controller::controller::{
    ImageReplicationReconciler, NamespaceReconciler, PodDefaultReconciler, PodSettingReconciler,
    ReplicationClient, ReplicationLedger, ReplicationSettings, Result,
};
use orbit_controller::crd::{ImageReplication, ImageReplicationStatus, PodDefault, ReplicationStatus, Space, labels};
use orbit_controller::external::BuildState;
use orbit_controller::index::{NamespaceIndex, PodSettingIndex, ReplicationIndex};
use orbit_controller::watch::Reconciler;

use crate::common::fixtures::*;

fn lake_namespaces() -> NamespaceIndex {
    let (store, _) = store_with(vec![
        team_namespace("lake"),
        user_namespace("lake-alice", "lake", "alice"),
        user_namespace("lake-bob", "lake", "bob"),
        user_namespace("ocean-carol", "ocean", "carol"),
    ]);
    NamespaceIndex::new(store)
}

#[tokio::test]
async fn test_pod_setting_lifecycle_propagates_pod_defaults() {
    let pod_defaults = Arc::new(FakePodDefaults::default());
    let reconciler = PodSettingReconciler::new(lake_namespaces(), pod_defaults.clone());
    let ps = PodSettingBuilder::new("gpu", "lake")
        .desc("GPU notebooks")
        .uid("ps-uid-1")
        .build();

    reconciler.on_added(&ps).await.unwrap();

    assert_eq!(
        pod_defaults.keys(),
        vec!["lake-alice/gpu", "lake-bob/gpu", "lake/gpu"]
    );
    let team_default = pod_defaults.get("lake", "gpu").unwrap();
    assert_eq!(team_default.space(), Some(Space::Team));
    assert_eq!(team_default.spec.desc, "GPU notebooks");
    assert_eq!(team_default.owner_references()[0].uid, "ps-uid-1");
    let mirror = pod_defaults.get("lake-bob", "gpu").unwrap();
    assert_eq!(mirror.space(), Some(Space::User));
    assert!(mirror.owner_references().is_empty());
    assert_eq!(
        mirror.spec.selector.match_labels.as_ref().unwrap().keys().collect::<Vec<_>>(),
        vec!["orbit/gpu"]
    );

    reconciler.on_deleted(&ps).await.unwrap();
    assert!(pod_defaults.keys().is_empty());
}

#[tokio::test]
async fn test_disabled_pod_setting_is_not_propagated() {
    let pod_defaults = Arc::new(FakePodDefaults::default());
    let reconciler = PodSettingReconciler::new(lake_namespaces(), pod_defaults.clone());
    let ps = PodSettingBuilder::new("gpu", "lake").disable_watcher().build();

    reconciler.on_added(&ps).await.unwrap();
    reconciler.on_deleted(&ps).await.unwrap();

    assert!(pod_defaults.keys().is_empty());
}

#[tokio::test]
async fn test_pod_default_propagation_is_best_effort() {
    let pod_defaults = Arc::new(FakePodDefaults::default());
    pod_defaults.fail_in("lake-alice");
    let reconciler = PodDefaultReconciler::new(lake_namespaces(), pod_defaults.clone());
    let mut team_default = PodDefault::construct("gpu", "desc", Space::Team, "lake", None);
    team_default.metadata.namespace = Some("lake".to_string());

    reconciler.on_added(&team_default).await.unwrap();
    assert_eq!(pod_defaults.keys(), vec!["lake-bob/gpu"]);

    // Mirrors themselves are never re-propagated.
    let mirror = pod_defaults.get("lake-bob", "gpu").unwrap();
    reconciler.on_modified(&mirror).await.unwrap();
    assert_eq!(pod_defaults.keys(), vec!["lake-bob/gpu"]);

    reconciler.on_deleted(&team_default).await.unwrap();
    assert!(pod_defaults.keys().is_empty());
}

fn namespace_reconciler(
    helm: Arc<FakeHelm>,
    namespaces: Arc<FakeNamespaces>,
    pod_defaults: Arc<FakePodDefaults>,
) -> NamespaceReconciler {
    let (settings, _) = store_with(vec![
        PodSettingBuilder::new("gpu", "lake").build(),
        PodSettingBuilder::new("private", "lake").disable_watcher().build(),
    ]);
    NamespaceReconciler::new(
        namespaces,
        helm,
        PodSettingIndex::new(settings),
        pod_defaults,
        Duration::from_secs(60),
    )
}

#[tokio::test]
async fn test_user_namespace_lifecycle() {
    let helm = Arc::new(FakeHelm::with_charts(&["jupyter-user", "efs-pvc"]));
    let namespaces = Arc::new(FakeNamespaces::with_team("lake", "s3://bucket/helm/lake/user"));
    let pod_defaults = Arc::new(FakePodDefaults::default());
    let reconciler = namespace_reconciler(helm.clone(), namespaces, pod_defaults.clone());
    let ns = user_namespace("lake-bob", "lake", "bob");

    reconciler.on_added(&ns).await.unwrap();

    assert_eq!(
        *helm.repos.lock().unwrap(),
        vec![("lake--userspace".to_string(), "s3://bucket/helm/lake/user".to_string())]
    );
    assert_eq!(
        helm.release_names("lake"),
        vec!["lake-bob-jupyter-user", "lake-bob-efs-pvc"]
    );
    let install = helm.installs.lock().unwrap()[0].clone();
    assert_eq!(install.chart, "lake--userspace/jupyter-user");
    assert_eq!(install.values.get("user_email").map(String::as_str), Some("bob@example.com"));
    assert_eq!(install.values.get("user_efsapid").map(String::as_str), Some("fsap-bob"));
    assert_eq!(pod_defaults.keys(), vec!["lake-bob/gpu"]);

    // A second ADDED (watch replay) installs nothing new.
    reconciler.on_added(&ns).await.unwrap();
    assert_eq!(helm.installs.lock().unwrap().len(), 2);

    reconciler.on_deleted(&ns).await.unwrap();
    assert!(helm.release_names("lake").is_empty());
    assert_eq!(helm.uninstalls.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_chart_does_not_block_others() {
    let helm = Arc::new(FakeHelm::with_charts(&["broken", "jupyter-user"]));
    helm.failing_charts.lock().unwrap().push("broken".to_string());
    let reconciler = namespace_reconciler(
        helm.clone(),
        Arc::new(FakeNamespaces::with_team("lake", "s3://repo")),
        Arc::new(FakePodDefaults::default()),
    );

    reconciler
        .on_added(&user_namespace("lake-bob", "lake", "bob"))
        .await
        .unwrap();

    assert_eq!(helm.release_names("lake"), vec!["lake-bob-jupyter-user"]);
}

#[tokio::test]
async fn test_user_namespace_without_team_context_fails() {
    let helm = Arc::new(FakeHelm::with_charts(&["jupyter-user"]));
    let reconciler = namespace_reconciler(
        helm.clone(),
        Arc::new(FakeNamespaces::default()),
        Arc::new(FakePodDefaults::default()),
    );

    let result = reconciler.on_added(&user_namespace("lake-bob", "lake", "bob")).await;

    assert!(result.is_err());
    assert!(helm.installs.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_team_namespace_delete_cascades() {
    let namespaces = Arc::new(FakeNamespaces::default());
    let reconciler = namespace_reconciler(
        Arc::new(FakeHelm::default()),
        namespaces.clone(),
        Arc::new(FakePodDefaults::default()),
    );

    reconciler.on_deleted(&team_namespace("lake")).await.unwrap();

    assert_eq!(
        *namespaces.calls.lock().unwrap(),
        vec!["profiles:lake".to_string(), "namespaces:lake".to_string()]
    );
}

/// Applies status patches to an in-memory copy and records Event reasons.
#[derive(Default)]
struct InMemoryReplications {
    statuses: Mutex<Vec<ImageReplicationStatus>>,
    events: Mutex<Vec<String>>,
}

impl InMemoryReplications {
    fn history(&self) -> Vec<ReplicationStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.replication_status)
            .collect()
    }

    fn latest(&self, ir: &ImageReplication) -> ImageReplication {
        let mut updated = ir.clone();
        updated.status = self.statuses.lock().unwrap().last().cloned();
        updated
    }
}

#[async_trait]
impl ReplicationClient for InMemoryReplications {
    async fn patch_status(&self, _ir: &ImageReplication, status: &ImageReplicationStatus) -> Result<()> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }

    async fn publish(&self, _ir: &ImageReplication, _warning: bool, reason: &str, _note: String) {
        self.events.lock().unwrap().push(reason.to_string());
    }
}

fn replication_reconciler(
    client: Arc<InMemoryReplications>,
    build: Arc<FakeBuild>,
    existing: Vec<ImageReplication>,
) -> ImageReplicationReconciler {
    let (store, _) = store_with(existing);
    ImageReplicationReconciler::new(
        client,
        build,
        ReplicationIndex::new(store),
        Arc::new(ReplicationLedger::new()),
        ReplicationSettings {
            max_attempts: 2,
            retry_delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_replication_completes_after_polling() {
    let client = Arc::new(InMemoryReplications::default());
    let build = Arc::new(FakeBuild::with_states(vec![
        BuildState::InProgress,
        BuildState::InProgress,
        BuildState::Succeeded,
    ]));
    let reconciler = replication_reconciler(client.clone(), build.clone(), vec![]);
    let ir = image_replication("image-replication-x", "jupyter:1", None);

    reconciler.on_added(&ir).await.unwrap();

    assert_eq!(
        client.history(),
        vec![ReplicationStatus::Replicating, ReplicationStatus::Complete]
    );
    assert_eq!(
        *build.started.lock().unwrap(),
        vec![("jupyter:1".to_string(), internal("jupyter:1"))]
    );
    assert_eq!(*client.events.lock().unwrap(), vec!["ReplicationStarted", "Complete"]);

    // Terminal objects are left alone.
    reconciler.on_modified(&client.latest(&ir)).await.unwrap();
    assert_eq!(client.history().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_existing_destination_skips_build() {
    let client = Arc::new(InMemoryReplications::default());
    let build = Arc::new(FakeBuild::default());
    build.existing.lock().unwrap().push(internal("jupyter:1"));
    let reconciler = replication_reconciler(client.clone(), build.clone(), vec![]);

    reconciler
        .on_added(&image_replication("image-replication-x", "jupyter:1", None))
        .await
        .unwrap();

    assert_eq!(client.history(), vec![ReplicationStatus::AlreadyReplicated]);
    assert!(build.started.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failures_retry_until_attempts_exhausted() {
    let client = Arc::new(InMemoryReplications::default());
    let build = Arc::new(FakeBuild::with_states(vec![
        BuildState::Failed("FAILED".to_string()),
        BuildState::Failed("FAILED".to_string()),
    ]));
    let reconciler = replication_reconciler(client.clone(), build.clone(), vec![]);
    let ir = image_replication("image-replication-x", "jupyter:1", None);

    reconciler.on_added(&ir).await.unwrap();
    assert_eq!(
        client.history(),
        vec![ReplicationStatus::Replicating, ReplicationStatus::Failed]
    );
    assert_eq!(client.statuses.lock().unwrap()[1].attempts, 1);

    // The retry timer returns the object to Pending.
    tokio::time::sleep(Duration::from_secs(31)).await;
    let pending = client.latest(&ir);
    assert_eq!(pending.replication_status(), ReplicationStatus::Pending);

    reconciler.on_modified(&pending).await.unwrap();
    let last = client.latest(&ir);
    assert_eq!(last.replication_status(), ReplicationStatus::MaxAttemptsExceeded);
    assert_eq!(last.attempts(), 2);
    assert_eq!(build.started.lock().unwrap().len(), 2);
    assert!(client.events.lock().unwrap().contains(&"ReplicationFailed".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_destination_short_circuits_new_objects() {
    let client = Arc::new(InMemoryReplications::default());
    let build = Arc::new(FakeBuild::default());
    let exhausted = image_replication(
        "image-replication-old",
        "jupyter:1",
        Some(ReplicationStatus::MaxAttemptsExceeded),
    );
    let reconciler = replication_reconciler(client.clone(), build.clone(), vec![exhausted]);

    reconciler
        .on_added(&image_replication("image-replication-new", "jupyter:1", None))
        .await
        .unwrap();

    assert_eq!(client.history(), vec![ReplicationStatus::MaxAttemptsExceeded]);
    assert!(build.started.lock().unwrap().is_empty());
}

#[test]
fn test_namespace_labels_identify_spaces() {
    let ns = user_namespace("lake-bob", "lake", "bob");
    assert_eq!(Space::from_labels(ns.labels()), Some(Space::User));
    assert_eq!(ns.labels().get(labels::TEAM).map(String::as_str), Some("lake"));
}
