//! Watch module tests: resume, resync and state persistence.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{WatchEvent, WatchParams};
use orbit_controller::controller::{PodSettingReconciler, Result};
use orbit_controller::crd::PodSetting;
use orbit_controller::index::NamespaceIndex;
use orbit_controller::watch::client::EventStream;
use orbit_controller::watch::{
    ModuleConfig, ResourceVersion, StateBackend, WatchError, WatchModule, WatchSource, WatchState,
};

use crate::common::fixtures::*;

type Opening = kube::Result<Vec<kube::Result<WatchEvent<PodSetting>>>>;

/// Replays scripted watch openings; an exhausted script idles forever.
#[derive(Default)]
struct ScriptedPodSettings {
    openings: Mutex<VecDeque<Opening>>,
    requested: Mutex<Vec<String>>,
}

impl ScriptedPodSettings {
    fn new(openings: Vec<Opening>) -> Self {
        Self {
            openings: Mutex::new(openings.into()),
            requested: Mutex::default(),
        }
    }
}

#[async_trait]
impl WatchSource<PodSetting> for ScriptedPodSettings {
    async fn open(&self, _params: &WatchParams, version: &str) -> kube::Result<EventStream<PodSetting>> {
        self.requested.lock().unwrap().push(version.to_string());
        match self.openings.lock().unwrap().pop_front() {
            Some(Ok(events)) => Ok(futures::stream::iter(events).boxed()),
            Some(Err(e)) => Err(e),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

#[derive(Default)]
struct MemoryBackend {
    values: Mutex<HashMap<String, WatchState>>,
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn load(&self, module: &str) -> Result<Option<WatchState>> {
        Ok(self.values.lock().unwrap().get(module).cloned())
    }

    async fn save(&self, module: &str, state: &WatchState) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(module.to_string(), state.clone());
        Ok(())
    }
}

fn versioned(name: &str, version: &str) -> PodSetting {
    let mut ps = PodSettingBuilder::new(name, "lake")
        .match_label("tier", "gpu")
        .build();
    ps.metadata.resource_version = Some(version.to_string());
    ps
}

fn status_error(code: u16, reason: &str) -> kube::Result<WatchEvent<PodSetting>> {
    Ok(serde_json::from_value(serde_json::json!({
        "type": "ERROR",
        "object": {
            "apiVersion": "v1",
            "kind": "Status",
            "status": "Failure",
            "message": format!("{reason} ({code})"),
            "reason": reason,
            "code": code
        }
    }))
    .unwrap())
}

fn fatal(code: u16) -> kube::Error {
    kube::Error::Api(
        serde_json::from_value(serde_json::json!({
            "status": "Failure",
            "message": "denied",
            "reason": "Forbidden",
            "code": code
        }))
        .unwrap(),
    )
}

fn module(
    source: Arc<ScriptedPodSettings>,
    backend: Arc<MemoryBackend>,
    pod_defaults: Arc<FakePodDefaults>,
) -> WatchModule<PodSetting> {
    let (store, _writer) = store_with(vec![
        team_namespace("lake"),
        user_namespace("lake-alice", "lake", "alice"),
    ]);
    let mut config = ModuleConfig::new("podsettingsWatcher", 2);
    config.worker_pause = Duration::from_millis(0);
    config.retry_delay = Duration::from_millis(0);
    config.state_interval = Duration::from_millis(5);
    WatchModule {
        config,
        source,
        params: WatchParams::default(),
        reconciler: Arc::new(PodSettingReconciler::new(NamespaceIndex::new(store), pod_defaults)),
        backend,
        health_state: None,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_events_reach_reconciler_and_version_is_persisted() {
    let source = Arc::new(ScriptedPodSettings::new(vec![Ok(vec![
        Ok(WatchEvent::Added(versioned("gpu", "11"))),
        Ok(WatchEvent::Added(versioned("cpu", "12"))),
    ])]));
    let backend = Arc::new(MemoryBackend::default());
    let pod_defaults = Arc::new(FakePodDefaults::default());

    let task = tokio::spawn(module(source.clone(), backend.clone(), pod_defaults.clone()).run());

    eventually(|| pod_defaults.keys().len() == 4).await;
    assert_eq!(
        pod_defaults.keys(),
        vec!["lake-alice/cpu", "lake-alice/gpu", "lake/cpu", "lake/gpu"]
    );
    eventually(|| {
        backend
            .values
            .lock()
            .unwrap()
            .get("podsettingsWatcher")
            .map(|s| s.last_resource_version.as_str() == "12")
            .unwrap_or(false)
    })
    .await;
    task.abort();

    // No persisted state means a full resync.
    assert_eq!(source.requested.lock().unwrap()[0], ResourceVersion::RESYNC);
}

#[tokio::test]
async fn test_resumes_from_persisted_version_and_resyncs_on_gone() {
    let source = Arc::new(ScriptedPodSettings::new(vec![
        Ok(vec![
            Ok(WatchEvent::Modified(versioned("gpu", "21"))),
            status_error(410, "Expired"),
        ]),
        Ok(vec![Ok(WatchEvent::Added(versioned("gpu", "30")))]),
        Err(fatal(403)),
    ]));
    let backend = Arc::new(MemoryBackend::default());
    backend.values.lock().unwrap().insert(
        "podsettingsWatcher".to_string(),
        WatchState {
            last_resource_version: ResourceVersion::new("20"),
        },
    );

    let result = module(source.clone(), backend, Arc::new(FakePodDefaults::default()))
        .run()
        .await;

    assert!(matches!(result, Err(WatchError::Api(_))));
    assert_eq!(
        *source.requested.lock().unwrap(),
        vec!["20".to_string(), "0".to_string(), "30".to_string()]
    );
}

#[tokio::test]
async fn test_transient_errors_retry_from_same_version() {
    let source = Arc::new(ScriptedPodSettings::new(vec![
        Ok(vec![
            Ok(WatchEvent::Added(versioned("gpu", "5"))),
            status_error(500, "InternalError"),
        ]),
        Err(fatal(503)),
        Err(fatal(401)),
    ]));

    let result = module(
        source.clone(),
        Arc::new(MemoryBackend::default()),
        Arc::new(FakePodDefaults::default()),
    )
    .run()
    .await;

    assert!(matches!(result, Err(WatchError::Api(_))));
    assert_eq!(
        *source.requested.lock().unwrap(),
        vec!["0".to_string(), "5".to_string(), "5".to_string()]
    );
}
