//! Per-module watch state and its persistence.
//!
//! Each watch module records the last resourceVersion it processed. The
//! watcher task is the single writer; a separate updater task copies the
//! value into a shared ConfigMap on a fixed interval, so persistence trails
//! event processing and is never transactional with it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};

/// A watch resumption cursor.
///
/// `"0"` is the resync sentinel: watching from it makes the API server replay
/// every current object as an ADDED event before streaming changes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub const RESYNC: &'static str = "0";

    pub fn new(version: impl Into<String>) -> Self {
        let version = version.into();
        if version.is_empty() {
            Self::resync()
        } else {
            Self(version)
        }
    }

    pub fn resync() -> Self {
        Self(Self::RESYNC.to_string())
    }

    pub fn is_resync(&self) -> bool {
        self.0 == Self::RESYNC
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ResourceVersion {
    fn default() -> Self {
        Self::resync()
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Older state objects stored integers, with -1 as the reset marker.
impl<'de> Deserialize<'de> for ResourceVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) if s.starts_with('-') => Self::resync(),
            Raw::Text(s) => Self::new(s),
            Raw::Number(n) if n <= 0 => Self::resync(),
            Raw::Number(n) => Self(n.to_string()),
        })
    }
}

/// Persisted state for one watch module.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchState {
    #[serde(default)]
    pub last_resource_version: ResourceVersion,
}

/// Live state shared between a watcher (writer) and the updater (reader).
pub type ModuleState = Arc<RwLock<WatchState>>;

/// Storage for module watch state.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read the persisted state for `module`, if any.
    async fn load(&self, module: &str) -> Result<Option<WatchState>>;

    /// Persist `state` for `module`.
    async fn save(&self, module: &str, state: &WatchState) -> Result<()>;
}

/// Stores every module's state as one JSON value per key in a ConfigMap.
///
/// When the ConfigMap cannot be read, falls back to `{state_path}/{module}`,
/// which is where the same ConfigMap is mounted into the pod.
pub struct ConfigMapStateBackend {
    api: Api<ConfigMap>,
    name: String,
    state_path: PathBuf,
}

impl ConfigMapStateBackend {
    pub fn new(api: Api<ConfigMap>, name: impl Into<String>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            api,
            name: name.into(),
            state_path: state_path.into(),
        }
    }

    async fn load_from_file(&self, module: &str) -> Result<Option<WatchState>> {
        let path = self.state_path.join(module);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(None),
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateBackend for ConfigMapStateBackend {
    async fn load(&self, module: &str) -> Result<Option<WatchState>> {
        match self.api.get_opt(&self.name).await {
            Ok(Some(cm)) => {
                let value = cm.data.as_ref().and_then(|d| d.get(module));
                match value {
                    Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
                    None => Ok(None),
                }
            }
            Ok(None) => self.load_from_file(module).await,
            Err(e) => {
                warn!(module = %module, error = %e, "Failed to read state ConfigMap, trying state file");
                self.load_from_file(module).await
            }
        }
    }

    async fn save(&self, module: &str, state: &WatchState) -> Result<()> {
        let value = serde_json::to_string(state)?;
        let patch = serde_json::json!({ "data": BTreeMap::from([(module, value.as_str())]) });

        match self
            .api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(module.to_string(), value)])),
                    ..Default::default()
                };
                match self.api.create(&PostParams::default(), &cm).await {
                    Ok(_) => Ok(()),
                    // Another module created it first
                    Err(kube::Error::Api(e)) if e.code == 409 => self
                        .api
                        .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                        .map(|_| ())
                        .map_err(Error::from),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Load the starting state for a module, defaulting to a full resync.
pub async fn load_module_state(backend: &dyn StateBackend, module: &str) -> WatchState {
    match backend.load(module).await {
        Ok(Some(state)) => {
            info!(module = %module, resource_version = %state.last_resource_version, "Loaded watch state");
            state
        }
        Ok(None) => {
            info!(module = %module, "No persisted watch state, starting with a full resync");
            WatchState::default()
        }
        Err(e) => {
            warn!(module = %module, error = %e, "Failed to load watch state, starting with a full resync");
            WatchState::default()
        }
    }
}

/// Persist `state` whenever it differs from the last persisted value.
///
/// Runs forever. A failed save is retried on the next tick.
pub async fn maintain_module_state(
    module: String,
    state: ModuleState,
    backend: Arc<dyn StateBackend>,
    interval: Duration,
    initial: WatchState,
) {
    let mut persisted = initial;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let snapshot = state.read().await.clone();
        if snapshot == persisted {
            continue;
        }
        match backend.save(&module, &snapshot).await {
            Ok(()) => {
                debug!(
                    module = %module,
                    resource_version = %snapshot.last_resource_version,
                    "Persisted watch state"
                );
                persisted = snapshot;
            }
            Err(e) => {
                warn!(module = %module, error = %e, "Failed to persist watch state");
            }
        }
    }
}
