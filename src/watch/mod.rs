//! Watch / queue / worker reconciliation framework.
//!
//! A watch module is one resource kind processed by:
//! - one watcher task feeding an unbounded FIFO ([`queue`])
//! - `workers` tasks draining it through a [`Reconciler`]
//! - one updater task persisting the last resourceVersion ([`state`])
//!
//! The module runs until the watcher hits a fatal error; the workers and
//! updater are then aborted and the error is returned to the caller.

pub mod client;
pub mod queue;
pub mod state;
pub mod worker;

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::Resource;
use kube::api::WatchParams;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub use client::{WatchError, WatchSource, resumable_watch};
pub use queue::{EventType, QueueEvent, event_queue};
pub use state::{
    ConfigMapStateBackend, ModuleState, ResourceVersion, StateBackend, WatchState,
    load_module_state, maintain_module_state,
};
pub use worker::{Reconciler, WorkerSettings, run_worker};

use crate::health::HealthState;

/// Settings for one watch module.
#[derive(Clone, Debug)]
pub struct ModuleConfig {
    /// Key used for persisted state and in logs/metrics.
    pub name: String,
    pub workers: usize,
    /// Sleep after each processed event.
    pub worker_pause: Duration,
    /// Sleep before retrying a transient watch failure.
    pub retry_delay: Duration,
    /// How often the updater persists state.
    pub state_interval: Duration,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers: workers.max(1),
            worker_pause: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            state_interval: Duration::from_secs(5),
        }
    }
}

/// A fully wired watch module.
pub struct WatchModule<K: Send + Sync> {
    pub config: ModuleConfig,
    pub source: Arc<dyn WatchSource<K>>,
    pub params: WatchParams,
    pub reconciler: Arc<dyn Reconciler<K>>,
    pub backend: Arc<dyn StateBackend>,
    pub health_state: Option<Arc<HealthState>>,
}

impl<K> WatchModule<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Run until the watcher fails fatally.
    pub async fn run(self) -> Result<(), WatchError> {
        let name = self.config.name.clone();
        let initial = load_module_state(self.backend.as_ref(), &name).await;
        let state: ModuleState = Arc::new(RwLock::new(initial.clone()));
        let (tx, rx) = event_queue::<K>();

        let mut tasks = JoinSet::new();
        tasks.spawn(maintain_module_state(
            name.clone(),
            state.clone(),
            self.backend.clone(),
            self.config.state_interval,
            initial,
        ));

        let settings = WorkerSettings {
            module: name.clone(),
            pause: self.config.worker_pause,
            health_state: self.health_state.clone(),
        };
        for id in 0..self.config.workers {
            tasks.spawn(run_worker(
                id,
                rx.clone(),
                self.reconciler.clone(),
                settings.clone(),
            ));
        }
        drop(rx);

        info!(module = %name, workers = self.config.workers, "Watch module started");

        let mut events = pin!(resumable_watch(
            name.clone(),
            self.source,
            self.params,
            state,
            self.config.retry_delay,
        ));

        let result = loop {
            match events.next().await {
                Some(Ok(event)) => {
                    if tx.send(event).await.is_err() {
                        warn!(module = %name, "All workers exited, stopping watcher");
                        break Ok(());
                    }
                }
                Some(Err(e)) => {
                    error!(module = %name, error = %e, "Watcher failed");
                    break Err(e);
                }
                None => break Ok(()),
            }
        };

        tasks.abort_all();
        info!(module = %name, "Watch module stopped");
        result
    }
}
