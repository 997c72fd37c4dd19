//! Worker pool draining a module's event queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info};

use super::queue::{EventReceiver, EventType, QueueEvent};
use crate::controller::error::Result;
use crate::health::HealthState;

/// Per-kind reconciliation logic invoked by workers.
#[async_trait]
pub trait Reconciler<K: Send + Sync>: Send + Sync {
    async fn on_added(&self, obj: &K) -> Result<()>;

    async fn on_modified(&self, obj: &K) -> Result<()>;

    async fn on_deleted(&self, _obj: &K) -> Result<()> {
        Ok(())
    }
}

/// Route an event to the matching reconciler hook.
pub async fn dispatch<K: Send + Sync>(
    reconciler: &dyn Reconciler<K>,
    event: &QueueEvent<K>,
) -> Result<()> {
    match event.event_type {
        EventType::Added => reconciler.on_added(&event.object).await,
        EventType::Modified => reconciler.on_modified(&event.object).await,
        EventType::Deleted => reconciler.on_deleted(&event.object).await,
    }
}

/// Static settings shared by every worker of a module.
#[derive(Clone)]
pub struct WorkerSettings {
    pub module: String,
    /// Sleep after each event.
    pub pause: Duration,
    pub health_state: Option<Arc<HealthState>>,
}

/// Drain `queue` forever. Reconciler errors and panics are logged and
/// swallowed; the loop only ends once every sender is gone.
pub async fn run_worker<K>(
    id: usize,
    queue: EventReceiver<K>,
    reconciler: Arc<dyn Reconciler<K>>,
    settings: WorkerSettings,
) where
    K: Resource + Clone + Send + Sync + 'static,
{
    info!(module = %settings.module, worker = id, "Started worker");

    while let Ok(event) = queue.recv().await {
        let name = event.object.name_any();
        let namespace = event.object.namespace().unwrap_or_default();
        debug!(
            module = %settings.module,
            worker = id,
            event_type = %event.event_type,
            namespace = %namespace,
            name = %name,
            "Processing event"
        );

        let start = Instant::now();
        let outcome = AssertUnwindSafe(dispatch(reconciler.as_ref(), &event))
            .catch_unwind()
            .await;
        let elapsed = start.elapsed().as_secs_f64();

        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(
                    module = %settings.module,
                    worker = id,
                    event_type = %event.event_type,
                    namespace = %namespace,
                    name = %name,
                    error = %e,
                    "Failed to process event"
                );
                true
            }
            Err(_) => {
                error!(
                    module = %settings.module,
                    worker = id,
                    event_type = %event.event_type,
                    namespace = %namespace,
                    name = %name,
                    "Reconciler panicked while processing event"
                );
                true
            }
        };

        if let Some(ref health) = settings.health_state {
            health
                .metrics
                .record_event(&settings.module, event.event_type.as_str(), elapsed);
            health
                .metrics
                .set_queue_depth(&settings.module, queue.len() as i64);
            if failed {
                health.metrics.record_error(&settings.module);
            }
            health.touch();
        }

        tokio::time::sleep(settings.pause).await;
    }

    info!(module = %settings.module, worker = id, "Event queue closed, worker exiting");
}
