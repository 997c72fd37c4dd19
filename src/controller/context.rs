//! Shared context for the reconcilers.
//!
//! Holds the Kubernetes client, the event reporter identity and the optional
//! health state used for metrics.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::health::HealthState;

/// Field manager name for server-side apply and Event reporting
pub const FIELD_MANAGER: &str = "orbit-controller";

/// Shared context for the reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context. `instance` identifies this replica in Events.
    pub fn new(client: Client, instance: Option<String>, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance,
            },
            health_state,
        }
    }

    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a Kubernetes Event about `resource`. Failures are logged only.
    pub async fn publish_event<K>(
        &self,
        resource: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let object_ref = resource.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Count a replication status transition.
    pub fn record_replication(&self, status: &str) {
        if let Some(ref health) = self.health_state {
            health.metrics.record_replication(status);
        }
    }
}
