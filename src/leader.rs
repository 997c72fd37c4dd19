//! Lease-based leader election for the watch modules.
//!
//! Only one replica of a watch module processes events. The holder renews
//! `spec.renewTime` every renew interval; another replica takes over once
//! the lease has not been renewed for `leaseDurationSeconds`.

use std::time::Duration;

use jiff::Timestamp;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Client;
use kube::api::{Api, Patch, PatchParams};
use tracing::{debug, info, warn};

use crate::controller::{FIELD_MANAGER, Result};

/// Lease duration.
pub const LEASE_TTL: Duration = Duration::from_secs(15);
/// How often the holder renews, and how often candidates retry.
pub const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Expired when not renewed within its duration. No spec means expired.
pub fn is_lease_expired(lease: &Lease, now: Timestamp) -> bool {
    if let Some(spec) = &lease.spec
        && let (Some(renew_time), Some(duration)) = (&spec.renew_time, spec.lease_duration_seconds)
    {
        let elapsed_secs = now.as_second() - renew_time.0.as_second();
        return elapsed_secs > i64::from(duration);
    }
    true
}

/// Current holder identity.
pub fn lease_holder(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref())
}

/// Leader election over a single Lease.
pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    holder: String,
    ttl: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: impl Into<String>, holder: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.into(),
            holder: holder.into(),
            ttl: LEASE_TTL,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Acquire the lease or renew it if already held.
    ///
    /// Returns `false` while another live holder owns it.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Timestamp::now();
        let existing = self.api.get_opt(&self.lease_name).await?;

        let (acquire_time, transitions) = match existing {
            Some(ref lease) => {
                let current = lease_holder(lease);
                let spec = lease.spec.as_ref();
                if current == Some(self.holder.as_str()) {
                    (
                        spec.and_then(|s| s.acquire_time.clone()),
                        spec.and_then(|s| s.lease_transitions),
                    )
                } else if !is_lease_expired(lease, now) {
                    debug!(lease = %self.lease_name, holder = ?current, "Lease held by another instance");
                    return Ok(false);
                } else {
                    info!(lease = %self.lease_name, previous = ?current, "Taking over expired lease");
                    (
                        Some(MicroTime(now)),
                        Some(spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1),
                    )
                }
            }
            None => (Some(MicroTime(now)), Some(0)),
        };

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder.clone()),
                lease_duration_seconds: Some(self.ttl.as_secs() as i32),
                acquire_time,
                renew_time: Some(MicroTime(now)),
                lease_transitions: transitions,
                ..Default::default()
            }),
        };
        self.api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&lease),
            )
            .await?;
        Ok(true)
    }

    /// Block until the lease is acquired. API errors are retried.
    pub async fn acquire(&self) {
        info!(lease = %self.lease_name, holder = %self.holder, "Waiting to acquire leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(lease = %self.lease_name, holder = %self.holder, "Acquired leadership");
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(lease = %self.lease_name, error = %e, "Failed to acquire lease, retrying"),
            }
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
        }
    }

    /// Renew until leadership is lost; returns the reason.
    pub async fn hold(&self) -> String {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => debug!(lease = %self.lease_name, "Lease renewed"),
                Ok(false) => return "lease taken by another instance".to_string(),
                Err(e) => return format!("failed to renew lease: {e}"),
            }
        }
    }
}
