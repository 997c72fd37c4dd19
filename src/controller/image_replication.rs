//! ImageReplication controller.
//!
//! Drives each replication through
//! `Pending -> Replicating -> Complete | Failed | MaxAttemptsExceeded`,
//! or straight to `AlreadyReplicated` when the destination already exists.
//! A failed attempt below the ceiling returns to `Pending` after a delay.
//! At most one build runs per destination at a time, enforced by the
//! [`ReplicationLedger`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::ledger::{Claim, ReplicationLedger};
use crate::controller::error::{Error, Result};
use crate::crd::{ImageReplication, ImageReplicationStatus, ReplicationStatus};
use crate::external::{BuildService, BuildState};
use crate::index::ReplicationIndex;
use crate::watch::Reconciler;

/// Consecutive status lookups that may fail before the build counts as failed.
const MAX_POLL_ERRORS: u32 = 3;

/// Status writes and Events for ImageReplications.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    async fn patch_status(&self, ir: &ImageReplication, status: &ImageReplicationStatus) -> Result<()>;

    /// Publish an Event. Failures are logged, never returned.
    async fn publish(&self, ir: &ImageReplication, warning: bool, reason: &str, note: String);
}

/// [`ReplicationClient`] backed by the Kubernetes API.
pub struct KubeReplications {
    ctx: Context,
}

impl KubeReplications {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ReplicationClient for KubeReplications {
    async fn patch_status(&self, ir: &ImageReplication, status: &ImageReplicationStatus) -> Result<()> {
        let namespace = ir
            .namespace()
            .ok_or_else(|| Error::MissingField("ImageReplication namespace".into()))?;
        let api: Api<ImageReplication> = Api::namespaced(self.ctx.client.clone(), &namespace);
        let patch = json!({ "status": status });
        api.patch_status(&ir.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        self.ctx
            .record_replication(&status.replication_status.to_string());
        debug!(
            namespace = %namespace,
            name = %ir.name_any(),
            status = %status.replication_status,
            "Patched ImageReplication status"
        );
        Ok(())
    }

    async fn publish(&self, ir: &ImageReplication, warning: bool, reason: &str, note: String) {
        let type_ = if warning {
            EventType::Warning
        } else {
            EventType::Normal
        };
        self.ctx
            .publish_event(ir, type_, reason, "Replicate", Some(note))
            .await;
    }
}

#[derive(Clone, Debug)]
pub struct ReplicationSettings {
    pub max_attempts: u32,
    /// Delay before a `Failed` replication returns to `Pending`.
    pub retry_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// How a build attempt ended.
enum Outcome {
    Succeeded,
    Failed(String),
}

pub struct ImageReplicationReconciler {
    client: Arc<dyn ReplicationClient>,
    build: Arc<dyn BuildService>,
    index: ReplicationIndex,
    ledger: Arc<ReplicationLedger>,
    settings: ReplicationSettings,
}

fn key(ir: &ImageReplication) -> String {
    format!("{}/{}", ir.namespace().unwrap_or_default(), ir.name_any())
}

fn status(
    replication_status: ReplicationStatus,
    build_id: Option<String>,
    attempts: u32,
    message: impl Into<String>,
) -> ImageReplicationStatus {
    ImageReplicationStatus {
        replication_status,
        build_id,
        attempts,
        message: Some(message.into()),
    }
}

impl ImageReplicationReconciler {
    pub fn new(
        client: Arc<dyn ReplicationClient>,
        build: Arc<dyn BuildService>,
        index: ReplicationIndex,
        ledger: Arc<ReplicationLedger>,
        settings: ReplicationSettings,
    ) -> Self {
        Self {
            client,
            build,
            index,
            ledger,
            settings,
        }
    }

    async fn reconcile(&self, ir: &ImageReplication, observed_fresh: bool) -> Result<()> {
        let current = ir.replication_status();
        match current {
            s if s.is_terminal() => {
                debug!(name = %ir.name_any(), status = %s, "Replication already terminal");
                Ok(())
            }
            ReplicationStatus::Pending => self.replicate(ir).await,
            // A Failed object seen on (re)list lost its retry timer.
            ReplicationStatus::Failed if observed_fresh => {
                self.schedule_retry(ir.clone());
                Ok(())
            }
            // A build that was running when the previous controller stopped.
            ReplicationStatus::Replicating if observed_fresh => self.resume(ir).await,
            _ => Ok(()),
        }
    }

    /// Start a build for a Pending replication.
    async fn replicate(&self, ir: &ImageReplication) -> Result<()> {
        let destination = &ir.spec.destination;
        let holder = key(ir);

        if self.index.is_exhausted(destination)
            || self.ledger.attempts(destination) >= self.settings.max_attempts
        {
            return self
                .finish(
                    ir,
                    status(
                        ReplicationStatus::MaxAttemptsExceeded,
                        None,
                        ir.attempts(),
                        "destination exhausted its replication attempts",
                    ),
                )
                .await;
        }

        if let Claim::Busy { holder: current } = self.ledger.claim(destination, &holder) {
            info!(name = %ir.name_any(), destination = %destination, holder = %current, "Replication already in progress");
            self.client
                .patch_status(
                    ir,
                    &status(
                        ReplicationStatus::Failed,
                        None,
                        ir.attempts(),
                        format!("replication already in progress by {current}"),
                    ),
                )
                .await?;
            self.schedule_retry(ir.clone());
            return Ok(());
        }

        let result = self.build_and_wait(ir).await;
        self.ledger.release(destination, &holder);
        result
    }

    async fn build_and_wait(&self, ir: &ImageReplication) -> Result<()> {
        let source = &ir.spec.source;
        let destination = &ir.spec.destination;

        match self.build.image_exists(destination).await {
            Ok(true) => {
                return self
                    .finish(
                        ir,
                        status(
                            ReplicationStatus::AlreadyReplicated,
                            None,
                            ir.attempts(),
                            "destination image already exists",
                        ),
                    )
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(destination = %destination, error = %e, "Could not check destination, building anyway");
            }
        }

        let build_id = match self.build.start_build(source, destination).await {
            Ok(id) => id,
            Err(e) => return self.fail(ir, None, e.to_string()).await,
        };
        self.client
            .patch_status(
                ir,
                &status(
                    ReplicationStatus::Replicating,
                    Some(build_id.clone()),
                    ir.attempts(),
                    format!("replicating {source}"),
                ),
            )
            .await?;
        self.client
            .publish(ir, false, "ReplicationStarted", format!("Build {build_id} started"))
            .await;

        self.await_build(ir, build_id).await
    }

    async fn resume(&self, ir: &ImageReplication) -> Result<()> {
        let Some(build_id) = ir.status.as_ref().and_then(|s| s.build_id.clone()) else {
            return self.fail(ir, None, "build id lost".into()).await;
        };
        let holder = key(ir);
        if let Claim::Busy { .. } = self.ledger.claim(&ir.spec.destination, &holder) {
            return Ok(());
        }
        info!(name = %ir.name_any(), build_id = %build_id, "Resuming build poll");
        let result = self.await_build(ir, build_id).await;
        self.ledger.release(&ir.spec.destination, &holder);
        result
    }

    async fn await_build(&self, ir: &ImageReplication, build_id: String) -> Result<()> {
        match self.poll(&build_id).await {
            Outcome::Succeeded => {
                self.finish(
                    ir,
                    status(
                        ReplicationStatus::Complete,
                        Some(build_id),
                        ir.attempts(),
                        "replication complete",
                    ),
                )
                .await
            }
            Outcome::Failed(reason) => self.fail(ir, Some(build_id), reason).await,
        }
    }

    async fn poll(&self, build_id: &str) -> Outcome {
        let mut errors = 0;
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            match self.build.build_status(build_id).await {
                Ok(BuildState::InProgress) => {
                    errors = 0;
                    debug!(build_id = %build_id, "Build in progress");
                }
                Ok(BuildState::Succeeded) => return Outcome::Succeeded,
                Ok(BuildState::Failed(s)) => return Outcome::Failed(format!("build {build_id} {s}")),
                Err(e) => {
                    errors += 1;
                    warn!(build_id = %build_id, error = %e, errors, "Failed to read build status");
                    if errors >= MAX_POLL_ERRORS {
                        return Outcome::Failed(e.to_string());
                    }
                }
            }
        }
    }

    /// Record a failed attempt, then either retry later or give up.
    async fn fail(&self, ir: &ImageReplication, build_id: Option<String>, reason: String) -> Result<()> {
        let attempts = self
            .ledger
            .record_failure(&ir.spec.destination, ir.attempts());
        if attempts >= self.settings.max_attempts {
            error!(name = %ir.name_any(), attempts, reason = %reason, "Replication attempts exhausted");
            return self
                .finish(
                    ir,
                    status(ReplicationStatus::MaxAttemptsExceeded, build_id, attempts, reason),
                )
                .await;
        }

        warn!(name = %ir.name_any(), attempts, reason = %reason, "Replication attempt failed");
        self.client
            .patch_status(
                ir,
                &status(ReplicationStatus::Failed, build_id, attempts, reason.clone()),
            )
            .await?;
        self.client
            .publish(ir, true, "ReplicationFailed", reason)
            .await;

        let mut retry = ir.clone();
        retry.status = Some(status(ReplicationStatus::Failed, None, attempts, ""));
        self.schedule_retry(retry);
        Ok(())
    }

    /// Write a terminal status and announce it.
    async fn finish(&self, ir: &ImageReplication, terminal: ImageReplicationStatus) -> Result<()> {
        let reason = terminal.replication_status.to_string();
        let note = terminal.message.clone().unwrap_or_default();
        let warning = terminal.replication_status == ReplicationStatus::MaxAttemptsExceeded;
        self.client.patch_status(ir, &terminal).await?;
        self.client.publish(ir, warning, &reason, note).await;
        info!(name = %ir.name_any(), status = %reason, "Replication finished");
        Ok(())
    }

    /// Return `ir` to `Pending` after the retry delay.
    fn schedule_retry(&self, ir: ImageReplication) {
        let client = self.client.clone();
        let delay = self.settings.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let pending = status(
                ReplicationStatus::Pending,
                None,
                ir.attempts(),
                "retrying replication",
            );
            if let Err(e) = client.patch_status(&ir, &pending).await {
                warn!(name = %ir.name_any(), error = %e, "Failed to requeue replication");
            }
        });
    }
}

#[async_trait]
impl Reconciler<ImageReplication> for ImageReplicationReconciler {
    async fn on_added(&self, obj: &ImageReplication) -> Result<()> {
        self.reconcile(obj, true).await
    }

    async fn on_modified(&self, obj: &ImageReplication) -> Result<()> {
        self.reconcile(obj, false).await
    }
}
