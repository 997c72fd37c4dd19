//! ImageReplication Custom Resource Definition.
//!
//! Created by the image-replication admission webhook, one per distinct
//! destination image, and driven to a terminal status by the controller.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Request to copy `source` into the internal registry as `destination`.
///
/// Example:
/// ```yaml
/// apiVersion: orbit.aws/v1
/// kind: ImageReplication
/// metadata:
///   generateName: image-replication-
///   namespace: orbit-system
/// spec:
///   source: docker.io/library/python:3.9
///   destination: 123456789012.dkr.ecr.us-west-2.amazonaws.com/orbit/docker.io/library/python:3.9
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "orbit.aws",
    version = "v1",
    kind = "ImageReplication",
    plural = "imagereplications",
    shortname = "imgrep",
    status = "ImageReplicationStatus",
    namespaced,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.replicationStatus"}"#,
    printcolumn = r#"{"name":"Attempts", "type":"integer", "jsonPath":".status.attempts"}"#,
    printcolumn = r#"{"name":"Destination", "type":"string", "jsonPath":".spec.destination"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageReplicationSpec {
    pub source: String,
    pub destination: String,
}

/// Observed state of an ImageReplication.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageReplicationStatus {
    #[serde(default)]
    pub replication_status: ReplicationStatus,
    /// Identifier of the most recent build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    /// Failed build attempts so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Replication lifecycle.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ReplicationStatus {
    /// Waiting for the controller.
    #[default]
    Pending,
    /// A build is running.
    Replicating,
    /// The build pushed the destination image.
    Complete,
    /// The destination already existed; no build was needed.
    AlreadyReplicated,
    /// The last attempt failed; returns to `Pending` after the retry delay.
    Failed,
    /// The attempt ceiling was reached. Never retried.
    MaxAttemptsExceeded,
}

impl std::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationStatus::Pending => write!(f, "Pending"),
            ReplicationStatus::Replicating => write!(f, "Replicating"),
            ReplicationStatus::Complete => write!(f, "Complete"),
            ReplicationStatus::AlreadyReplicated => write!(f, "AlreadyReplicated"),
            ReplicationStatus::Failed => write!(f, "Failed"),
            ReplicationStatus::MaxAttemptsExceeded => write!(f, "MaxAttemptsExceeded"),
        }
    }
}

impl ReplicationStatus {
    /// No further controller action will be taken.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplicationStatus::Complete
                | ReplicationStatus::AlreadyReplicated
                | ReplicationStatus::MaxAttemptsExceeded
        )
    }

    /// Counts toward the one-live-replication-per-destination rule.
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            ReplicationStatus::Failed | ReplicationStatus::MaxAttemptsExceeded
        )
    }
}

impl ImageReplication {
    /// Status, treating a missing status block as `Pending`.
    pub fn replication_status(&self) -> ReplicationStatus {
        self.status
            .as_ref()
            .map(|s| s.replication_status)
            .unwrap_or_default()
    }

    pub fn attempts(&self) -> u32 {
        self.status.as_ref().map(|s| s.attempts).unwrap_or_default()
    }
}
