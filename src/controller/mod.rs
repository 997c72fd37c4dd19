//! Reconcilers for the watch modules.
//!
//! - [`namespace`]: user-space Helm charts and team teardown
//! - [`pod_setting`]: PodSetting to PodDefault derivation
//! - [`pod_default`]: PodDefault propagation into user namespaces
//! - [`image_replication`]: build-driven image replication

pub mod context;
pub mod error;
pub mod image_replication;
pub mod ledger;
pub mod namespace;
pub mod pod_default;
pub mod pod_setting;

pub use context::{Context, FIELD_MANAGER};
pub use error::{Error, Result};
pub use image_replication::{
    ImageReplicationReconciler, KubeReplications, ReplicationClient, ReplicationSettings,
};
pub use ledger::ReplicationLedger;
pub use namespace::{KubeNamespaces, NamespaceClient, NamespaceReconciler, TeamContext};
pub use pod_default::{KubePodDefaults, PodDefaultClient, PodDefaultReconciler};
pub use pod_setting::PodSettingReconciler;
