//! Clients for the external tools the reconcilers drive.

pub mod build;
pub mod command;
pub mod helm;

pub use build::{BuildService, BuildSettings, BuildState, CodeBuildCli};
pub use command::{CommandOutput, CommandRunner, ProcessRunner};
pub use helm::{ChartEntry, HelmCli, HelmClient, InstallRequest, Release};
