//! Process configuration.
//!
//! Every option can be given as a flag or through the environment variable
//! named next to it; the deployment manifests only use the environment.

use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kube::Resource;

use crate::controller::{Error, ReplicationSettings, Result};
use crate::crd::PodSetting;
use crate::external::BuildSettings;
use crate::watch::ModuleConfig;
use crate::webhooks::ImageRewriteConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "orbit-controller", version, about = "Orbit team and user space controller")]
pub struct Cli {
    #[command(flatten)]
    pub config: OperatorConfig,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run one watch module
    Watch {
        #[arg(value_enum)]
        target: WatchTarget,
        /// Worker tasks draining the event queue
        #[arg(long, env = "WORKERS", default_value_t = 2)]
        workers: usize,
    },
    /// Serve the mutating admission webhooks
    Webhook(WebhookArgs),
    /// Print the CRDs owned by this controller as YAML
    Crd,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum WatchTarget {
    Namespaces,
    Podsettings,
    Poddefaults,
    Imagereplications,
}

impl WatchTarget {
    /// Module key used for persisted state, metrics and the leader lease.
    pub fn module_name(&self) -> &'static str {
        match self {
            WatchTarget::Namespaces => "namespacesWatcher",
            WatchTarget::Podsettings => "podsettingsWatcher",
            WatchTarget::Poddefaults => "poddefaultsWatcher",
            WatchTarget::Imagereplications => "imagereplicationsWatcher",
        }
    }

    pub fn lease_name(&self) -> String {
        format!("orbit-controller-{}", self.module_name().to_lowercase())
    }
}

#[derive(Args, Debug, Clone)]
pub struct WebhookArgs {
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 443)]
    pub port: u16,
    #[arg(long, env = "WEBHOOK_CERT", default_value = "/certs/tls.crt")]
    pub cert: String,
    #[arg(long, env = "WEBHOOK_KEY", default_value = "/certs/tls.key")]
    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct OperatorConfig {
    /// Must equal the group compiled into the CRDs
    #[arg(long, global = true, env = "ORBIT_API_GROUP", default_value = "orbit.aws")]
    pub api_group: String,
    #[arg(long, global = true, env = "ORBIT_API_VERSION", default_value = "v1")]
    pub api_version: String,

    #[arg(long, global = true, env = "ORBIT_SYSTEM_NAMESPACE", default_value = "orbit-system")]
    pub system_namespace: String,

    /// Mount point of the state ConfigMap, read when the API is unavailable
    #[arg(long, global = true, env = "ORBIT_STATE_PATH", default_value = "/state")]
    pub state_path: String,
    #[arg(long, global = true, env = "ORBIT_STATE_CONFIGMAP", default_value = "admission-controller-state")]
    pub state_configmap: String,
    #[arg(long, global = true, env = "STATE_UPDATE_INTERVAL_SECS", default_value_t = 5)]
    pub state_update_interval_secs: u64,
    #[arg(long, global = true, env = "WORKER_PAUSE_MILLIS", default_value_t = 1000)]
    pub worker_pause_millis: u64,

    /// Internal registry host
    #[arg(long, global = true, env = "REPO_HOST", default_value = "")]
    pub repo_host: String,
    #[arg(long, global = true, env = "REPO_PREFIX", default_value = "")]
    pub repo_prefix: String,
    #[arg(long, global = true, env = "REPLICATE_EXTERNAL_REPOS", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub replicate_external_repos: bool,

    #[arg(long, global = true, env = "CODEBUILD_PROJECT", default_value = "")]
    pub codebuild_project: String,
    /// Build timeout in minutes
    #[arg(long, global = true, env = "CODEBUILD_TIMEOUT", default_value_t = 30)]
    pub codebuild_timeout: u32,
    #[arg(long, global = true, env = "ORBIT_CODEBUILD_IMAGE", default_value = "")]
    pub codebuild_image: String,

    /// Images replicated when the ImageReplication watcher starts, one per line
    #[arg(long, global = true, env = "INVENTORY_PATH", default_value = "/var/orbit-controller/image_inventory.txt")]
    pub inventory_path: String,

    #[arg(long, global = true, env = "MAX_REPLICATION_ATTEMPTS", default_value_t = 3)]
    pub max_replication_attempts: u32,
    #[arg(long, global = true, env = "REPLICATION_RETRY_DELAY_SECS", default_value_t = 30)]
    pub replication_retry_delay_secs: u64,
    #[arg(long, global = true, env = "BUILD_POLL_INTERVAL_SECS", default_value_t = 10)]
    pub build_poll_interval_secs: u64,

    /// Wait between deleting a team's profiles and its namespaces
    #[arg(long, global = true, env = "TEAM_TEARDOWN_DELAY_SECS", default_value_t = 60)]
    pub team_teardown_delay_secs: u64,

    /// Use the pod's service account instead of a kubeconfig
    #[arg(long, global = true, env = "IN_CLUSTER_DEPLOYMENT", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub in_cluster: bool,

    #[arg(long, global = true, env = "HELM_BIN", default_value = "helm")]
    pub helm_bin: String,
    #[arg(long, global = true, env = "AWS_BIN", default_value = "aws")]
    pub aws_bin: String,
    #[arg(long, global = true, env = "COMMAND_TIMEOUT_SECS", default_value_t = 29)]
    pub command_timeout_secs: u64,

    #[arg(long, global = true, env = "HEALTH_PORT", default_value_t = crate::health::HEALTH_PORT)]
    pub health_port: u16,

    /// Leader election identity; defaults to the hostname
    #[arg(long, global = true, env = "POD_NAME")]
    pub pod_name: Option<String>,
    #[arg(long, global = true, env = "POD_NAMESPACE")]
    pub pod_namespace: Option<String>,

    #[arg(long, global = true, env = "ORBIT_CONTROLLER_DEBUG", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub debug: bool,
}

impl Command {
    /// Whether this command rewrites or replicates images.
    pub fn replicates_images(&self) -> bool {
        matches!(
            self,
            Command::Webhook(_)
                | Command::Watch {
                    target: WatchTarget::Imagereplications,
                    ..
                }
        )
    }
}

impl OperatorConfig {
    /// Reject a group/version that differs from the compiled CRDs, and
    /// missing registry or build settings for commands that need them.
    pub fn validate(&self, command: &Command) -> Result<()> {
        let group = PodSetting::group(&());
        let version = PodSetting::version(&());
        if self.api_group != group || self.api_version != version {
            return Err(Error::Validation(format!(
                "ORBIT_API_GROUP/ORBIT_API_VERSION {}/{} do not match compiled CRDs {group}/{version}",
                self.api_group, self.api_version
            )));
        }
        if self.max_replication_attempts == 0 {
            return Err(Error::Validation("MAX_REPLICATION_ATTEMPTS must be at least 1".into()));
        }
        if command.replicates_images() {
            let missing: Vec<&str> = [
                ("REPO_HOST", &self.repo_host),
                ("REPO_PREFIX", &self.repo_prefix),
                ("CODEBUILD_PROJECT", &self.codebuild_project),
            ]
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name)
            .collect();
            if !missing.is_empty() {
                return Err(Error::Validation(format!(
                    "{} required for image replication",
                    missing.join(", ")
                )));
            }
            if self.codebuild_timeout == 0 {
                return Err(Error::Validation("CODEBUILD_TIMEOUT must be at least 1".into()));
            }
        }
        Ok(())
    }

    pub fn module_config(&self, target: WatchTarget, workers: usize) -> ModuleConfig {
        let mut config = ModuleConfig::new(target.module_name(), workers);
        config.worker_pause = Duration::from_millis(self.worker_pause_millis);
        config.state_interval = Duration::from_secs(self.state_update_interval_secs);
        config
    }

    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            repo_host: self.repo_host.clone(),
            repo_prefix: self.repo_prefix.clone(),
            project: self.codebuild_project.clone(),
            timeout_minutes: self.codebuild_timeout,
            image: self.codebuild_image.clone(),
        }
    }

    pub fn replication_settings(&self) -> ReplicationSettings {
        ReplicationSettings {
            max_attempts: self.max_replication_attempts,
            retry_delay: Duration::from_secs(self.replication_retry_delay_secs),
            poll_interval: Duration::from_secs(self.build_poll_interval_secs),
        }
    }

    pub fn image_rewrite_config(&self) -> ImageRewriteConfig {
        ImageRewriteConfig {
            repo_host: self.repo_host.clone(),
            repo_prefix: self.repo_prefix.clone(),
            replicate_external_repos: self.replicate_external_repos,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn team_teardown_delay(&self) -> Duration {
        Duration::from_secs(self.team_teardown_delay_secs)
    }

    /// Default tracing directives.
    pub fn log_directives(&self) -> &'static str {
        if self.debug {
            "orbit_controller=debug,kube=info"
        } else {
            "orbit_controller=info,kube=info"
        }
    }
}
