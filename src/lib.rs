//! orbit-controller library crate
//!
//! Watch modules for namespaces, PodSettings, PodDefaults and
//! ImageReplications, plus the mutating pod admission webhooks.

pub mod config;
pub mod controller;
pub mod crd;
pub mod external;
pub mod health;
pub mod index;
pub mod leader;
pub mod watch;
pub mod webhooks;

pub use config::{Cli, Command, OperatorConfig, WatchTarget};
pub use health::HealthState;
pub use webhooks::{WebhookError, run_webhook_server};

use std::path::Path;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::api::WatchParams;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, CustomResourceExt};
use tracing::{info, warn};

use controller::{
    Context, Error, ImageReplicationReconciler, KubeNamespaces, KubePodDefaults, KubeReplications,
    NamespaceReconciler, PodDefaultReconciler, PodSettingReconciler, ReplicationLedger,
};
use crd::{ImageReplication, PodDefault, PodSetting, labels};
use external::{CodeBuildCli, HelmCli, ProcessRunner};
use index::{NamespaceIndex, PodSettingIndex, ReplicationIndex, spawn_store};
use watch::{ConfigMapStateBackend, StateBackend, WatchError, WatchModule};
use webhooks::{ImageReplicationWebhook, ImageRewriter, KubeReplicationRequester, WebhookState};

/// Namespaces that belong to a team or user space.
pub fn namespace_selector() -> String {
    labels::SPACE.to_string()
}

/// Team PodSettings that have not opted out of watching.
pub fn pod_setting_selector() -> String {
    format!("{}={},!{}", labels::SPACE, labels::SPACE_TEAM, labels::DISABLE_WATCHER)
}

/// Team-level objects: PodDefaults to mirror and PodSettings to apply.
pub fn team_space_selector() -> String {
    format!("{}={}", labels::SPACE, labels::SPACE_TEAM)
}

/// Watch parameters for a module's primary resource.
pub fn watch_params(target: WatchTarget) -> WatchParams {
    match target {
        WatchTarget::Namespaces => WatchParams::default().labels(&namespace_selector()),
        WatchTarget::Podsettings => WatchParams::default().labels(&pod_setting_selector()),
        WatchTarget::Poddefaults => WatchParams::default().labels(&team_space_selector()),
        WatchTarget::Imagereplications => WatchParams::default(),
    }
}

/// The CRDs owned by this controller as a multi-document YAML string.
pub fn crd_yaml() -> Result<String, Error> {
    let mut out = String::new();
    for crd in [PodSetting::crd(), ImageReplication::crd()] {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}

fn namespace_index(client: &Client) -> NamespaceIndex {
    NamespaceIndex::new(spawn_store(
        Api::<Namespace>::all(client.clone()),
        WatcherConfig::default().labels(&namespace_selector()),
    ))
}

fn pod_setting_index(client: &Client) -> PodSettingIndex {
    PodSettingIndex::new(spawn_store(
        Api::<PodSetting>::all(client.clone()),
        WatcherConfig::default().labels(&team_space_selector()),
    ))
}

fn replication_index(client: &Client, namespace: &str) -> ReplicationIndex {
    ReplicationIndex::new(spawn_store(
        Api::<ImageReplication>::namespaced(client.clone(), namespace),
        WatcherConfig::default(),
    ))
}

/// Run one watch module until its watcher fails fatally.
pub async fn run_watch(
    client: Client,
    config: &OperatorConfig,
    target: WatchTarget,
    workers: usize,
    health_state: Option<Arc<HealthState>>,
) -> Result<(), WatchError> {
    let module_config = config.module_config(target, workers);
    let backend: Arc<dyn StateBackend> = Arc::new(ConfigMapStateBackend::new(
        Api::<ConfigMap>::namespaced(client.clone(), &config.system_namespace),
        &config.state_configmap,
        &config.state_path,
    ));
    let params = watch_params(target);
    let runner = ProcessRunner::new(config.command_timeout());
    let pod_defaults = Arc::new(KubePodDefaults::new(client.clone()));

    info!(module = %module_config.name, workers = module_config.workers, "Starting watch module");

    match target {
        WatchTarget::Namespaces => {
            let pod_settings = pod_setting_index(&client);
            pod_settings.wait_until_ready().await;
            let reconciler = NamespaceReconciler::new(
                Arc::new(KubeNamespaces::new(client.clone())),
                Arc::new(HelmCli::new(runner, &config.helm_bin)),
                pod_settings,
                pod_defaults,
                config.team_teardown_delay(),
            );
            WatchModule {
                config: module_config,
                source: Arc::new(Api::<Namespace>::all(client)),
                params,
                reconciler: Arc::new(reconciler),
                backend,
                health_state,
            }
            .run()
            .await
        }
        WatchTarget::Podsettings => {
            let namespaces = namespace_index(&client);
            namespaces.wait_until_ready().await;
            WatchModule {
                config: module_config,
                source: Arc::new(Api::<PodSetting>::all(client)),
                params,
                reconciler: Arc::new(PodSettingReconciler::new(namespaces, pod_defaults)),
                backend,
                health_state,
            }
            .run()
            .await
        }
        WatchTarget::Poddefaults => {
            let namespaces = namespace_index(&client);
            namespaces.wait_until_ready().await;
            WatchModule {
                config: module_config,
                source: Arc::new(Api::<PodDefault>::all(client)),
                params,
                reconciler: Arc::new(PodDefaultReconciler::new(namespaces, pod_defaults)),
                backend,
                health_state,
            }
            .run()
            .await
        }
        WatchTarget::Imagereplications => {
            let index = replication_index(&client, &config.system_namespace);
            index.wait_until_ready().await;
            prime_replications(&client, config, index.clone()).await;
            let ctx = Context::new(client.clone(), config.pod_name.clone(), health_state.clone());
            let reconciler = ImageReplicationReconciler::new(
                Arc::new(KubeReplications::new(ctx)),
                Arc::new(CodeBuildCli::new(runner, &config.aws_bin, config.build_settings())),
                index,
                Arc::new(ReplicationLedger::new()),
                config.replication_settings(),
            );
            WatchModule {
                config: module_config,
                source: Arc::new(Api::<ImageReplication>::namespaced(client, &config.system_namespace)),
                params,
                reconciler: Arc::new(reconciler),
                backend,
                health_state,
            }
            .run()
            .await
        }
    }
}

/// Request replications for inventory images that are neither live nor
/// exhausted. Failures are logged and do not stop the module.
async fn prime_replications(client: &Client, config: &OperatorConfig, index: ReplicationIndex) {
    let rewriter = match ImageRewriter::new(config.image_rewrite_config()) {
        Ok(rewriter) => rewriter,
        Err(e) => {
            warn!(error = %e, "Invalid image pattern, skipping inventory");
            return;
        }
    };
    let requester = Arc::new(KubeReplicationRequester::new(client.clone(), &config.system_namespace));
    let replications = ImageReplicationWebhook::new(rewriter, index, requester);
    let path = Path::new(&config.inventory_path);
    if let Err(e) = replications.prime_from_inventory(path).await {
        warn!(path = %path.display(), error = %e, "Failed to read image inventory");
    }
}

/// Build the webhook state, wait for its indexes, then serve.
pub async fn run_webhook(
    client: Client,
    config: &OperatorConfig,
    args: &config::WebhookArgs,
    health_state: Option<Arc<HealthState>>,
) -> Result<(), WebhookError> {
    let rewriter = ImageRewriter::new(config.image_rewrite_config())
        .map_err(|e| WebhookError::Server(format!("invalid image pattern: {e}")))?;
    let namespaces = namespace_index(&client);
    let pod_settings = pod_setting_index(&client);
    let replications = replication_index(&client, &config.system_namespace);
    namespaces.wait_until_ready().await;
    pod_settings.wait_until_ready().await;
    replications.wait_until_ready().await;

    let requester = Arc::new(KubeReplicationRequester::new(client, &config.system_namespace));
    let state = Arc::new(WebhookState {
        namespaces,
        pod_settings,
        images: ImageReplicationWebhook::new(rewriter, replications, requester),
        health_state,
    });
    run_webhook_server(state, args.port, &args.cert, &args.key).await
}
