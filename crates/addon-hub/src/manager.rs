//! Process orchestration for the hub
//!
//! Two entry points live here. [`AddonManager`] is what an add-on author
//! embeds: per add-on it wires the cluster-management, deploy, annotation,
//! registration and CSR reconcilers. [`run_controller_manager`] is the
//! fleet-level hub process behind the `manager` binary: managed-cluster
//! admission and per-cluster liveness observation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use addon_common::agent::{AgentAddon, AgentAddonRegistration, CsrApproveCheck};
use addon_common::crd::{ManagedCluster, ManagedClusterAddOn};
use addon_common::{Error, DEFAULT_SIGNER, HUB_LEASE_NAME};

use crate::client::{HubClient, HubClientImpl};
use crate::config_annotation::{self, ConfigAnnotationContext};
use crate::csr_approve::{self, CsrApproveContext};
use crate::liveness::{self, LivenessContext};
use crate::managed_cluster::{self, ManagedClusterContext};
use crate::{agent_deploy, cluster_management};
use crate::agent_deploy::DeployContext;
use crate::registration_deploy::{self, RegistrationDeployContext};

/// Watch stream resync interval shared by the hub controllers
pub const INFORMER_RESYNC: Duration = Duration::from_secs(10 * 60);

/// Requeue delay after a reconcile error
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Static configuration of one add-on's manager
pub struct AddonManagerConfig {
    /// Name of the add-on
    pub addon_name: String,
    /// Namespace the agent is installed into on each spoke
    pub install_namespace: String,
    /// Resource coordinates of the add-on's configuration type, if any
    pub configuration_resource: Option<ApiResource>,
}

/// Hub manager for a single add-on.
///
/// Construct with the manifest supplier, switch on the optional surfaces,
/// then [`run`](AddonManager::run) it against a hub client.
pub struct AddonManager {
    config: AddonManagerConfig,
    agent_addon: Arc<dyn AgentAddon>,
    registration: Option<Arc<dyn AgentAddonRegistration>>,
    signer: String,
    approve_checks: Vec<CsrApproveCheck>,
    enable_csr_approve: bool,
}

impl AddonManager {
    /// Create a manager for the add-on served by `agent_addon`
    pub fn new(config: AddonManagerConfig, agent_addon: Arc<dyn AgentAddon>) -> Self {
        Self {
            config,
            agent_addon,
            registration: None,
            signer: String::new(),
            approve_checks: Vec::new(),
            enable_csr_approve: false,
        }
    }

    /// Enable agent registration with the given registration supplier.
    ///
    /// Defaults the signer to the kube-apiserver client signer when no
    /// explicit signer was set.
    pub fn with_registration_enabled(
        mut self,
        registration: Arc<dyn AgentAddonRegistration>,
    ) -> Self {
        self.registration = Some(registration);
        if self.signer.is_empty() {
            self.signer = DEFAULT_SIGNER.to_string();
        }
        self
    }

    /// Override the signer requested for agent certificates
    pub fn with_signer(mut self, signer: impl Into<String>) -> Self {
        self.signer = signer.into();
        self
    }

    /// Enable CSR auto-approval with the given checks for new requests
    pub fn with_csr_approve_checks(mut self, checks: Vec<CsrApproveCheck>) -> Self {
        self.enable_csr_approve = true;
        self.approve_checks.extend(checks);
        self
    }

    /// Run every enabled reconciler until the shutdown token fires
    pub async fn run(self, client: Client, shutdown: CancellationToken) -> Result<(), Error> {
        if self.config.addon_name.is_empty() {
            return Err(Error::configuration("addon name is empty"));
        }

        let hub_client: Arc<dyn HubClient> = Arc::new(HubClientImpl::new(
            client.clone(),
            self.config.configuration_resource.clone(),
        ));
        let addon_name = self.config.addon_name.clone();
        info!(addon = %addon_name, "Starting addon manager");

        let mut tasks: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = Vec::new();

        tasks.push(Box::pin(cluster_management::run(
            hub_client.clone(),
            addon_name.clone(),
            shutdown.clone(),
        )));

        let addons: Api<ManagedClusterAddOn> = Api::all(client.clone());
        let clusters: Api<ManagedCluster> = Api::all(client.clone());
        let addon_watch =
            watcher::Config::default().fields(&format!("metadata.name={addon_name}"));

        // deploy reconciler: add-on events, cluster events, config events
        let deploy_ctx = Arc::new(DeployContext {
            client: hub_client.clone(),
            addon_name: addon_name.clone(),
            agent_addon: self.agent_addon.clone(),
        });
        let mut deploy_controller = Controller::new(addons.clone(), addon_watch.clone())
            .watches(clusters.clone(), watcher::Config::default(), {
                let addon_name = addon_name.clone();
                move |cluster: ManagedCluster| addon_ref_for_cluster(&addon_name, &cluster)
            });
        if let Some(resource) = &self.config.configuration_resource {
            let configs: Api<DynamicObject> = Api::all_with(client.clone(), resource);
            deploy_controller = deploy_controller.watches_with(
                configs,
                resource.clone(),
                watcher::Config::default(),
                {
                    let addon_name = addon_name.clone();
                    move |config: DynamicObject| {
                        config
                            .namespace()
                            .map(|ns| ObjectRef::<ManagedClusterAddOn>::new(&addon_name).within(&ns))
                    }
                },
            );
        }
        tasks.push(Box::pin(
            deploy_controller
                .graceful_shutdown_on(shutdown.clone().cancelled_owned())
                .run(deploy_reconcile, error_policy, deploy_ctx)
                .for_each(log_reconcile_result),
        ));

        // config annotator
        let annotation_ctx = Arc::new(ConfigAnnotationContext {
            client: hub_client.clone(),
            addon_name: addon_name.clone(),
            install_namespace: self.config.install_namespace.clone(),
            signer: self.signer.clone(),
            registration_enabled: self.registration.is_some(),
            registration: self.registration.clone(),
        });
        tasks.push(Box::pin(
            Controller::new(addons.clone(), addon_watch.clone())
                .watches(clusters.clone(), watcher::Config::default(), {
                    let addon_name = addon_name.clone();
                    move |cluster: ManagedCluster| addon_ref_for_cluster(&addon_name, &cluster)
                })
                .graceful_shutdown_on(shutdown.clone().cancelled_owned())
                .run(annotation_reconcile, error_policy, annotation_ctx)
                .for_each(log_reconcile_result),
        ));

        // registration deploy reconciler
        if let Some(registration) = &self.registration {
            let registration_ctx = Arc::new(RegistrationDeployContext {
                client: hub_client.clone(),
                addon_name: addon_name.clone(),
                install_namespace: self.config.install_namespace.clone(),
                agent_addon: registration.clone(),
            });
            tasks.push(Box::pin(
                Controller::new(addons.clone(), addon_watch.clone())
                    .watches(clusters.clone(), watcher::Config::default(), {
                        let addon_name = addon_name.clone();
                        move |cluster: ManagedCluster| addon_ref_for_cluster(&addon_name, &cluster)
                    })
                    .graceful_shutdown_on(shutdown.clone().cancelled_owned())
                    .run(registration_reconcile, error_policy, registration_ctx)
                    .for_each(log_reconcile_result),
            ));
        }

        // CSR approver
        if self.enable_csr_approve {
            let csr_ctx = Arc::new(CsrApproveContext {
                client: hub_client.clone(),
                addon_name: addon_name.clone(),
                signer: self.signer.clone(),
                checks: self.approve_checks.clone(),
            });
            let csrs: Api<CertificateSigningRequest> = Api::all(client.clone());
            tasks.push(Box::pin(
                Controller::new(csrs, watcher::Config::default())
                    .graceful_shutdown_on(shutdown.clone().cancelled_owned())
                    .run(csr_reconcile, error_policy, csr_ctx)
                    .for_each(log_reconcile_result),
            ));
        }

        futures::future::join_all(tasks).await;
        info!(addon = %addon_name, "Addon manager stopped");
        Ok(())
    }
}

/// Run the fleet-level hub controllers until the shutdown token fires
pub async fn run_controller_manager(
    client: Client,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    info!("Starting hub controller manager");
    let hub_client: Arc<dyn HubClient> = Arc::new(HubClientImpl::new(client.clone(), None));

    let clusters: Api<ManagedCluster> = Api::all(client.clone());
    let leases: Api<Lease> = Api::all(client.clone());

    let cluster_ctx = Arc::new(ManagedClusterContext {
        client: hub_client.clone(),
    });
    let cluster_controller = Controller::new(clusters.clone(), watcher::Config::default())
        .graceful_shutdown_on(shutdown.clone().cancelled_owned())
        .run(managed_cluster_reconcile, cluster_error_policy, cluster_ctx)
        .for_each(log_reconcile_result);

    let liveness_ctx = Arc::new(LivenessContext {
        client: hub_client.clone(),
    });
    let liveness_controller = Controller::new(clusters, watcher::Config::default())
        .watches(leases, watcher::Config::default(), |lease: Lease| {
            // only the per-cluster heartbeat lease re-triggers its cluster
            (lease.name_any() == HUB_LEASE_NAME)
                .then(|| lease.namespace())
                .flatten()
                .map(|ns| ObjectRef::<ManagedCluster>::new(&ns))
        })
        .graceful_shutdown_on(shutdown.clone().cancelled_owned())
        .run(liveness_reconcile, cluster_error_policy, liveness_ctx)
        .for_each(log_reconcile_result);

    tokio::join!(cluster_controller, liveness_controller);
    info!("Hub controller manager stopped");
    Ok(())
}

fn addon_ref_for_cluster(
    addon_name: &str,
    cluster: &ManagedCluster,
) -> Option<ObjectRef<ManagedClusterAddOn>> {
    cluster
        .metadata
        .name
        .as_ref()
        .map(|ns| ObjectRef::<ManagedClusterAddOn>::new(addon_name).within(ns))
}

async fn deploy_reconcile(
    addon: Arc<ManagedClusterAddOn>,
    ctx: Arc<DeployContext>,
) -> Result<Action, Error> {
    let cluster = addon.namespace().unwrap_or_default();
    agent_deploy::sync(&ctx, &cluster).await?;
    Ok(Action::requeue(INFORMER_RESYNC))
}

async fn annotation_reconcile(
    addon: Arc<ManagedClusterAddOn>,
    ctx: Arc<ConfigAnnotationContext>,
) -> Result<Action, Error> {
    let cluster = addon.namespace().unwrap_or_default();
    config_annotation::sync(&ctx, &cluster).await?;
    Ok(Action::requeue(INFORMER_RESYNC))
}

async fn registration_reconcile(
    addon: Arc<ManagedClusterAddOn>,
    ctx: Arc<RegistrationDeployContext>,
) -> Result<Action, Error> {
    let cluster = addon.namespace().unwrap_or_default();
    registration_deploy::sync(&ctx, &cluster).await?;
    Ok(Action::requeue(INFORMER_RESYNC))
}

async fn csr_reconcile(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<CsrApproveContext>,
) -> Result<Action, Error> {
    csr_approve::sync(&ctx, &csr.name_any()).await?;
    Ok(Action::await_change())
}

async fn managed_cluster_reconcile(
    cluster: Arc<ManagedCluster>,
    ctx: Arc<ManagedClusterContext>,
) -> Result<Action, Error> {
    managed_cluster::sync(&ctx, &cluster.name_any()).await?;
    Ok(Action::requeue(INFORMER_RESYNC))
}

async fn liveness_reconcile(
    cluster: Arc<ManagedCluster>,
    ctx: Arc<LivenessContext>,
) -> Result<Action, Error> {
    liveness::sync(&ctx, &cluster.name_any()).await?;
    Ok(Action::requeue(liveness::RESYNC))
}

fn error_policy<K, Ctx>(_obj: Arc<K>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!(error = %error, retryable = error.is_retryable(), "Reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}

fn cluster_error_policy<Ctx>(
    _cluster: Arc<ManagedCluster>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    warn!(error = %error, "Cluster reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}

async fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Display>(
    result: Result<T, E>,
) {
    match result {
        Ok(outcome) => debug!(?outcome, "Reconciliation completed"),
        Err(e) => warn!(error = %e, "Reconciliation error"),
    }
}
