//! Spoke agent orchestration
//!
//! Builds the dual client setup (local cluster + hub), starts the
//! certificate manager and lease observer reconcilers, and keeps the
//! per-cluster heartbeat lease on the hub renewed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::Api;
use kube::config::Kubeconfig;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use addon_common::crd::ManagedClusterAddOn;
use addon_common::kube_utils::create_client;
use addon_common::{Error, ADDON_LEASE_LABEL};

use crate::cert_manager::{self, CertManagerContext};
use crate::client::{CsrApiImpl, HubApiImpl, LeaseApiImpl, SpokeClientImpl};
use crate::lease::HubLeaseRenewer;
use crate::lease_observer::{self, LeaseObserverContext};

/// Watch stream resync interval for the certificate manager
const INFORMER_RESYNC: Duration = Duration::from_secs(10 * 60);

/// Requeue delay after a reconcile error
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Configuration for the spoke agent process
pub struct SpokeAgentOptions {
    /// Name of this managed cluster; must be non-empty
    pub cluster_name: String,
    /// Mount path of the hub kubeconfig in the container
    pub hub_kubeconfig: PathBuf,
    /// Local cluster kubeconfig; in-cluster configuration when omitted
    pub kubeconfig: Option<PathBuf>,
}

impl SpokeAgentOptions {
    /// Verify the inputs; an empty cluster name refuses to start
    pub fn validate(&self) -> Result<(), Error> {
        if self.cluster_name.is_empty() {
            return Err(Error::configuration("cluster name is empty"));
        }
        Ok(())
    }

    /// Run the spoke agent until the shutdown token fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        self.validate()?;
        info!(cluster = %self.cluster_name, "Starting spoke agent");

        let spoke_client = create_client(self.kubeconfig.as_deref()).await?;
        let hub_client = create_client(Some(&self.hub_kubeconfig)).await?;
        let (hub_server, hub_ca_data) = hub_endpoint(&self.hub_kubeconfig)?;

        let spoke = Arc::new(SpokeClientImpl::new(spoke_client.clone()));
        let hub = Arc::new(HubApiImpl::new(hub_client.clone()));
        // bootstrap and rotation both reach the hub through the process
        // kubeconfig; the CSR itself carries the requested identity
        let csr_api = Arc::new(CsrApiImpl::new(hub_client.clone()));

        let cert_ctx = Arc::new(CertManagerContext::new(
            spoke.clone(),
            hub.clone(),
            csr_api.clone(),
            csr_api,
            hub_server,
            hub_ca_data,
            self.cluster_name.clone(),
            shutdown.clone(),
        ));
        let observer_ctx = Arc::new(LeaseObserverContext {
            spoke,
            hub,
            cluster_name: self.cluster_name.clone(),
        });

        let hub_lease_renewer = HubLeaseRenewer::new(
            Arc::new(LeaseApiImpl::new(hub_client.clone())),
            &self.cluster_name,
        );
        hub_lease_renewer.start(&shutdown);

        let addons: Api<ManagedClusterAddOn> =
            Api::namespaced(hub_client.clone(), &self.cluster_name);

        let cert_controller = Controller::new(addons.clone(), watcher::Config::default())
            .graceful_shutdown_on(shutdown.clone().cancelled_owned())
            .run(cert_reconcile, error_policy, cert_ctx)
            .for_each(log_reconcile_result);

        let agent_leases: Api<Lease> = Api::all(spoke_client);
        let cluster_name = self.cluster_name.clone();
        let observer_controller = Controller::new(addons, watcher::Config::default())
            .watches(
                agent_leases,
                watcher::Config::default().labels(ADDON_LEASE_LABEL),
                move |lease: Lease| {
                    lease
                        .labels()
                        .get(ADDON_LEASE_LABEL)
                        .map(|addon| ObjectRef::new(addon).within(&cluster_name))
                },
            )
            .graceful_shutdown_on(shutdown.clone().cancelled_owned())
            .run(observer_reconcile, error_policy, observer_ctx)
            .for_each(log_reconcile_result);

        tokio::join!(cert_controller, observer_controller);
        hub_lease_renewer.stop();
        info!(cluster = %self.cluster_name, "Spoke agent stopped");
        Ok(())
    }
}

/// Server URL and CA bundle of the hub, read from its kubeconfig
fn hub_endpoint(path: &Path) -> Result<(String, Option<String>), Error> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| Error::configuration(format!("failed to read hub kubeconfig: {e}")))?;
    let cluster = kubeconfig
        .clusters
        .first()
        .and_then(|named| named.cluster.as_ref())
        .ok_or_else(|| Error::configuration("hub kubeconfig has no cluster entry"))?;
    let server = cluster
        .server
        .clone()
        .ok_or_else(|| Error::configuration("hub kubeconfig has no server"))?;
    Ok((server, cluster.certificate_authority_data.clone()))
}

async fn cert_reconcile(
    addon: Arc<ManagedClusterAddOn>,
    ctx: Arc<CertManagerContext>,
) -> Result<Action, Error> {
    cert_manager::sync(&ctx, &addon.name_any()).await?;
    Ok(Action::requeue(INFORMER_RESYNC))
}

async fn observer_reconcile(
    _addon: Arc<ManagedClusterAddOn>,
    ctx: Arc<LeaseObserverContext>,
) -> Result<Action, Error> {
    lease_observer::sync(&ctx).await?;
    Ok(Action::requeue(lease_observer::RESYNC))
}

fn error_policy<K, Ctx>(_obj: Arc<K>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!(error = %error, retryable = error.is_retryable(), "Reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}

async fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Display>(result: Result<T, E>) {
    match result {
        Ok(outcome) => debug!(?outcome, "Reconciliation completed"),
        Err(e) => warn!(error = %e, "Reconciliation error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(cluster_name: &str) -> SpokeAgentOptions {
        SpokeAgentOptions {
            cluster_name: cluster_name.to_string(),
            hub_kubeconfig: PathBuf::from("/spoke/hub-kubeconfig"),
            kubeconfig: None,
        }
    }

    #[test]
    fn empty_cluster_name_refuses_to_start() {
        let err = options("").validate().expect_err("must be rejected");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("cluster name"));
    }

    #[test]
    fn non_empty_cluster_name_is_accepted() {
        options("testcluster").validate().expect("valid options");
    }
}
