//! Lease renewal
//!
//! A [`LeaseRenewer`] periodically rewrites a lease's `renewTime`, jittered
//! so a fleet of spokes does not thunder at the hub in lockstep. Renewal is
//! resilient: storage errors are logged and the next tick proceeds, since
//! the observer only needs some update to land within the grace period.
//!
//! Two renewers are derived from it: the [`HubLeaseRenewer`] keeping the
//! per-cluster heartbeat alive on the hub, and the [`AddonHeartbeat`] an
//! agent embeds to renew its own lease in the install namespace.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::core::ObjectMeta;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use addon_common::{
    addon_lease_name, ADDON_LEASE_LABEL, DEFAULT_LEASE_DURATION_SECONDS, HUB_LEASE_NAME,
};

use crate::client::LeaseApi;

/// Maximum fraction of the period added as random jitter
pub const LEASE_UPDATE_JITTER: f64 = 0.25;

/// Periodically renews one lease.
///
/// `start` is idempotent while running and `stop` is safe to call at any
/// time; both take an internal guard so concurrent callers cannot spawn a
/// second loop.
pub struct LeaseRenewer {
    api: Arc<dyn LeaseApi>,
    namespace: String,
    name: String,
    /// Labels to stamp when the renewer itself creates the lease;
    /// `None` leaves creation to the observer on the other side
    create_labels: Option<BTreeMap<String, String>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl LeaseRenewer {
    pub fn new(
        api: Arc<dyn LeaseApi>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        create_labels: Option<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            name: name.into(),
            create_labels,
            cancel: Mutex::new(None),
        }
    }

    /// Start the renewal loop with the given base period.
    ///
    /// The first renewal happens immediately; each subsequent one waits the
    /// period plus up to 25% jitter. The loop stops when the parent token
    /// or [`stop`](Self::stop) cancels it.
    pub fn start(&self, parent: &CancellationToken, period: Duration) {
        let mut guard = self.cancel.lock().expect("lease renewer lock poisoned");
        if guard.is_some() {
            return;
        }
        let token = parent.child_token();
        *guard = Some(token.clone());

        let api = self.api.clone();
        let namespace = self.namespace.clone();
        let name = self.name.clone();
        let create_labels = self.create_labels.clone();
        tokio::spawn(async move {
            debug!(lease = %name, namespace = %namespace, "Lease renewal started");
            loop {
                if let Err(e) = renew_once(api.as_ref(), &namespace, &name, &create_labels).await {
                    warn!(lease = %name, namespace = %namespace, error = %e, "Lease renewal failed");
                }
                let delay = jittered(period);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {
                        debug!(lease = %name, namespace = %namespace, "Lease renewal stopped");
                        return;
                    }
                }
            }
        });
    }

    /// Stop the renewal loop
    pub fn stop(&self) {
        let mut guard = self.cancel.lock().expect("lease renewer lock poisoned");
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }
}

impl Drop for LeaseRenewer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One read-modify-write renewal pass
async fn renew_once(
    api: &dyn LeaseApi,
    namespace: &str,
    name: &str,
    create_labels: &Option<BTreeMap<String, String>>,
) -> Result<(), addon_common::Error> {
    match api.get_lease(namespace, name).await? {
        Some(mut lease) => {
            lease
                .spec
                .get_or_insert_with(Default::default)
                .renew_time = Some(MicroTime(Utc::now()));
            api.update_lease(&lease).await
        }
        None => {
            let Some(labels) = create_labels else {
                // the hub-side observer owns creation of this lease
                return Ok(());
            };
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(name.to_string()),
                    renew_time: Some(MicroTime(Utc::now())),
                    ..Default::default()
                }),
            };
            api.create_lease(&lease).await
        }
    }
}

fn jittered(period: Duration) -> Duration {
    let factor = 1.0 + rand::rng().random::<f64>() * LEASE_UPDATE_JITTER;
    period.mul_f64(factor)
}

/// Renews the per-cluster heartbeat lease on the hub
pub struct HubLeaseRenewer {
    renewer: LeaseRenewer,
}

impl HubLeaseRenewer {
    /// `api` must be bound to hub credentials
    pub fn new(api: Arc<dyn LeaseApi>, cluster_name: &str) -> Self {
        Self {
            renewer: LeaseRenewer::new(api, cluster_name, HUB_LEASE_NAME, None),
        }
    }

    /// Start renewing at the default lease duration
    pub fn start(&self, parent: &CancellationToken) {
        self.renewer.start(
            parent,
            Duration::from_secs(DEFAULT_LEASE_DURATION_SECONDS as u64),
        );
    }

    pub fn stop(&self) {
        self.renewer.stop();
    }
}

/// Renews an add-on agent's lease in its install namespace.
///
/// Creates the lease (labelled for the add-on) on first renewal so a fresh
/// agent converges without manual setup.
pub struct AddonHeartbeat {
    renewer: LeaseRenewer,
}

impl AddonHeartbeat {
    /// `api` must be bound to the spoke cluster
    pub fn new(api: Arc<dyn LeaseApi>, addon_name: &str, install_namespace: &str) -> Self {
        let labels: BTreeMap<String, String> =
            [(ADDON_LEASE_LABEL.to_string(), addon_name.to_string())].into();
        Self {
            renewer: LeaseRenewer::new(
                api,
                install_namespace,
                addon_lease_name(addon_name),
                Some(labels),
            ),
        }
    }

    /// Start renewing at the default lease duration
    pub fn start(&self, parent: &CancellationToken) {
        self.renewer.start(
            parent,
            Duration::from_secs(DEFAULT_LEASE_DURATION_SECONDS as u64),
        );
    }

    pub fn stop(&self) {
        self.renewer.stop();
    }
}
