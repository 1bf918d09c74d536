//! Per-add-on certificate lifecycle management
//!
//! For every add-on with registration enabled, this reconciler runs the
//! two-phase identity lifecycle: a bootstrap certificate controller over
//! the bootstrap hub credentials until a valid identity is persisted, then
//! a rotation controller over the issued credentials. At most one phase is
//! active per add-on; switching phases cancels the outgoing one first.
//! Add-on deletion stops rotation and releases the spoke finalizer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::distr::Alphanumeric;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use addon_common::crd::ManagedClusterAddOn;
use addon_common::{
    annotations, hub_kubeconfig_secret_name, Error, DEFAULT_SIGNER, SPOKE_REGISTRATION_FINALIZER,
};

use crate::certificate::{agent_name_from_secret, identity_secret_is_valid};
use crate::client::{CsrApi, HubApi, SpokeClient};
use crate::client_cert::{ClientCertConfig, ClientCertController};

/// Length of the generated agent name
const AGENT_NAME_LENGTH: usize = 5;

/// How often the persisted identity is probed during bootstrap
const BOOTSTRAP_POLL: Duration = Duration::from_secs(1);

/// Running state for one add-on's identity lifecycle
struct AddonCertManager {
    stop_rotate: CancellationToken,
    agent_name: String,
}

/// Context for the certificate manager reconciler
pub struct CertManagerContext {
    pub spoke: Arc<dyn SpokeClient>,
    pub hub: Arc<dyn HubApi>,
    /// CSR surface over the bootstrap hub credentials
    pub bootstrap_csr_api: Arc<dyn CsrApi>,
    /// CSR surface over the issued hub credentials
    pub csr_api: Arc<dyn CsrApi>,
    pub hub_server: String,
    pub hub_ca_data: Option<String>,
    pub cluster_name: String,
    /// Root token every phase controller is parented to
    pub shutdown: CancellationToken,
    managers: tokio::sync::Mutex<HashMap<String, AddonCertManager>>,
}

impl CertManagerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spoke: Arc<dyn SpokeClient>,
        hub: Arc<dyn HubApi>,
        bootstrap_csr_api: Arc<dyn CsrApi>,
        csr_api: Arc<dyn CsrApi>,
        hub_server: String,
        hub_ca_data: Option<String>,
        cluster_name: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            spoke,
            hub,
            bootstrap_csr_api,
            csr_api,
            hub_server,
            hub_ca_data,
            cluster_name,
            shutdown,
            managers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Whether a lifecycle is currently running for the add-on
    pub async fn is_managing(&self, addon_name: &str) -> bool {
        self.managers.lock().await.contains_key(addon_name)
    }

    /// The agent name of a running lifecycle, if any
    pub async fn agent_name(&self, addon_name: &str) -> Option<String> {
        self.managers
            .lock()
            .await
            .get(addon_name)
            .map(|m| m.agent_name.clone())
    }
}

/// Reconcile the identity lifecycle of one add-on
pub async fn sync(ctx: &CertManagerContext, addon_name: &str) -> Result<(), Error> {
    debug!(addon = %addon_name, "Reconciling addon certificate lifecycle");

    let Some(addon) = ctx.hub.get_addon(&ctx.cluster_name, addon_name).await? else {
        return Ok(());
    };
    if !addon.registration_enabled() {
        return Ok(());
    }

    if !addon.is_deleting() && !has_finalizer(&addon) {
        let mut updated = addon;
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(SPOKE_REGISTRATION_FINALIZER.to_string());
        return ctx.hub.update_addon(&updated).await;
    }

    if addon.is_deleting() {
        if let Some(manager) = ctx.managers.lock().await.remove(addon_name) {
            info!(addon = %addon_name, "Stopping certificate rotation, addon deleting");
            manager.stop_rotate.cancel();
        }
        return remove_finalizer(ctx, addon).await;
    }

    if ctx.is_managing(addon_name).await {
        return Ok(());
    }

    let signer = addon
        .annotation(annotations::SIGNER)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SIGNER)
        .to_string();
    let Some(install_namespace) = addon.install_namespace().map(String::from) else {
        return Err(Error::internal(
            "cert-manager",
            format!("addon {addon_name} has no install namespace annotated"),
        ));
    };
    let secret_name = hub_kubeconfig_secret_name(addon_name);

    let agent_name = match ctx.spoke.get_secret(&install_namespace, &secret_name).await? {
        Some(secret) => agent_name_from_secret(&secret).unwrap_or_else(generate_agent_name),
        None => generate_agent_name(),
    };

    start(
        ctx,
        addon_name,
        ClientCertConfig {
            cluster_name: ctx.cluster_name.clone(),
            agent_name,
            addon_name: addon_name.to_string(),
            signer,
            secret_namespace: install_namespace,
            secret_name,
            hub_server: ctx.hub_server.clone(),
            hub_ca_data: ctx.hub_ca_data.clone(),
        },
    )
    .await
}

/// Run the bootstrap phase to completion, then hand over to rotation.
///
/// Bootstrap blocks this reconcile worker polling the identity secret once
/// a second; keys of this reconciler are per-add-on, so only this add-on's
/// lifecycle waits.
async fn start(
    ctx: &CertManagerContext,
    addon_name: &str,
    config: ClientCertConfig,
) -> Result<(), Error> {
    let mut valid = probe_identity(ctx, &config).await?;

    if !valid {
        info!(
            addon = %addon_name,
            agent = %config.agent_name,
            "No valid hub identity, entering bootstrap"
        );
        let bootstrap_token = ctx.shutdown.child_token();
        let controller = ClientCertController::new(
            config.clone(),
            ctx.bootstrap_csr_api.clone(),
            ctx.spoke.clone(),
        );
        tokio::spawn(controller.run(bootstrap_token.clone()));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(BOOTSTRAP_POLL) => {}
                _ = ctx.shutdown.cancelled() => {
                    bootstrap_token.cancel();
                    return Ok(());
                }
            }
            valid = probe_identity(ctx, &config).await.unwrap_or(false);
            if valid {
                break;
            }
        }
        bootstrap_token.cancel();
        info!(addon = %addon_name, "Bootstrap complete, hub identity persisted");
    }

    let rotation_token = ctx.shutdown.child_token();
    let controller =
        ClientCertController::new(config.clone(), ctx.csr_api.clone(), ctx.spoke.clone());
    tokio::spawn(controller.run(rotation_token.clone()));
    info!(addon = %addon_name, agent = %config.agent_name, "Certificate rotation running");

    ctx.managers.lock().await.insert(
        addon_name.to_string(),
        AddonCertManager {
            stop_rotate: rotation_token,
            agent_name: config.agent_name,
        },
    );
    Ok(())
}

async fn probe_identity(
    ctx: &CertManagerContext,
    config: &ClientCertConfig,
) -> Result<bool, Error> {
    let secret = ctx
        .spoke
        .get_secret(&config.secret_namespace, &config.secret_name)
        .await?;
    Ok(secret
        .as_ref()
        .is_some_and(|s| identity_secret_is_valid(s, &config.cluster_name, &config.agent_name)))
}

fn generate_agent_name() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(AGENT_NAME_LENGTH)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

async fn remove_finalizer(ctx: &CertManagerContext, addon: ManagedClusterAddOn) -> Result<(), Error> {
    let Some(finalizers) = &addon.metadata.finalizers else {
        return Ok(());
    };
    let kept: Vec<String> = finalizers
        .iter()
        .filter(|f| f.as_str() != SPOKE_REGISTRATION_FINALIZER)
        .cloned()
        .collect();
    if kept.len() == finalizers.len() {
        return Ok(());
    }

    let mut updated = addon;
    updated.metadata.finalizers = (!kept.is_empty()).then_some(kept);
    ctx.hub.update_addon(&updated).await
}

fn has_finalizer(addon: &ManagedClusterAddOn) -> bool {
    addon
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == SPOKE_REGISTRATION_FINALIZER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::test_fixtures::{self_signed, valid_window};
    use crate::certificate::identity_secret_data;
    use crate::client::{MockCsrApi, MockHubApi, MockSpokeClient};
    use addon_common::crd::ManagedClusterAddOnSpec;
    use chrono::Utc;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;

    const AGENT_CN: &str =
        "system:open-cluster-management:cluster:testcluster:addon:testaddon:agent:ab1cd";

    fn addon(
        registration: &str,
        finalizers: Vec<String>,
        deleting: bool,
    ) -> ManagedClusterAddOn {
        let annotations: BTreeMap<String, String> = [
            ("enable_registration".to_string(), registration.to_string()),
            ("installNamespace".to_string(), "ns1".to_string()),
            (
                "signer".to_string(),
                "kubernetes.io/kube-apiserver-client".to_string(),
            ),
        ]
        .into();
        ManagedClusterAddOn {
            metadata: ObjectMeta {
                name: Some("testaddon".to_string()),
                namespace: Some("testcluster".to_string()),
                annotations: Some(annotations),
                finalizers: (!finalizers.is_empty()).then_some(finalizers),
                deletion_timestamp: deleting.then(|| Time(Utc::now())),
                ..Default::default()
            },
            spec: ManagedClusterAddOnSpec::default(),
            status: None,
        }
    }

    fn valid_identity_secret() -> Secret {
        let (not_before, not_after) = valid_window();
        let (cert, key) = self_signed(AGENT_CN, not_before, not_after);
        Secret {
            metadata: ObjectMeta {
                name: Some("testaddon-hub-kubeconfig".to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            },
            data: Some(identity_secret_data(
                b"kubeconfig".to_vec(),
                cert.into_bytes(),
                key.into_bytes(),
                "testcluster",
                "ab1cd",
            )),
            ..Default::default()
        }
    }

    fn context(spoke: MockSpokeClient, hub: MockHubApi) -> CertManagerContext {
        CertManagerContext::new(
            Arc::new(spoke),
            Arc::new(hub),
            Arc::new(MockCsrApi::new()),
            Arc::new(MockCsrApi::new()),
            "https://hub.example.com:6443".to_string(),
            None,
            "testcluster".to_string(),
            CancellationToken::new(),
        )
    }

    /// Law: an add-on without registration enabled sees no writes at all.
    #[tokio::test]
    async fn story_registration_disabled_means_no_writes() {
        let spoke = MockSpokeClient::new();
        let mut hub = MockHubApi::new();
        hub.expect_get_addon()
            .returning(|_, _| Ok(Some(addon("false", Vec::new(), false))));

        let ctx = context(spoke, hub);
        sync(&ctx, "testaddon").await.expect("sync should succeed");
        assert!(!ctx.is_managing("testaddon").await);
    }

    #[tokio::test]
    async fn story_first_pass_adds_the_spoke_finalizer() {
        let spoke = MockSpokeClient::new();
        let mut hub = MockHubApi::new();
        hub.expect_get_addon()
            .returning(|_, _| Ok(Some(addon("true", Vec::new(), false))));
        hub.expect_update_addon()
            .withf(|addon| {
                addon
                    .metadata
                    .finalizers
                    .as_ref()
                    .is_some_and(|f| f.iter().any(|x| x == SPOKE_REGISTRATION_FINALIZER))
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctx = context(spoke, hub);
        sync(&ctx, "testaddon").await.expect("sync should succeed");
    }

    /// Story: an already-valid identity skips bootstrap and goes straight
    /// to rotation, reusing the persisted agent name.
    #[tokio::test]
    async fn story_valid_identity_starts_rotation_directly() {
        let mut spoke = MockSpokeClient::new();
        spoke
            .expect_get_secret()
            .returning(|_, _| Ok(Some(valid_identity_secret())));
        let mut hub = MockHubApi::new();
        hub.expect_get_addon().returning(|_, _| {
            Ok(Some(addon(
                "true",
                vec![SPOKE_REGISTRATION_FINALIZER.to_string()],
                false,
            )))
        });

        let ctx = context(spoke, hub);
        sync(&ctx, "testaddon").await.expect("sync should succeed");
        assert!(ctx.is_managing("testaddon").await);
        assert_eq!(ctx.agent_name("testaddon").await.as_deref(), Some("ab1cd"));
    }

    /// Idempotence: a second reconcile of a managed add-on does nothing.
    #[tokio::test]
    async fn story_second_pass_is_a_no_op() {
        let mut spoke = MockSpokeClient::new();
        spoke
            .expect_get_secret()
            .returning(|_, _| Ok(Some(valid_identity_secret())));
        let mut hub = MockHubApi::new();
        hub.expect_get_addon().returning(|_, _| {
            Ok(Some(addon(
                "true",
                vec![SPOKE_REGISTRATION_FINALIZER.to_string()],
                false,
            )))
        });

        let ctx = context(spoke, hub);
        sync(&ctx, "testaddon").await.expect("first sync");
        sync(&ctx, "testaddon").await.expect("second sync");
        assert!(ctx.is_managing("testaddon").await);
    }

    /// Story: deletion cancels the rotation phase and releases the
    /// finalizer.
    #[tokio::test]
    async fn story_deletion_stops_rotation_and_releases_finalizer() {
        let mut spoke = MockSpokeClient::new();
        spoke
            .expect_get_secret()
            .returning(|_, _| Ok(Some(valid_identity_secret())));
        let mut hub = MockHubApi::new();
        hub.expect_get_addon().returning(|_, _| {
            Ok(Some(addon(
                "true",
                vec![SPOKE_REGISTRATION_FINALIZER.to_string()],
                false,
            )))
        });

        let ctx = context(spoke, hub);
        sync(&ctx, "testaddon").await.expect("start sync");
        let rotation_token = {
            let managers = ctx.managers.lock().await;
            managers.get("testaddon").expect("managed").stop_rotate.clone()
        };
        assert!(!rotation_token.is_cancelled());

        // re-deliver the addon as deleting
        let mut hub = MockHubApi::new();
        hub.expect_get_addon().returning(|_, _| {
            Ok(Some(addon(
                "true",
                vec![SPOKE_REGISTRATION_FINALIZER.to_string()],
                true,
            )))
        });
        hub.expect_update_addon()
            .withf(|addon| addon.metadata.finalizers.is_none())
            .times(1)
            .returning(|_| Ok(()));
        // swap in the deleting-view hub mock, keeping the managers map
        let deleting_ctx = CertManagerContext {
            hub: Arc::new(hub),
            ..ctx
        };

        sync(&deleting_ctx, "testaddon")
            .await
            .expect("deletion sync");
        assert!(rotation_token.is_cancelled());
        assert!(!deleting_ctx.is_managing("testaddon").await);
    }

    #[tokio::test]
    async fn missing_install_namespace_is_an_error() {
        let spoke = MockSpokeClient::new();
        let mut hub = MockHubApi::new();
        hub.expect_get_addon().returning(|_, _| {
            let mut addon = addon(
                "true",
                vec![SPOKE_REGISTRATION_FINALIZER.to_string()],
                false,
            );
            addon
                .metadata
                .annotations
                .as_mut()
                .unwrap()
                .remove("installNamespace");
            Ok(Some(addon))
        });

        let ctx = context(spoke, hub);
        let err = sync(&ctx, "testaddon").await.expect_err("should fail");
        assert!(err.is_retryable());
    }

    #[test]
    fn generated_agent_names_are_five_lowercase_chars() {
        for _ in 0..32 {
            let name = generate_agent_name();
            assert_eq!(name.len(), 5);
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }
}
