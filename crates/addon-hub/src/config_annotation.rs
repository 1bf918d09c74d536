//! Add-on configuration annotator
//!
//! Writes the spoke-facing configuration onto the `ManagedClusterAddOn`
//! annotations: signer, install namespace, the registration switch, and the
//! bootstrap secret reference when the add-on ships bootstrap credentials.
//! The merge is change-detected so a converged add-on sees no writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use addon_common::agent::AgentAddonRegistration;
use addon_common::{annotations, bootstrap_secret_name, Error};

use crate::client::HubClient;

/// Context for the config annotator
pub struct ConfigAnnotationContext {
    pub client: Arc<dyn HubClient>,
    pub addon_name: String,
    pub install_namespace: String,
    /// Signer written to the annotations. Populated only when registration
    /// is enabled; an empty signer propagates as-is otherwise.
    pub signer: String,
    pub registration_enabled: bool,
    /// Present when the add-on supplies registration material
    pub registration: Option<Arc<dyn AgentAddonRegistration>>,
}

/// Reconcile the annotation set of the add-on in one cluster namespace
pub async fn sync(ctx: &ConfigAnnotationContext, cluster_name: &str) -> Result<(), Error> {
    let Some(addon) = ctx.client.get_addon(cluster_name, &ctx.addon_name).await? else {
        return Ok(());
    };
    let Some(cluster) = ctx.client.get_cluster(cluster_name).await? else {
        return Ok(());
    };

    let mut desired = BTreeMap::new();
    if ctx.registration_enabled {
        desired.insert(annotations::SIGNER.to_string(), ctx.signer.clone());
        desired.insert(
            annotations::INSTALL_NAMESPACE.to_string(),
            ctx.install_namespace.clone(),
        );
        desired.insert(
            annotations::ENABLE_REGISTRATION.to_string(),
            "true".to_string(),
        );
    } else {
        desired.insert(
            annotations::ENABLE_REGISTRATION.to_string(),
            "false".to_string(),
        );
    }

    if let Some(registration) = &ctx.registration {
        let kubeconfig = registration.agent_bootstrap_kubeconfig(&cluster)?;
        if !kubeconfig.is_empty() {
            desired.insert(
                annotations::BOOTSTRAP_SECRET.to_string(),
                bootstrap_secret_name(&ctx.addon_name),
            );
        }
    }

    let mut merged = addon.metadata.annotations.clone().unwrap_or_default();
    let mut modified = false;
    for (key, value) in desired {
        if merged.get(&key) != Some(&value) {
            merged.insert(key, value);
            modified = true;
        }
    }
    if !modified {
        debug!(addon = %ctx.addon_name, cluster = %cluster_name, "Annotations already converged");
        return Ok(());
    }

    let mut updated = addon;
    updated.metadata.annotations = Some(merged);
    ctx.client.update_addon(&updated).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockHubClient;
    use addon_common::agent::AgentAddon;
    use addon_common::crd::{
        ManagedCluster, ManagedClusterAddOn, ManagedClusterAddOnSpec, ManagedClusterSpec,
    };
    use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
    use kube::core::{DynamicObject, ObjectMeta};

    struct FakeAddon {
        bootstrap: Vec<u8>,
    }

    impl AgentAddon for FakeAddon {
        fn agent_manifests(
            &self,
            _cluster: &ManagedCluster,
            _config: Option<&DynamicObject>,
        ) -> Result<Vec<serde_json::Value>, Error> {
            Ok(Vec::new())
        }
    }

    impl AgentAddonRegistration for FakeAddon {
        fn agent_hub_rbac(
            &self,
            _cluster: &ManagedCluster,
            _group: &str,
        ) -> (Option<Role>, Option<RoleBinding>) {
            (None, None)
        }

        fn agent_bootstrap_kubeconfig(&self, _cluster: &ManagedCluster) -> Result<Vec<u8>, Error> {
            Ok(self.bootstrap.clone())
        }
    }

    fn addon_with(pairs: &[(&str, &str)]) -> ManagedClusterAddOn {
        let annotations: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ManagedClusterAddOn {
            metadata: ObjectMeta {
                name: Some("testaddon".to_string()),
                namespace: Some("testcluster".to_string()),
                annotations: (!annotations.is_empty()).then_some(annotations),
                ..Default::default()
            },
            spec: ManagedClusterAddOnSpec::default(),
            status: None,
        }
    }

    fn cluster() -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("testcluster".to_string()),
                ..Default::default()
            },
            spec: ManagedClusterSpec::default(),
        }
    }

    fn registration_context(client: MockHubClient, bootstrap: Vec<u8>) -> ConfigAnnotationContext {
        ConfigAnnotationContext {
            client: Arc::new(client),
            addon_name: "testaddon".to_string(),
            install_namespace: "ns1".to_string(),
            signer: "kubernetes.io/kube-apiserver-client".to_string(),
            registration_enabled: true,
            registration: Some(Arc::new(FakeAddon { bootstrap })),
        }
    }

    #[tokio::test]
    async fn story_registration_annotations_are_written_once() {
        let mut mock = MockHubClient::new();
        mock.expect_get_addon().returning(|_, _| Ok(Some(addon_with(&[]))));
        mock.expect_get_cluster().returning(|_| Ok(Some(cluster())));
        mock.expect_update_addon()
            .withf(|addon| {
                let a = addon.metadata.annotations.as_ref().unwrap();
                a.get("signer").map(String::as_str) == Some("kubernetes.io/kube-apiserver-client")
                    && a.get("installNamespace").map(String::as_str) == Some("ns1")
                    && a.get("enable_registration").map(String::as_str) == Some("true")
                    && a.get("bootstrapSecret").map(String::as_str)
                        == Some("testaddon-bootstrap-kubeconfig")
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctx = registration_context(mock, b"kubeconfig".to_vec());
        sync(&ctx, "testcluster").await.expect("sync should succeed");
    }

    /// Idempotence: an already-annotated add-on produces no writes.
    #[tokio::test]
    async fn story_converged_annotations_produce_no_writes() {
        let mut mock = MockHubClient::new();
        mock.expect_get_addon().returning(|_, _| {
            Ok(Some(addon_with(&[
                ("signer", "kubernetes.io/kube-apiserver-client"),
                ("installNamespace", "ns1"),
                ("enable_registration", "true"),
                ("bootstrapSecret", "testaddon-bootstrap-kubeconfig"),
            ])))
        });
        mock.expect_get_cluster().returning(|_| Ok(Some(cluster())));

        let ctx = registration_context(mock, b"kubeconfig".to_vec());
        sync(&ctx, "testcluster").await.expect("sync should succeed");
    }

    #[tokio::test]
    async fn registration_disabled_writes_only_the_switch() {
        let mut mock = MockHubClient::new();
        mock.expect_get_addon().returning(|_, _| Ok(Some(addon_with(&[]))));
        mock.expect_get_cluster().returning(|_| Ok(Some(cluster())));
        mock.expect_update_addon()
            .withf(|addon| {
                let a = addon.metadata.annotations.as_ref().unwrap();
                a.get("enable_registration").map(String::as_str) == Some("false")
                    && !a.contains_key("signer")
                    && !a.contains_key("bootstrapSecret")
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctx = ConfigAnnotationContext {
            client: Arc::new(mock),
            addon_name: "testaddon".to_string(),
            install_namespace: "ns1".to_string(),
            signer: String::new(),
            registration_enabled: false,
            registration: None,
        };
        sync(&ctx, "testcluster").await.expect("sync should succeed");
    }

    #[tokio::test]
    async fn empty_bootstrap_kubeconfig_skips_the_secret_reference() {
        let mut mock = MockHubClient::new();
        mock.expect_get_addon().returning(|_, _| Ok(Some(addon_with(&[]))));
        mock.expect_get_cluster().returning(|_| Ok(Some(cluster())));
        mock.expect_update_addon()
            .withf(|addon| {
                let a = addon.metadata.annotations.as_ref().unwrap();
                !a.contains_key("bootstrapSecret")
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctx = registration_context(mock, Vec::new());
        sync(&ctx, "testcluster").await.expect("sync should succeed");
    }

    #[tokio::test]
    async fn missing_addon_is_success() {
        let mut mock = MockHubClient::new();
        mock.expect_get_addon().returning(|_, _| Ok(None));

        let ctx = registration_context(mock, Vec::new());
        sync(&ctx, "testcluster").await.expect("sync should succeed");
    }
}
