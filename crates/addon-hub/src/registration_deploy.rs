//! Registration agent deploy reconciler
//!
//! Runs only when agent registration is enabled. Delivers the bootstrap
//! kubeconfig secret to the spoke in its own envelope and applies the hub
//! RBAC the agent's eventual identity needs: CSR creation and renewal
//! rights bound to the agent group, plus per-cluster role material the
//! add-on supplies. Teardown is symmetric and gated on its own finalizer.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;
use serde_json::json;
use tracing::debug;

use addon_common::agent::AgentAddonRegistration;
use addon_common::crd::{
    ManagedCluster, ManagedClusterAddOn, Manifest, ManifestWork, ManifestWorkSpec,
    ManifestsTemplate,
};
use addon_common::{
    bootstrap_secret_name, identity, registration_work_name, Error, REGISTRATION_FINALIZER,
};

use crate::agent_deploy::apply_work;
use crate::client::HubClient;

/// Context for the registration deploy reconciler
pub struct RegistrationDeployContext {
    pub client: Arc<dyn HubClient>,
    pub addon_name: String,
    pub install_namespace: String,
    pub agent_addon: Arc<dyn AgentAddonRegistration>,
}

/// Name shared by the hub cluster role and binding for one (cluster, add-on)
pub fn hub_rbac_name(cluster_name: &str, addon_name: &str) -> String {
    format!("open-cluster-management:managedcluster:{cluster_name}:addon:{addon_name}")
}

/// Reconcile registration material for the add-on on one cluster
pub async fn sync(ctx: &RegistrationDeployContext, cluster_name: &str) -> Result<(), Error> {
    debug!(addon = %ctx.addon_name, cluster = %cluster_name, "Reconciling registration agent");

    let Some(addon) = ctx.client.get_addon(cluster_name, &ctx.addon_name).await? else {
        return Ok(());
    };
    let Some(cluster) = ctx.client.get_cluster(cluster_name).await? else {
        return Ok(());
    };

    if !addon.is_deleting() && !has_finalizer(&addon) {
        let mut updated = addon;
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(REGISTRATION_FINALIZER.to_string());
        return ctx.client.update_addon(&updated).await;
    }

    if addon.is_deleting() {
        remove_registration_resources(ctx, &cluster).await?;
        return remove_finalizer(ctx, addon).await;
    }

    let kubeconfig = ctx.agent_addon.agent_bootstrap_kubeconfig(&cluster)?;
    if !kubeconfig.is_empty() {
        let work = build_registration_work(ctx, cluster_name, &addon, &kubeconfig);
        apply_work(ctx.client.as_ref(), work).await?;
    }

    let group = identity::agent_group(cluster_name, &ctx.addon_name);
    let (role, binding) = hub_registration_rbac(cluster_name, &ctx.addon_name, &group);
    ctx.client.apply_cluster_role(&role).await?;
    ctx.client.apply_cluster_role_binding(&binding).await?;

    let (role, binding) = ctx.agent_addon.agent_hub_rbac(&cluster, &group);
    if let Some(role) = role {
        ctx.client.apply_role(&role).await?;
    }
    if let Some(binding) = binding {
        ctx.client.apply_role_binding(&binding).await?;
    }
    Ok(())
}

/// The envelope delivering the bootstrap kubeconfig secret to the spoke
fn build_registration_work(
    ctx: &RegistrationDeployContext,
    cluster_name: &str,
    addon: &ManagedClusterAddOn,
    kubeconfig: &[u8],
) -> ManifestWork {
    let secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": bootstrap_secret_name(&ctx.addon_name),
            "namespace": ctx.install_namespace,
        },
        "type": "Opaque",
        "data": {
            "kubeconfig": BASE64.encode(kubeconfig),
        },
    });

    let owner = OwnerReference {
        api_version: "addon.open-cluster-management.io/v1alpha1".to_string(),
        kind: "ManagedClusterAddOn".to_string(),
        name: ctx.addon_name.clone(),
        uid: addon.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        ..Default::default()
    };

    ManifestWork {
        metadata: ObjectMeta {
            name: Some(registration_work_name(&ctx.addon_name)),
            namespace: Some(cluster_name.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: ManifestWorkSpec {
            workload: ManifestsTemplate {
                manifests: vec![Manifest(secret)],
            },
        },
    }
}

/// Cluster role and binding granting the agent group CSR and renewal rights
fn hub_registration_rbac(
    cluster_name: &str,
    addon_name: &str,
    group: &str,
) -> (ClusterRole, ClusterRoleBinding) {
    let name = hub_rbac_name(cluster_name, addon_name);
    let role = ClusterRole {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["certificates.k8s.io".to_string()]),
                resources: Some(vec!["certificatesigningrequests".to_string()]),
                verbs: vec![
                    "create".to_string(),
                    "get".to_string(),
                    "list".to_string(),
                    "watch".to_string(),
                ],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["register.open-cluster-management.io".to_string()]),
                resources: Some(vec![format!("{addon_name}/clientcertificates")]),
                verbs: vec!["renew".to_string()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    };
    let binding = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name,
        },
        subjects: Some(vec![Subject {
            api_group: Some("rbac.authorization.k8s.io".to_string()),
            kind: "Group".to_string(),
            name: group.to_string(),
            ..Default::default()
        }]),
    };
    (role, binding)
}

async fn remove_registration_resources(
    ctx: &RegistrationDeployContext,
    cluster: &ManagedCluster,
) -> Result<(), Error> {
    let cluster_name = cluster.metadata.name.clone().unwrap_or_default();
    let rbac_name = hub_rbac_name(&cluster_name, &ctx.addon_name);
    ctx.client.delete_cluster_role(&rbac_name).await?;
    ctx.client.delete_cluster_role_binding(&rbac_name).await?;
    ctx.client
        .delete_config_map(&cluster_name, &ctx.addon_name)
        .await?;

    let group = identity::agent_group(&cluster_name, &ctx.addon_name);
    let (role, binding) = ctx.agent_addon.agent_hub_rbac(cluster, &group);
    if let Some(role) = role {
        let namespace = role.metadata.namespace.clone().unwrap_or_default();
        let name = role.metadata.name.clone().unwrap_or_default();
        ctx.client.delete_role(&namespace, &name).await?;
    }
    if let Some(binding) = binding {
        let namespace = binding.metadata.namespace.clone().unwrap_or_default();
        let name = binding.metadata.name.clone().unwrap_or_default();
        ctx.client.delete_role_binding(&namespace, &name).await?;
    }
    Ok(())
}

async fn remove_finalizer(
    ctx: &RegistrationDeployContext,
    addon: ManagedClusterAddOn,
) -> Result<(), Error> {
    let Some(finalizers) = &addon.metadata.finalizers else {
        return Ok(());
    };
    let kept: Vec<String> = finalizers
        .iter()
        .filter(|f| f.as_str() != REGISTRATION_FINALIZER)
        .cloned()
        .collect();
    if kept.len() == finalizers.len() {
        return Ok(());
    }

    let mut updated = addon;
    updated.metadata.finalizers = (!kept.is_empty()).then_some(kept);
    ctx.client.update_addon(&updated).await
}

fn has_finalizer(addon: &ManagedClusterAddOn) -> bool {
    addon
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == REGISTRATION_FINALIZER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockHubClient;
    use addon_common::agent::AgentAddon;
    use addon_common::crd::{ManagedClusterAddOnSpec, ManagedClusterSpec};
    use chrono::Utc;
    use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::DynamicObject;

    struct FakeAddon {
        bootstrap: Vec<u8>,
        rbac: bool,
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
            cluster: &ManagedCluster,
            _group: &str,
        ) -> (Option<Role>, Option<RoleBinding>) {
            if !self.rbac {
                return (None, None);
            }
            let namespace = cluster.metadata.name.clone();
            let role = Role {
                metadata: ObjectMeta {
                    name: Some("testaddon-agent".to_string()),
                    namespace: namespace.clone(),
                    ..Default::default()
                },
                rules: None,
            };
            let binding = RoleBinding {
                metadata: ObjectMeta {
                    name: Some("testaddon-agent".to_string()),
                    namespace,
                    ..Default::default()
                },
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: "Role".to_string(),
                    name: "testaddon-agent".to_string(),
                },
                subjects: None,
            };
            (Some(role), Some(binding))
        }

        fn agent_bootstrap_kubeconfig(&self, _cluster: &ManagedCluster) -> Result<Vec<u8>, Error> {
            Ok(self.bootstrap.clone())
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

    fn addon(finalizers: Vec<String>, deleting: bool) -> ManagedClusterAddOn {
        ManagedClusterAddOn {
            metadata: ObjectMeta {
                name: Some("testaddon".to_string()),
                namespace: Some("testcluster".to_string()),
                finalizers: (!finalizers.is_empty()).then_some(finalizers),
                deletion_timestamp: deleting.then(|| Time(Utc::now())),
                ..Default::default()
            },
            spec: ManagedClusterAddOnSpec::default(),
            status: None,
        }
    }

    fn context(mock: MockHubClient, bootstrap: Vec<u8>, rbac: bool) -> RegistrationDeployContext {
        RegistrationDeployContext {
            client: Arc::new(mock),
            addon_name: "testaddon".to_string(),
            install_namespace: "ns1".to_string(),
            agent_addon: Arc::new(FakeAddon { bootstrap, rbac }),
        }
    }

    #[tokio::test]
    async fn story_first_pass_adds_the_registration_finalizer() {
        let mut mock = MockHubClient::new();
        mock.expect_get_addon()
            .returning(|_, _| Ok(Some(addon(Vec::new(), false))));
        mock.expect_get_cluster().returning(|_| Ok(Some(cluster())));
        mock.expect_update_addon()
            .withf(|addon| {
                addon
                    .metadata
                    .finalizers
                    .as_ref()
                    .is_some_and(|f| f.iter().any(|x| x == REGISTRATION_FINALIZER))
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctx = context(mock, b"kubeconfig".to_vec(), true);
        sync(&ctx, "testcluster").await.expect("sync should succeed");
    }

    /// Story: a registering add-on gets its bootstrap secret envelope and
    /// the hub RBAC for the agent group.
    #[tokio::test]
    async fn story_bootstrap_envelope_and_rbac_are_applied() {
        let mut mock = MockHubClient::new();
        mock.expect_get_addon()
            .returning(|_, _| Ok(Some(addon(vec![REGISTRATION_FINALIZER.to_string()], false))));
        mock.expect_get_cluster().returning(|_| Ok(Some(cluster())));
        mock.expect_get_work().returning(|_, _| Ok(None));
        mock.expect_create_work()
            .withf(|work| {
                let manifest = &work.spec.workload.manifests[0].0;
                work.metadata.name.as_deref() == Some("addon-testaddon-registration-agent")
                    && manifest["kind"] == "Secret"
                    && manifest["metadata"]["name"] == "testaddon-bootstrap-kubeconfig"
                    && manifest["metadata"]["namespace"] == "ns1"
                    && manifest["data"]["kubeconfig"] == BASE64.encode(b"kubeconfig")
            })
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_apply_cluster_role()
            .withf(|role| {
                role.metadata.name.as_deref()
                    == Some("open-cluster-management:managedcluster:testcluster:addon:testaddon")
            })
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_apply_cluster_role_binding()
            .withf(|binding| {
                binding.subjects.as_ref().is_some_and(|s| {
                    s[0].name
                        == "system:open-cluster-management:cluster:testcluster:addon:testaddon"
                })
            })
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_apply_role().times(1).returning(|_| Ok(()));
        mock.expect_apply_role_binding().times(1).returning(|_| Ok(()));

        let ctx = context(mock, b"kubeconfig".to_vec(), true);
        sync(&ctx, "testcluster").await.expect("sync should succeed");
    }

    /// An add-on without bootstrap credentials still gets the hub RBAC but
    /// no envelope.
    #[tokio::test]
    async fn empty_bootstrap_kubeconfig_skips_the_envelope() {
        let mut mock = MockHubClient::new();
        mock.expect_get_addon()
            .returning(|_, _| Ok(Some(addon(vec![REGISTRATION_FINALIZER.to_string()], false))));
        mock.expect_get_cluster().returning(|_| Ok(Some(cluster())));
        mock.expect_apply_cluster_role().returning(|_| Ok(()));
        mock.expect_apply_cluster_role_binding().returning(|_| Ok(()));

        let ctx = context(mock, Vec::new(), false);
        sync(&ctx, "testcluster").await.expect("sync should succeed");
    }

    /// Story: teardown removes the hub RBAC, config map and supplier role
    /// material, then releases the finalizer.
    #[tokio::test]
    async fn story_teardown_removes_rbac_and_releases_finalizer() {
        let mut mock = MockHubClient::new();
        mock.expect_get_addon()
            .returning(|_, _| Ok(Some(addon(vec![REGISTRATION_FINALIZER.to_string()], true))));
        mock.expect_get_cluster().returning(|_| Ok(Some(cluster())));
        mock.expect_delete_cluster_role()
            .withf(|name| name == "open-cluster-management:managedcluster:testcluster:addon:testaddon")
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_delete_cluster_role_binding()
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_delete_config_map()
            .withf(|ns, name| ns == "testcluster" && name == "testaddon")
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_delete_role()
            .withf(|ns, name| ns == "testcluster" && name == "testaddon-agent")
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_delete_role_binding()
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_update_addon()
            .withf(|addon| addon.metadata.finalizers.is_none())
            .times(1)
            .returning(|_| Ok(()));

        let ctx = context(mock, b"kubeconfig".to_vec(), true);
        sync(&ctx, "testcluster").await.expect("sync should succeed");
    }
}
