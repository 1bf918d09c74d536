//! Hub-side storage access
//!
//! All hub reconcilers talk to the cluster through the [`HubClient`] trait so
//! tests can mock storage while production uses the real client. The
//! implementation treats a 404 on read as `None` and a 404 on delete as done,
//! matching how watch-lagged caches behave.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::{Client, Resource, ResourceExt};

#[cfg(test)]
use mockall::automock;

use addon_common::crd::{
    ClusterManagementAddOn, Condition, ManagedCluster, ManagedClusterAddOn, ManifestWork,
};
use addon_common::{status, Error, ADDON_WORK_LABEL};

/// Field manager used for server-side apply writes from the hub
pub const FIELD_MANAGER: &str = "addon-manager";

/// Storage operations the hub reconcilers need
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HubClient: Send + Sync {
    /// List every managed cluster known to the hub
    async fn list_clusters(&self) -> Result<Vec<ManagedCluster>, Error>;

    /// Get a managed cluster by name
    async fn get_cluster(&self, name: &str) -> Result<Option<ManagedCluster>, Error>;

    /// Replace a managed cluster (finalizer updates)
    async fn update_cluster(&self, cluster: &ManagedCluster) -> Result<(), Error>;

    /// Get an add-on in a cluster namespace
    async fn get_addon(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<ManagedClusterAddOn>, Error>;

    /// List all add-ons in a cluster namespace
    async fn list_addons(&self, cluster: &str) -> Result<Vec<ManagedClusterAddOn>, Error>;

    /// Replace an add-on (finalizer and annotation updates)
    async fn update_addon(&self, addon: &ManagedClusterAddOn) -> Result<(), Error>;

    /// Merge a condition into an add-on's status with conflict retries.
    /// Returns whether a write happened.
    async fn update_addon_condition(
        &self,
        cluster: &str,
        addon_name: &str,
        condition: Condition,
    ) -> Result<bool, Error>;

    /// Get the per-add-on registration singleton
    async fn get_cluster_management(
        &self,
        name: &str,
    ) -> Result<Option<ClusterManagementAddOn>, Error>;

    /// Create the per-add-on registration singleton
    async fn create_cluster_management(&self, addon: &ClusterManagementAddOn)
        -> Result<(), Error>;

    /// Read the add-on's configuration custom resource, if a configuration
    /// resource type was registered with the manager
    async fn get_addon_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// List delivery envelopes labelled for an add-on in a cluster namespace
    async fn list_addon_works(
        &self,
        namespace: &str,
        addon_name: &str,
    ) -> Result<Vec<ManifestWork>, Error>;

    /// Get a delivery envelope
    async fn get_work(&self, namespace: &str, name: &str) -> Result<Option<ManifestWork>, Error>;

    /// Create a delivery envelope
    async fn create_work(&self, work: &ManifestWork) -> Result<(), Error>;

    /// Replace a delivery envelope (payload updates carry the resource version)
    async fn update_work(&self, work: &ManifestWork) -> Result<(), Error>;

    /// Delete a delivery envelope; absence counts as deleted
    async fn delete_work(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Ensure a namespace exists
    async fn apply_namespace(&self, name: &str) -> Result<(), Error>;

    /// Server-side apply a cluster role
    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<(), Error>;

    /// Server-side apply a cluster role binding
    async fn apply_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<(), Error>;

    /// Server-side apply a namespaced role
    async fn apply_role(&self, role: &Role) -> Result<(), Error>;

    /// Server-side apply a namespaced role binding
    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), Error>;

    /// Delete a cluster role; absence counts as deleted
    async fn delete_cluster_role(&self, name: &str) -> Result<(), Error>;

    /// Delete a cluster role binding; absence counts as deleted
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error>;

    /// Delete a namespaced role; absence counts as deleted
    async fn delete_role(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete a namespaced role binding; absence counts as deleted
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete a config map; absence counts as deleted
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a certificate signing request from authoritative storage
    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error>;

    /// Commit an approval condition set through the approval subresource
    async fn approve_csr(
        &self,
        name: &str,
        conditions: Vec<CertificateSigningRequestCondition>,
    ) -> Result<(), Error>;

    /// Run a subject access review; returns whether the action is allowed
    async fn subject_access_review(&self, review: SubjectAccessReview) -> Result<bool, Error>;

    /// Get a lease in a namespace
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, Error>;

    /// Create a lease
    async fn create_lease(&self, lease: &Lease) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct HubClientImpl {
    client: Client,
    config_resource: Option<ApiResource>,
}

impl HubClientImpl {
    /// Create a hub client. `config_resource` addresses the add-on's
    /// configuration custom resource type, when the add-on has one.
    pub fn new(client: Client, config_resource: Option<ApiResource>) -> Self {
        Self {
            client,
            config_resource,
        }
    }

    fn works(&self, namespace: &str) -> Api<ManifestWork> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn addons(&self, namespace: &str) -> Api<ManagedClusterAddOn> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Delete helper that treats 404 as success
async fn delete_ignore_missing<K>(api: Api<K>, name: &str) -> Result<(), Error>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Server-side apply helper
async fn apply<K>(api: Api<K>, obj: &K) -> Result<(), Error>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let name = obj.meta().name.clone().ok_or_else(|| {
        Error::internal("hub-client", "cannot apply an object without a name")
    })?;
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(obj),
    )
    .await?;
    Ok(())
}

#[async_trait]
impl HubClient for HubClientImpl {
    async fn list_clusters(&self) -> Result<Vec<ManagedCluster>, Error> {
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<ManagedCluster>, Error> {
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update_cluster(&self, cluster: &ManagedCluster) -> Result<(), Error> {
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        api.replace(&cluster.name_any(), &PostParams::default(), cluster)
            .await?;
        Ok(())
    }

    async fn get_addon(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<ManagedClusterAddOn>, Error> {
        Ok(self.addons(cluster).get_opt(name).await?)
    }

    async fn list_addons(&self, cluster: &str) -> Result<Vec<ManagedClusterAddOn>, Error> {
        Ok(self.addons(cluster).list(&ListParams::default()).await?.items)
    }

    async fn update_addon(&self, addon: &ManagedClusterAddOn) -> Result<(), Error> {
        let namespace = addon.namespace().ok_or_else(|| {
            Error::internal("hub-client", "add-on without a namespace")
        })?;
        self.addons(&namespace)
            .replace(&addon.name_any(), &PostParams::default(), addon)
            .await?;
        Ok(())
    }

    async fn update_addon_condition(
        &self,
        cluster: &str,
        addon_name: &str,
        condition: Condition,
    ) -> Result<bool, Error> {
        status::update_addon_condition(&self.addons(cluster), addon_name, condition).await
    }

    async fn get_cluster_management(
        &self,
        name: &str,
    ) -> Result<Option<ClusterManagementAddOn>, Error> {
        let api: Api<ClusterManagementAddOn> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_cluster_management(
        &self,
        addon: &ClusterManagementAddOn,
    ) -> Result<(), Error> {
        let api: Api<ClusterManagementAddOn> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), addon).await {
            Ok(_) => Ok(()),
            // a concurrent reconcile won the race; the singleton exists
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_addon_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let Some(resource) = &self.config_resource else {
            return Ok(None);
        };
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        Ok(api.get_opt(name).await?)
    }

    async fn list_addon_works(
        &self,
        namespace: &str,
        addon_name: &str,
    ) -> Result<Vec<ManifestWork>, Error> {
        let params = ListParams::default().labels(&format!("{ADDON_WORK_LABEL}={addon_name}"));
        Ok(self.works(namespace).list(&params).await?.items)
    }

    async fn get_work(&self, namespace: &str, name: &str) -> Result<Option<ManifestWork>, Error> {
        Ok(self.works(namespace).get_opt(name).await?)
    }

    async fn create_work(&self, work: &ManifestWork) -> Result<(), Error> {
        let namespace = work.namespace().ok_or_else(|| {
            Error::internal("hub-client", "envelope without a namespace")
        })?;
        self.works(&namespace)
            .create(&PostParams::default(), work)
            .await?;
        Ok(())
    }

    async fn update_work(&self, work: &ManifestWork) -> Result<(), Error> {
        let namespace = work.namespace().ok_or_else(|| {
            Error::internal("hub-client", "envelope without a namespace")
        })?;
        self.works(&namespace)
            .replace(&work.name_any(), &PostParams::default(), work)
            .await?;
        Ok(())
    }

    async fn delete_work(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_ignore_missing(self.works(namespace), name).await
    }

    async fn apply_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        apply(api, &ns).await
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<(), Error> {
        apply(Api::all(self.client.clone()), role).await
    }

    async fn apply_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<(), Error> {
        apply(Api::all(self.client.clone()), binding).await
    }

    async fn apply_role(&self, role: &Role) -> Result<(), Error> {
        let namespace = role.namespace().ok_or_else(|| {
            Error::internal("hub-client", "role without a namespace")
        })?;
        apply(Api::namespaced(self.client.clone(), &namespace), role).await
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), Error> {
        let namespace = binding.namespace().ok_or_else(|| {
            Error::internal("hub-client", "role binding without a namespace")
        })?;
        apply(Api::namespaced(self.client.clone(), &namespace), binding).await
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<(), Error> {
        delete_ignore_missing(Api::<ClusterRole>::all(self.client.clone()), name).await
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        delete_ignore_missing(Api::<ClusterRoleBinding>::all(self.client.clone()), name).await
    }

    async fn delete_role(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_ignore_missing(
            Api::<Role>::namespaced(self.client.clone(), namespace),
            name,
        )
        .await
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_ignore_missing(
            Api::<RoleBinding>::namespaced(self.client.clone(), namespace),
            name,
        )
        .await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_ignore_missing(
            Api::<k8s_openapi::api::core::v1::ConfigMap>::namespaced(
                self.client.clone(),
                namespace,
            ),
            name,
        )
        .await
    }

    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn approve_csr(
        &self,
        name: &str,
        conditions: Vec<CertificateSigningRequestCondition>,
    ) -> Result<(), Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "apiVersion": "certificates.k8s.io/v1",
            "kind": "CertificateSigningRequest",
            "metadata": { "name": name },
            "status": { "conditions": conditions },
        });
        api.patch_approval(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn subject_access_review(&self, review: SubjectAccessReview) -> Result<bool, Error> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let created = api.create(&PostParams::default(), &review).await?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_lease(&self, lease: &Lease) -> Result<(), Error> {
        let namespace = lease.namespace().ok_or_else(|| {
            Error::internal("hub-client", "lease without a namespace")
        })?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), lease).await?;
        Ok(())
    }
}

/// Build the subject access review that authorizes a CSR renewal.
///
/// The review impersonates the CSR's reported identity and asks for verb
/// `renew` on `<addon>/clientcertificates` in the registration API group.
pub fn renewal_access_review(
    addon_name: &str,
    csr: &CertificateSigningRequest,
) -> SubjectAccessReview {
    let extra: Option<BTreeMap<String, Vec<String>>> = csr.spec.extra.clone();
    SubjectAccessReview {
        metadata: Default::default(),
        spec: SubjectAccessReviewSpec {
            user: csr.spec.username.clone(),
            uid: csr.spec.uid.clone(),
            groups: csr.spec.groups.clone(),
            extra,
            resource_attributes: Some(ResourceAttributes {
                group: Some("register.open-cluster-management.io".to_string()),
                resource: Some(addon_name.to_string()),
                verb: Some("renew".to_string()),
                subresource: Some("clientcertificates".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        status: None,
    }
}
