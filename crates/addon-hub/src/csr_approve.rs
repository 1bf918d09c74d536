//! CSR auto-approval
//!
//! Watches certificate signing requests named for the add-on and approves
//! two classes of request: brand-new requests that pass every add-on
//! supplied check, and renewals whose subject matches the agent identity
//! conventions and whose requester passes a subject access review. A CSR
//! already in a terminal state is never touched again.

use std::sync::Arc;

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use kube::ResourceExt;
use tracing::debug;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

use addon_common::agent::CsrApproveCheck;
use addon_common::{identity, Error, CLUSTER_NAME_LABEL};

use crate::client::{renewal_access_review, HubClient};

/// Reason recorded on the Approved condition
pub const APPROVE_REASON: &str = "AutoApprovedByHubCSRApprovingController";

/// Context for the CSR approver
pub struct CsrApproveContext {
    pub client: Arc<dyn HubClient>,
    pub addon_name: String,
    /// Signer the renewal chain requires (unless the CSR predates signers)
    pub signer: String,
    /// Add-on supplied checks for brand-new CSRs; an empty chain approves
    /// nothing on the new-request path
    pub checks: Vec<CsrApproveCheck>,
}

/// Reconcile one certificate signing request by name
pub async fn sync(ctx: &CsrApproveContext, csr_name: &str) -> Result<(), Error> {
    debug!(csr = %csr_name, "Reconciling certificate signing request");

    let Some(csr) = ctx.client.get_csr(csr_name).await? else {
        return Ok(());
    };
    if !csr
        .name_any()
        .starts_with(&identity::csr_name_prefix(&ctx.addon_name))
    {
        return Ok(());
    }
    if is_terminal(&csr) {
        return Ok(());
    }

    let approved = !ctx.checks.is_empty() && ctx.checks.iter().all(|check| check(&csr));
    let renewal = is_agent_cert_renewal(&csr, &ctx.addon_name, &ctx.signer);

    if !approved && !renewal {
        debug!(csr = %csr_name, "CSR matched neither approval chain");
        return Ok(());
    }

    if renewal {
        let review = renewal_access_review(&ctx.addon_name, &csr);
        if !ctx.client.subject_access_review(review).await? {
            debug!(csr = %csr_name, "Renewal declined by subject access review");
            return Ok(());
        }
    }

    let mut conditions = csr
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    conditions.push(CertificateSigningRequestCondition {
        type_: "Approved".to_string(),
        status: "True".to_string(),
        reason: Some(APPROVE_REASON.to_string()),
        message: Some("Auto approving addon agent certificate after SubjectAccessReview.".to_string()),
        ..Default::default()
    });
    ctx.client.approve_csr(csr_name, conditions).await
}

/// Whether the CSR already carries an Approved or Denied condition
pub fn is_terminal(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
        })
}

/// The renewal predicate chain.
///
/// A renewal must carry the cluster-name label, request the configured
/// signer (CSRs from servers predating signer names may omit it), contain a
/// well-formed certificate request whose sole Organization is the agent
/// group, whose CommonName extends that group, and whose requesting
/// username equals the CommonName.
pub fn is_agent_cert_renewal(
    csr: &CertificateSigningRequest,
    addon_name: &str,
    signer: &str,
) -> bool {
    let Some(cluster_name) = csr.labels().get(CLUSTER_NAME_LABEL) else {
        return false;
    };

    if !csr.spec.signer_name.is_empty() && csr.spec.signer_name != signer {
        return false;
    }

    let Ok(block) = pem::parse(&csr.spec.request.0) else {
        debug!(csr = %csr.name_any(), "CSR request is not valid PEM");
        return false;
    };
    if block.tag() != "CERTIFICATE REQUEST" {
        return false;
    }
    let Ok((_, request)) = X509CertificationRequest::from_der(block.contents()) else {
        debug!(csr = %csr.name_any(), "CSR request is not a parsable certificate request");
        return false;
    };

    let subject = &request.certification_request_info.subject;
    let organizations: Vec<&str> = subject
        .iter_organization()
        .filter_map(|attr| attr.as_str().ok())
        .collect();
    if organizations.len() != 1 {
        return false;
    }
    let organization = organizations[0];
    if organization != identity::agent_group(cluster_name, addon_name) {
        return false;
    }

    let Some(common_name) = subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
    else {
        return false;
    };
    if !common_name.starts_with(organization) {
        return false;
    }

    csr.spec.username.as_deref() == Some(common_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockHubClient;
    use k8s_openapi::api::certificates::v1::{
        CertificateSigningRequestSpec, CertificateSigningRequestStatus,
    };
    use k8s_openapi::ByteString;
    use kube::core::ObjectMeta;
    use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
    use std::collections::BTreeMap;

    const GROUP: &str = "system:open-cluster-management:cluster:testcluster:addon:testaddon";
    const SIGNER: &str = "kubernetes.io/kube-apiserver-client";

    fn request_pem(common_name: &str, organizations: &[&str]) -> Vec<u8> {
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        for org in organizations {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
        }
        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        let key = KeyPair::generate().expect("generate key");
        let csr = params.serialize_request(&key).expect("serialize request");
        csr.pem().expect("encode request").into_bytes()
    }

    struct CsrSetup<'a> {
        name: &'a str,
        cluster_label: Option<&'a str>,
        signer: &'a str,
        cn: &'a str,
        orgs: &'a [&'a str],
        username: Option<&'a str>,
        conditions: Vec<&'a str>,
    }

    fn csr(setup: CsrSetup<'_>) -> CertificateSigningRequest {
        let labels: BTreeMap<String, String> = setup
            .cluster_label
            .map(|v| [(CLUSTER_NAME_LABEL.to_string(), v.to_string())].into())
            .unwrap_or_default();
        let conditions: Vec<CertificateSigningRequestCondition> = setup
            .conditions
            .iter()
            .map(|t| CertificateSigningRequestCondition {
                type_: t.to_string(),
                status: "True".to_string(),
                ..Default::default()
            })
            .collect();
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(setup.name.to_string()),
                labels: (!labels.is_empty()).then_some(labels),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request_pem(setup.cn, setup.orgs)),
                signer_name: setup.signer.to_string(),
                username: setup.username.map(String::from),
                ..Default::default()
            },
            status: (!conditions.is_empty()).then_some(CertificateSigningRequestStatus {
                conditions: Some(conditions),
                ..Default::default()
            }),
        }
    }

    fn renewal_csr(name: &str) -> CertificateSigningRequest {
        let cn = format!("{GROUP}:agent:ab1cd");
        csr(CsrSetup {
            name,
            cluster_label: Some("testcluster"),
            signer: SIGNER,
            cn: &cn,
            orgs: &[GROUP],
            username: Some(&cn),
            conditions: Vec::new(),
        })
    }

    fn context(mock: MockHubClient, checks: Vec<CsrApproveCheck>) -> CsrApproveContext {
        CsrApproveContext {
            client: Arc::new(mock),
            addon_name: "testaddon".to_string(),
            signer: SIGNER.to_string(),
            checks,
        }
    }

    mod renewal_predicates {
        use super::*;

        #[test]
        fn a_well_formed_renewal_passes() {
            assert!(is_agent_cert_renewal(
                &renewal_csr("addon-testaddon-testcluster-x"),
                "testaddon",
                SIGNER
            ));
        }

        #[test]
        fn missing_cluster_label_fails() {
            let mut csr = renewal_csr("addon-testaddon-testcluster-x");
            csr.metadata.labels = None;
            assert!(!is_agent_cert_renewal(&csr, "testaddon", SIGNER));
        }

        #[test]
        fn wrong_signer_fails_but_absent_signer_passes() {
            let mut csr = renewal_csr("addon-testaddon-testcluster-x");
            csr.spec.signer_name = "example.com/other".to_string();
            assert!(!is_agent_cert_renewal(&csr, "testaddon", SIGNER));

            // servers predating signer names send none at all
            let mut csr = renewal_csr("addon-testaddon-testcluster-x");
            csr.spec.signer_name = String::new();
            assert!(is_agent_cert_renewal(&csr, "testaddon", SIGNER));
        }

        #[test]
        fn malformed_pem_silently_fails() {
            let mut csr = renewal_csr("addon-testaddon-testcluster-x");
            csr.spec.request = ByteString(b"not a pem block".to_vec());
            assert!(!is_agent_cert_renewal(&csr, "testaddon", SIGNER));
        }

        #[test]
        fn wrong_organization_fails() {
            let cn = format!("{GROUP}:agent:ab1cd");
            let csr = csr(CsrSetup {
                name: "addon-testaddon-testcluster-x",
                cluster_label: Some("testcluster"),
                signer: SIGNER,
                cn: &cn,
                orgs: &["system:open-cluster-management:cluster:other:addon:testaddon"],
                username: Some(&cn),
                conditions: Vec::new(),
            });
            assert!(!is_agent_cert_renewal(&csr, "testaddon", SIGNER));
        }

        #[test]
        fn multiple_organizations_fail() {
            let cn = format!("{GROUP}:agent:ab1cd");
            let csr = csr(CsrSetup {
                name: "addon-testaddon-testcluster-x",
                cluster_label: Some("testcluster"),
                signer: SIGNER,
                cn: &cn,
                orgs: &[GROUP, "system:authenticated"],
                username: Some(&cn),
                conditions: Vec::new(),
            });
            assert!(!is_agent_cert_renewal(&csr, "testaddon", SIGNER));
        }

        #[test]
        fn username_mismatch_fails() {
            let cn = format!("{GROUP}:agent:ab1cd");
            let csr = csr(CsrSetup {
                name: "addon-testaddon-testcluster-x",
                cluster_label: Some("testcluster"),
                signer: SIGNER,
                cn: &cn,
                orgs: &[GROUP],
                username: Some("someone-else"),
                conditions: Vec::new(),
            });
            assert!(!is_agent_cert_renewal(&csr, "testaddon", SIGNER));
        }
    }

    /// Story: a renewal that passes the chain and the access review gets an
    /// Approved condition appended through the approval subresource.
    #[tokio::test]
    async fn story_authorized_renewal_is_approved() {
        let mut mock = MockHubClient::new();
        mock.expect_get_csr()
            .returning(|name| Ok(Some(renewal_csr(name))));
        mock.expect_subject_access_review()
            .times(1)
            .returning(|_| Ok(true));
        mock.expect_approve_csr()
            .withf(|_, conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Approved" && c.reason.as_deref() == Some(APPROVE_REASON))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = context(mock, Vec::new());
        sync(&ctx, "addon-testaddon-testcluster-x")
            .await
            .expect("sync should succeed");
    }

    /// Story: a denied access review silently declines without a write.
    #[tokio::test]
    async fn story_unauthorized_renewal_is_declined_silently() {
        let mut mock = MockHubClient::new();
        mock.expect_get_csr()
            .returning(|name| Ok(Some(renewal_csr(name))));
        mock.expect_subject_access_review().returning(|_| Ok(false));

        let ctx = context(mock, Vec::new());
        sync(&ctx, "addon-testaddon-testcluster-x")
            .await
            .expect("sync should succeed");
    }

    /// Monotonic terminal state: an approved CSR sees no further writes.
    #[tokio::test]
    async fn story_terminal_csrs_are_never_touched() {
        for terminal in ["Approved", "Denied"] {
            let mut mock = MockHubClient::new();
            mock.expect_get_csr().returning(move |name| {
                let cn = format!("{GROUP}:agent:ab1cd");
                Ok(Some(csr(CsrSetup {
                    name,
                    cluster_label: Some("testcluster"),
                    signer: SIGNER,
                    cn: &cn,
                    orgs: &[GROUP],
                    username: Some(&cn),
                    conditions: vec![terminal],
                })))
            });

            let ctx = context(mock, Vec::new());
            sync(&ctx, "addon-testaddon-testcluster-x")
                .await
                .expect("sync should succeed");
        }
    }

    /// Story: a brand-new CSR passes when every supplied check accepts it;
    /// no access review is involved on that path.
    #[tokio::test]
    async fn story_new_csr_approved_by_supplied_checks() {
        let mut mock = MockHubClient::new();
        mock.expect_get_csr().returning(|name| {
            // bootstrap request: username is the anonymous bootstrap user,
            // so the renewal chain cannot match
            let cn = format!("{GROUP}:agent:ab1cd");
            Ok(Some(csr(CsrSetup {
                name,
                cluster_label: Some("testcluster"),
                signer: SIGNER,
                cn: &cn,
                orgs: &[GROUP],
                username: Some("system:anonymous"),
                conditions: Vec::new(),
            })))
        });
        mock.expect_approve_csr().times(1).returning(|_, _| Ok(()));

        let check: CsrApproveCheck = Arc::new(|_| true);
        let ctx = context(mock, vec![check]);
        sync(&ctx, "addon-testaddon-testcluster-x")
            .await
            .expect("sync should succeed");
    }

    /// With no supplied checks the new-request path never approves.
    #[tokio::test]
    async fn empty_check_chain_approves_nothing_new() {
        let mut mock = MockHubClient::new();
        mock.expect_get_csr().returning(|name| {
            let cn = format!("{GROUP}:agent:ab1cd");
            Ok(Some(csr(CsrSetup {
                name,
                cluster_label: Some("testcluster"),
                signer: SIGNER,
                cn: &cn,
                orgs: &[GROUP],
                username: Some("system:anonymous"),
                conditions: Vec::new(),
            })))
        });

        let ctx = context(mock, Vec::new());
        sync(&ctx, "addon-testaddon-testcluster-x")
            .await
            .expect("sync should succeed");
    }

    /// CSRs named for other add-ons are out of scope.
    #[tokio::test]
    async fn foreign_csr_names_are_ignored() {
        let mut mock = MockHubClient::new();
        mock.expect_get_csr()
            .returning(|name| Ok(Some(renewal_csr(name))));

        let ctx = context(mock, Vec::new());
        sync(&ctx, "addon-otheraddon-testcluster-x")
            .await
            .expect("sync should succeed");
    }
}
