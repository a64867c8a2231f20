//! Session reconciliation engine
//!
//! The controller watches Sessions and their credential secrets on the local
//! cluster and re-runs the step chain ([`steps`]) on every change. Remote
//! changes (CSRs, approvals, HostedControlPlanes on management clusters)
//! arrive through a wake stream fed by the [`crate::mc`] watchers.
//!
//! A pass applies at most one mutating action ([`actions::Actions`]); all
//! writes are server-side applies under a single field manager, so repeated
//! applies of the same content are no-ops on the API server.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::{CertificateSigningRequestApproval, Session};
use crate::endpoints::EndpointProvider;
use crate::events::EventPublisher;
use crate::mc::{ManagementClusterProvider, ProviderRegistry, RegistrarHandle};
use crate::{managed_by_selector, Error, Result, FIELD_MANAGER};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

pub mod actions;
pub mod resources;
pub mod status;
pub mod steps;

use actions::Actions;

/// Requeue delay while a management cluster provider is being registered.
const PROVIDER_PENDING_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue delay applied by the error policy.
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Reads secrets in the session namespace.
///
/// Behind a trait so the step chain can be driven entirely by mocks in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Fetch a secret; `Ok(None)` when it does not exist.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// [`SecretReader`] backed by the local cluster client.
pub struct KubeSecretReader {
    client: Client,
}

impl KubeSecretReader {
    /// Create a reader over the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(Error::from)
    }
}

/// Shared state for the session controller.
pub struct Context {
    /// Client for the local cluster
    pub client: Client,
    /// Registry of connected management clusters
    pub registry: Arc<ProviderRegistry>,
    /// Channel to the registrar task for connecting new management clusters
    pub registrar: RegistrarHandle,
    /// Reader for credential secrets
    pub secrets: Arc<dyn SecretReader>,
    /// Endpoint derivation
    pub endpoints: Arc<dyn EndpointProvider>,
    /// Event publishing
    pub events: Arc<dyn EventPublisher>,
}

/// Reconcile one Session.
pub async fn reconcile(
    session: Arc<Session>,
    ctx: Arc<Context>,
) -> std::result::Result<Action, Error> {
    let now = Utc::now();
    let namespace = session.namespace().unwrap_or_default();
    let name = session.name_any();
    let phase = session.phase(now);
    info!(session = %format!("{namespace}/{name}"), %phase, "reconciling session");

    let mc_id = &session.spec.management_cluster.resource_id;
    let Some(provider) = ctx.registry.get(mc_id) else {
        // Not connected yet. Ask the registrar to bring the cluster up and
        // come back; the registrar also re-wakes referencing sessions once
        // registration completes.
        debug!(management_cluster = %mc_id, "management cluster not registered, requesting registration");
        ctx.registrar.request_sync(mc_id);
        return Ok(Action::requeue(PROVIDER_PENDING_REQUEUE));
    };

    let input = steps::StepInput {
        session: &session,
        now,
        querier: provider.querier(),
        secrets: ctx.secrets.as_ref(),
        endpoints: ctx.endpoints.as_ref(),
    };
    let actions = steps::process_session(&input).await?;
    apply_actions(&session, &actions, &ctx, &provider).await?;

    if let Some(event) = &actions.event {
        ctx.events
            .publish(
                &session.object_ref(&()),
                EventType::Normal,
                event.reason,
                event.action,
                Some(event.note.clone()),
            )
            .await;
    }

    // Proactive requeue at the expiration instant so teardown never depends
    // on an external watch event arriving.
    match session.expiry().and_then(|e| (e - now).to_std().ok()) {
        Some(until_expiry) => Ok(Action::requeue(until_expiry)),
        None => Ok(Action::await_change()),
    }
}

/// Apply the single action produced by a pass.
async fn apply_actions(
    session: &Session,
    actions: &Actions,
    ctx: &Context,
    provider: &ManagementClusterProvider,
) -> Result<()> {
    actions.validate();

    let namespace = session.namespace().unwrap_or_default();
    let session_name = session.name_any();
    let credential_name = session.credential_name();
    let params = PatchParams::apply(FIELD_MANAGER).force();

    if let Some(status) = &actions.status {
        let api: Api<Session> = Api::namespaced(ctx.client.clone(), &namespace);
        let patch = serde_json::json!({
            "apiVersion": "breakglass.openshift.io/v1alpha1",
            "kind": "Session",
            "status": status,
        });
        api.patch_status(&session_name, &params, &Patch::Apply(patch))
            .await?;
    } else if let Some(secret) = &actions.secret {
        let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
        // k8s-openapi types carry no TypeMeta; apply requires it.
        let mut value =
            serde_json::to_value(secret).map_err(|e| Error::serialization(e.to_string()))?;
        value["apiVersion"] = "v1".into();
        value["kind"] = "Secret".into();
        api.patch(&credential_name, &params, &Patch::Apply(value))
            .await?;
    } else if let Some(csr) = &actions.csr {
        let api: Api<CertificateSigningRequest> = Api::all(provider.client());
        let mut value =
            serde_json::to_value(csr).map_err(|e| Error::serialization(e.to_string()))?;
        value["apiVersion"] = "certificates.k8s.io/v1".into();
        value["kind"] = "CertificateSigningRequest".into();
        api.patch(&credential_name, &params, &Patch::Apply(value))
            .await?;
    } else if actions.delete_csr {
        let api: Api<CertificateSigningRequest> = Api::all(provider.client());
        tolerate_not_found(api.delete(&credential_name, &DeleteParams::default()).await)?;
    } else if let Some(approval) = &actions.csr_approval {
        let api: Api<CertificateSigningRequestApproval> = Api::namespaced(
            provider.client(),
            &session.spec.hosted_control_plane.namespace,
        );
        api.patch(&credential_name, &params, &Patch::Apply(approval))
            .await?;
    } else if actions.delete_session {
        let api: Api<Session> = Api::namespaced(ctx.client.clone(), &namespace);
        tolerate_not_found(api.delete(&session_name, &DeleteParams::default()).await)?;
    }

    Ok(())
}

fn tolerate_not_found<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Error policy: log and requeue shortly.
///
/// Only transient and retryable errors reach this point; permanent failures
/// are recorded as conditions and end the pass without an error.
pub fn error_policy(session: Arc<Session>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        session = %format!("{}/{}", session.namespace().unwrap_or_default(), session.name_any()),
        %error,
        "reconciliation failed, requeueing"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Run the session controller until shutdown.
///
/// `wakes` is the stream of remote-change notifications produced by the
/// management cluster watchers.
pub async fn run(
    ctx: Arc<Context>,
    wakes: impl futures::Stream<Item = ObjectRef<Session>> + Send + 'static,
) {
    let sessions: Api<Session> = Api::all(ctx.client.clone());
    let secrets: Api<Secret> = Api::all(ctx.client.clone());

    Controller::new(sessions, watcher::Config::default())
        .owns(
            secrets,
            watcher::Config::default().labels(&managed_by_selector()),
        )
        .reconcile_on(wakes)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(session = %obj, "reconciled"),
                Err(e) => warn!(error = %e, "reconciliation error"),
            }
        })
        .await;
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::crd::{condition_reasons, condition_types};
    use crate::crd::{
        AccessLevel, Condition, ConditionStatus, HcpCondition, HostedControlPlane,
        HostedControlPlaneRef, HostedControlPlaneSpec, HostedControlPlaneStatus,
        ManagementClusterRef, Owner, SessionSpec, SessionStatus,
    };
    use crate::endpoints::MockEndpointProvider;
    use crate::mc::MockManagementClusterQuerier;
    use crate::pki::{self, test_keys};
    use crate::{SECRET_KEY_CERTIFICATE, SECRET_KEY_PRIVATE_KEY};
    use chrono::{DateTime, Duration};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    pub fn fixed_time() -> DateTime<Utc> {
        "2025-01-07T12:00:00Z".parse().expect("valid timestamp")
    }

    pub fn sample_session() -> Session {
        let mut session = Session::new(
            "test-session",
            SessionSpec {
                ttl_seconds: 24 * 3600,
                owner: Owner {
                    name: "user@example.com".to_string(),
                    claim_type: "email".to_string(),
                },
                access_level: AccessLevel {
                    group: "break-glass".to_string(),
                },
                hosted_control_plane: HostedControlPlaneRef {
                    namespace: "clusters-test-hcp".to_string(),
                    resource_id: "/subscriptions/abc/hostedclusters/test-hcp".to_string(),
                },
                management_cluster: ManagementClusterRef {
                    resource_id: "/subscriptions/abc/managedclusters/mc-1".to_string(),
                },
            },
        );
        session.metadata.namespace = Some("team-sre".to_string());
        session.metadata.creation_timestamp = Some(Time(fixed_time()));
        session.metadata.generation = Some(1);
        session
    }

    pub fn session_with_secret_ref() -> Session {
        let mut session = sample_session();
        session.status = Some(SessionStatus {
            expires_at: Some(fixed_time() + Duration::hours(24)),
            credentials_secret_ref: Some(session.credential_name()),
            ..Default::default()
        });
        session
    }

    pub fn session_with_conditions(conditions: &[(&str, ConditionStatus, &str, &str)]) -> Session {
        let mut session = session_with_secret_ref();
        let status = session.status.as_mut().expect("status");
        status.conditions = conditions
            .iter()
            .map(|(type_, cond_status, reason, message)| {
                Condition::new(
                    *type_,
                    *cond_status,
                    *reason,
                    *message,
                    Some(1),
                    fixed_time(),
                )
            })
            .collect();
        session
    }

    pub fn ready_session() -> Session {
        let mut session = session_with_conditions(&[
            (
                condition_types::HOSTED_CONTROL_PLANE_AVAILABLE,
                ConditionStatus::True,
                condition_reasons::HOSTED_CONTROL_PLANE_AVAILABLE,
                "HostedControlPlane is available",
            ),
            (
                condition_types::CREDENTIALS_AVAILABLE,
                ConditionStatus::True,
                condition_reasons::CREDENTIALS_AVAILABLE,
                "Credentials available",
            ),
            (
                condition_types::NETWORK_PATH_AVAILABLE,
                ConditionStatus::True,
                condition_reasons::NETWORK_PATH_AVAILABLE,
                "Network path available via public endpoint",
            ),
            (
                condition_types::READY,
                ConditionStatus::True,
                condition_reasons::SESSION_READY,
                "Session is ready",
            ),
        ]);
        let status = session.status.as_mut().expect("status");
        status.backend_kas_url = Some("https://api.test-hcp.example.com".to_string());
        status.endpoint =
            Some("https://breakglass.example.com/sessions/team-sre/test-session/kas".to_string());
        session
    }

    pub fn available_hcp() -> HostedControlPlane {
        let mut hcp = HostedControlPlane::new(
            "test-hcp",
            HostedControlPlaneSpec {
                kube_api_server_dns_name: "api.test-hcp.example.com".to_string(),
            },
        );
        hcp.metadata.namespace = Some("clusters-test-hcp".to_string());
        hcp.status = Some(HostedControlPlaneStatus {
            conditions: vec![HcpCondition {
                type_: "Available".to_string(),
                status: "True".to_string(),
                reason: "AsExpected".to_string(),
                message: String::new(),
            }],
        });
        hcp
    }

    pub fn unavailable_hcp() -> HostedControlPlane {
        let mut hcp = available_hcp();
        hcp.status = Some(HostedControlPlaneStatus {
            conditions: vec![HcpCondition {
                type_: "Available".to_string(),
                status: "False".to_string(),
                reason: "Provisioning".to_string(),
                message: String::new(),
            }],
        });
        hcp
    }

    pub fn credential_secret(with_certificate: bool) -> Secret {
        let session = sample_session();
        let pem = pki::encode_private_key_pem(test_keys::key_a()).expect("encodes");
        let mut data = BTreeMap::from([(
            SECRET_KEY_PRIVATE_KEY.to_string(),
            ByteString(pem.into_bytes()),
        )]);
        if with_certificate {
            data.insert(
                SECRET_KEY_CERTIFICATE.to_string(),
                ByteString(b"CERT-PEM".to_vec()),
            );
        }
        Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(session.credential_name()),
                namespace: session.namespace(),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn remote_csr() -> CertificateSigningRequest {
        let session = sample_session();
        let request = pki::csr::build_request_pem(
            test_keys::key_a(),
            &session.spec.owner.name,
            &session.spec.access_level.group,
        )
        .expect("builds");
        resources::build_csr(&session, &request)
    }

    pub fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("synthetic {code}"),
            reason: String::new(),
            code,
        }))
    }

    pub fn step_input_parts() -> (
        MockManagementClusterQuerier,
        MockSecretReader,
        MockEndpointProvider,
    ) {
        (
            MockManagementClusterQuerier::new(),
            MockSecretReader::new(),
            MockEndpointProvider::new(),
        )
    }
}
