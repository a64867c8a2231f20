//! Management cluster connectivity
//!
//! Management clusters are connected on demand: when the first Session
//! references a cluster, the [`registrar`] builds a
//! [`ManagementClusterProvider`] with cache-backed watchers for CSRs,
//! approvals, and HostedControlPlanes; when the last referencing Session is
//! gone, the provider is dropped and its watchers stop.
//!
//! Remote changes never mutate anything directly. Watchers translate them
//! into wakes of the owning Session, and the session controller re-derives
//! everything on the next pass.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::api::ListParams;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{CertificateSigningRequestApproval, HostedControlPlane, Session};
use crate::{
    managed_by_selector, Error, Result, ANNOTATION_SESSION, LABEL_CREDENTIAL_TYPE,
    LABEL_CREDENTIAL_TYPE_VALUE,
};

pub mod kubeconfig;
pub mod registrar;

pub use registrar::{registrar_channel, ProviderFactory, Registrar, RegistrarHandle};

/// How long to wait for a freshly connected cluster's caches to fill.
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Read access to a management cluster, backed by local caches.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagementClusterQuerier: Send + Sync {
    /// The HostedControlPlane in `namespace`.
    ///
    /// Exactly one is expected per namespace; zero yields a not-found error
    /// and more than one a provider error.
    async fn get_hosted_control_plane(&self, namespace: &str) -> Result<HostedControlPlane>;

    /// The cluster-scoped CSR with `name`, if present.
    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>>;

    /// The CSR approval with `name` in `namespace`, if present.
    async fn get_csr_approval(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CertificateSigningRequestApproval>>;
}

/// Cache-backed querier over the provider's reflector stores.
struct StoreQuerier {
    hcps: Store<HostedControlPlane>,
    csrs: Store<CertificateSigningRequest>,
    approvals: Store<CertificateSigningRequestApproval>,
}

#[async_trait]
impl ManagementClusterQuerier for StoreQuerier {
    async fn get_hosted_control_plane(&self, namespace: &str) -> Result<HostedControlPlane> {
        let matches: Vec<_> = self
            .hcps
            .state()
            .into_iter()
            .filter(|hcp| hcp.namespace().as_deref() == Some(namespace))
            .collect();
        match matches.as_slice() {
            [] => Err(Error::not_found("HostedControlPlane", namespace)),
            [hcp] => Ok(HostedControlPlane::clone(hcp)),
            _ => Err(Error::provider(format!(
                "multiple HostedControlPlanes in namespace {namespace}"
            ))),
        }
    }

    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>> {
        Ok(self
            .csrs
            .get(&ObjectRef::new(name))
            .map(|csr| CertificateSigningRequest::clone(&csr)))
    }

    async fn get_csr_approval(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CertificateSigningRequestApproval>> {
        Ok(self
            .approvals
            .get(&ObjectRef::new(name).within(namespace))
            .map(|approval| CertificateSigningRequestApproval::clone(&approval)))
    }
}

/// A connected management cluster: a client, synced caches, and watcher tasks
/// feeding session wakes. Dropping the provider stops the watchers.
pub struct ManagementClusterProvider {
    resource_id: String,
    client: Client,
    querier: StoreQuerier,
    tasks: Vec<JoinHandle<()>>,
}

impl ManagementClusterProvider {
    /// Connect watchers against `client` and wait for the caches to sync.
    ///
    /// `local_client` is used to resolve which Sessions a HostedControlPlane
    /// change affects. Fails if the caches do not sync within
    /// `ready_timeout`; the watchers are torn down in that case.
    pub async fn connect(
        resource_id: impl Into<String>,
        client: Client,
        local_client: Client,
        wakes: UnboundedSender<ObjectRef<Session>>,
        ready_timeout: Duration,
    ) -> Result<Self> {
        let resource_id = resource_id.into();
        let mut tasks = Vec::new();

        let (csr_store, csr_writer) = reflector::store();
        let csr_api: Api<CertificateSigningRequest> = Api::all(client.clone());
        let csr_stream = reflector::reflector(
            csr_writer,
            watcher(
                csr_api,
                watcher::Config::default().labels(&managed_by_selector()),
            ),
        )
        .default_backoff();
        let csr_wakes = wakes.clone();
        tasks.push(tokio::spawn(async move {
            futures::pin_mut!(csr_stream);
            while let Some(event) = csr_stream.next().await {
                match event {
                    Ok(watcher::Event::Apply(csr)) | Ok(watcher::Event::Delete(csr)) => {
                        wake_annotated_session(&csr, &csr_wakes);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "CSR watch error"),
                }
            }
        }));

        let (approval_store, approval_writer) = reflector::store();
        let approval_api: Api<CertificateSigningRequestApproval> = Api::all(client.clone());
        let approval_selector = format!("{LABEL_CREDENTIAL_TYPE}={LABEL_CREDENTIAL_TYPE_VALUE}");
        let approval_stream = reflector::reflector(
            approval_writer,
            watcher(
                approval_api,
                watcher::Config::default().labels(&approval_selector),
            ),
        )
        .default_backoff();
        let approval_wakes = wakes.clone();
        tasks.push(tokio::spawn(async move {
            futures::pin_mut!(approval_stream);
            while let Some(event) = approval_stream.next().await {
                match event {
                    Ok(watcher::Event::Apply(approval)) | Ok(watcher::Event::Delete(approval)) => {
                        wake_annotated_session(&approval, &approval_wakes);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "CSR approval watch error"),
                }
            }
        }));

        let (hcp_store, hcp_writer) = reflector::store();
        let hcp_api: Api<HostedControlPlane> = Api::all(client.clone());
        let hcp_stream = reflector::reflector(hcp_writer, watcher(hcp_api, watcher::Config::default()))
            .default_backoff();
        let hcp_wakes = wakes.clone();
        let hcp_local = local_client.clone();
        let hcp_mc_id = resource_id.clone();
        tasks.push(tokio::spawn(async move {
            // Availability per HCP, so only Available transitions fan out to
            // sessions. HostedControlPlanes churn constantly on unrelated
            // status fields.
            let mut availability: HashMap<String, bool> = HashMap::new();
            futures::pin_mut!(hcp_stream);
            while let Some(event) = hcp_stream.next().await {
                match event {
                    Ok(watcher::Event::InitApply(hcp)) => {
                        availability.insert(hcp_key(&hcp), hcp.is_available());
                    }
                    Ok(watcher::Event::Apply(hcp)) => {
                        let available = hcp.is_available();
                        if availability.insert(hcp_key(&hcp), available) != Some(available) {
                            wake_referencing_sessions(
                                &hcp_local,
                                &hcp_mc_id,
                                &hcp.namespace().unwrap_or_default(),
                                &hcp_wakes,
                            )
                            .await;
                        }
                    }
                    Ok(watcher::Event::Delete(hcp)) => {
                        availability.remove(&hcp_key(&hcp));
                        wake_referencing_sessions(
                            &hcp_local,
                            &hcp_mc_id,
                            &hcp.namespace().unwrap_or_default(),
                            &hcp_wakes,
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "HostedControlPlane watch error"),
                }
            }
        }));

        let ready = async {
            csr_store.wait_until_ready().await?;
            approval_store.wait_until_ready().await?;
            hcp_store.wait_until_ready().await?;
            Ok::<(), reflector::store::WriterDropped>(())
        };
        match tokio::time::timeout(ready_timeout, ready).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                for task in &tasks {
                    task.abort();
                }
                return Err(Error::provider(format!(
                    "caches for management cluster {resource_id} did not sync"
                )));
            }
        }

        info!(management_cluster = %resource_id, "management cluster connected");
        Ok(Self {
            resource_id,
            client,
            querier: StoreQuerier {
                hcps: hcp_store,
                csrs: csr_store,
                approvals: approval_store,
            },
            tasks,
        })
    }

    /// The cloud resource ID this provider serves.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Client for direct writes against the management cluster.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Cache-backed read access.
    pub fn querier(&self) -> &dyn ManagementClusterQuerier {
        &self.querier
    }
}

impl Drop for ManagementClusterProvider {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn hcp_key(hcp: &HostedControlPlane) -> String {
    format!("{}/{}", hcp.namespace().unwrap_or_default(), hcp.name_any())
}

/// Resolve the session ownership annotation on a remote object to an
/// [`ObjectRef`] and send the wake. Objects without the annotation (or with
/// a malformed one) are not ours and are ignored.
fn wake_annotated_session<K>(obj: &K, wakes: &UnboundedSender<ObjectRef<Session>>)
where
    K: kube::Resource,
{
    if let Some(session_ref) = session_ref_from_annotation(obj) {
        let _ = wakes.unbounded_send(session_ref);
    }
}

fn session_ref_from_annotation<K>(obj: &K) -> Option<ObjectRef<Session>>
where
    K: kube::Resource,
{
    let value = obj.meta().annotations.as_ref()?.get(ANNOTATION_SESSION)?;
    let (namespace, name) = value.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(ObjectRef::new(name).within(namespace))
}

async fn wake_referencing_sessions(
    local: &Client,
    mc_id: &str,
    hcp_namespace: &str,
    wakes: &UnboundedSender<ObjectRef<Session>>,
) {
    let api: Api<Session> = Api::all(local.clone());
    match api.list(&ListParams::default()).await {
        Ok(sessions) => {
            for session in sessions.items.iter().filter(|s| {
                s.spec.management_cluster.resource_id == mc_id
                    && s.spec.hosted_control_plane.namespace == hcp_namespace
            }) {
                if let Some(namespace) = session.namespace() {
                    let _ = wakes
                        .unbounded_send(ObjectRef::new(&session.name_any()).within(&namespace));
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to list sessions for control plane wake"),
    }
}

/// Registry of connected management clusters, keyed by cloud resource ID.
///
/// Reads happen on every reconcile pass and only take the read lock; all
/// writes go through the registrar task.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<ManagementClusterProvider>>>,
}

impl ProviderRegistry {
    /// Look up a provider.
    pub fn get(&self, resource_id: &str) -> Option<Arc<ManagementClusterProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_id)
            .cloned()
    }

    /// Returns true if a provider is registered for `resource_id`.
    pub fn contains(&self, resource_id: &str) -> bool {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(resource_id)
    }

    /// Register a provider.
    pub fn insert(&self, provider: Arc<ManagementClusterProvider>) {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider.resource_id().to_string(), provider);
    }

    /// Remove a provider; its watchers stop when the last reference drops.
    pub fn remove(&self, resource_id: &str) -> Option<Arc<ManagementClusterProvider>> {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource_id)
    }

    /// IDs of all registered clusters.
    pub fn ids(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testutil::{available_hcp, sample_session};
    use crate::controller::resources;
    use kube::runtime::watcher::Event;

    #[tokio::test]
    async fn store_querier_list_semantics() {
        let (hcp_store, mut hcp_writer) = reflector::store();
        let (csr_store, _csr_writer) = reflector::store::<CertificateSigningRequest>();
        let (approval_store, _approval_writer) =
            reflector::store::<CertificateSigningRequestApproval>();
        let querier = StoreQuerier {
            hcps: hcp_store,
            csrs: csr_store,
            approvals: approval_store,
        };

        // Empty: not found, and the error is classified permanent.
        let err = querier
            .get_hosted_control_plane("clusters-test-hcp")
            .await
            .expect_err("not found");
        assert!(err.is_not_found());

        hcp_writer.apply_watcher_event(&Event::Apply(available_hcp()));
        let hcp = querier
            .get_hosted_control_plane("clusters-test-hcp")
            .await
            .expect("found");
        assert_eq!(hcp.spec.kube_api_server_dns_name, "api.test-hcp.example.com");

        // A second HCP in the same namespace is a provider error.
        let mut second = available_hcp();
        second.metadata.name = Some("other-hcp".to_string());
        hcp_writer.apply_watcher_event(&Event::Apply(second));
        assert!(querier
            .get_hosted_control_plane("clusters-test-hcp")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn csr_lookup_is_by_cluster_scoped_name() {
        let (hcp_store, _hcp_writer) = reflector::store::<HostedControlPlane>();
        let (csr_store, mut csr_writer) = reflector::store();
        let (approval_store, _approval_writer) =
            reflector::store::<CertificateSigningRequestApproval>();
        let querier = StoreQuerier {
            hcps: hcp_store,
            csrs: csr_store,
            approvals: approval_store,
        };

        let session = sample_session();
        let name = session.credential_name();
        assert!(querier.get_csr(&name).await.expect("no error").is_none());

        csr_writer.apply_watcher_event(&Event::Apply(crate::controller::testutil::remote_csr()));
        assert!(querier.get_csr(&name).await.expect("no error").is_some());
    }

    #[test]
    fn session_annotation_resolves_to_object_ref() {
        let session = sample_session();
        let csr = crate::controller::testutil::remote_csr();
        let session_ref = session_ref_from_annotation(&csr).expect("annotated");
        assert_eq!(session_ref.name, session.name_any());
        assert_eq!(session_ref.namespace.as_deref(), Some("team-sre"));

        // Unannotated and malformed objects are ignored.
        let mut bare = crate::controller::testutil::remote_csr();
        bare.metadata.annotations = None;
        assert!(session_ref_from_annotation(&bare).is_none());

        let mut malformed = crate::controller::testutil::remote_csr();
        malformed
            .metadata
            .annotations
            .as_mut()
            .expect("annotations")
            .insert(ANNOTATION_SESSION.to_string(), "no-slash".to_string());
        assert!(session_ref_from_annotation(&malformed).is_none());
    }

    #[test]
    fn registry_round_trip() {
        // Provider construction needs a live cluster, so only the map
        // behavior is covered here.
        let registry = ProviderRegistry::default();
        assert!(registry.get("mc-1").is_none());
        assert!(!registry.contains("mc-1"));
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn approval_builder_carries_session_annotation() {
        // The wake path depends on every object we create being annotated.
        let session = sample_session();
        let approval = resources::build_csr_approval(&session);
        assert!(session_ref_from_annotation(&approval).is_some());
    }
}
