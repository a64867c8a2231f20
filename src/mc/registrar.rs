//! Management cluster registration
//!
//! All registry writes happen on one task so registration decisions are
//! serialized: the session controller only sends the cluster ID it needs,
//! and the registrar decides whether to connect or tear down by looking at
//! which Sessions currently reference the cluster.
//!
//! Session deletion produces no reconcile pass of its own, so a periodic
//! sweep drops providers whose last referencing Session is gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::Session;
use crate::Result;

use super::{ManagementClusterProvider, ProviderRegistry};

/// Interval of the unregistration sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Builds a connected provider for a management cluster.
///
/// Split from the registrar so tests can drive registration without a live
/// cluster; the production implementation is
/// [`kubeconfig::KubeconfigProviderFactory`](super::kubeconfig::KubeconfigProviderFactory).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Connect to the management cluster with the given cloud resource ID.
    async fn connect(&self, resource_id: &str) -> Result<ManagementClusterProvider>;
}

/// Cheap handle for requesting a registration sync.
#[derive(Clone)]
pub struct RegistrarHandle {
    tx: UnboundedSender<String>,
}

impl RegistrarHandle {
    /// Ask the registrar to reconcile the registration state of one cluster.
    /// Lossy by design: a dropped request is retried by the next reconcile
    /// pass or the sweep.
    pub fn request_sync(&self, resource_id: &str) {
        let _ = self.tx.unbounded_send(resource_id.to_string());
    }
}

/// Create the registrar request channel.
pub fn registrar_channel() -> (RegistrarHandle, UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded();
    (RegistrarHandle { tx }, rx)
}

/// Single-writer task owning all registry mutations.
pub struct Registrar {
    registry: Arc<ProviderRegistry>,
    factory: Arc<dyn ProviderFactory>,
    local_client: Client,
    wakes: UnboundedSender<ObjectRef<Session>>,
    requests: UnboundedReceiver<String>,
}

impl Registrar {
    /// Create a registrar over the given registry and factory.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        factory: Arc<dyn ProviderFactory>,
        local_client: Client,
        wakes: UnboundedSender<ObjectRef<Session>>,
        requests: UnboundedReceiver<String>,
    ) -> Self {
        Self {
            registry,
            factory,
            local_client,
            wakes,
            requests,
        }
    }

    /// Serve registration requests and sweep until the request channel
    /// closes.
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                request = self.requests.next() => {
                    match request {
                        Some(resource_id) => self.sync_cluster(&resource_id).await,
                        None => {
                            debug!("registrar request channel closed, stopping");
                            return;
                        }
                    }
                }
                _ = sweep.tick() => self.sweep().await,
            }
        }
    }

    /// Bring the registration state of one cluster in line with the Sessions
    /// that reference it.
    async fn sync_cluster(&self, resource_id: &str) {
        let referencing = match self.referencing_sessions(resource_id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, management_cluster = %resource_id, "failed to list sessions, skipping sync");
                return;
            }
        };

        match (referencing.is_empty(), self.registry.contains(resource_id)) {
            (false, false) => {
                info!(management_cluster = %resource_id, "registering management cluster");
                match self.factory.connect(resource_id).await {
                    Ok(provider) => {
                        self.registry.insert(Arc::new(provider));
                        // Sessions that reconciled while the cluster was
                        // unregistered parked themselves on a requeue; wake
                        // them now rather than waiting it out.
                        for session_ref in referencing {
                            let _ = self.wakes.unbounded_send(session_ref);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, management_cluster = %resource_id, "failed to connect management cluster");
                    }
                }
            }
            (true, true) => {
                info!(management_cluster = %resource_id, "unregistering management cluster");
                self.registry.remove(resource_id);
            }
            _ => {}
        }
    }

    /// Drop providers no Session references anymore.
    async fn sweep(&self) {
        for resource_id in self.registry.ids() {
            match self.referencing_sessions(&resource_id).await {
                Ok(sessions) if sessions.is_empty() => {
                    info!(management_cluster = %resource_id, "sweeping unreferenced management cluster");
                    self.registry.remove(&resource_id);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, management_cluster = %resource_id, "sweep list failed");
                }
            }
        }
    }

    async fn referencing_sessions(&self, resource_id: &str) -> Result<Vec<ObjectRef<Session>>> {
        let api: Api<Session> = Api::all(self.local_client.clone());
        let sessions = api.list(&ListParams::default()).await?;
        Ok(sessions
            .items
            .iter()
            .filter(|s| s.spec.management_cluster.resource_id == resource_id)
            .filter_map(|s| {
                s.namespace()
                    .map(|ns| ObjectRef::new(&s.name_any()).within(&ns))
            })
            .collect())
    }
}
