//! Leader election using Kubernetes Leases
//!
//! Exactly one operator replica may drive Sessions at a time: the step chain
//! assumes its writes are the only ones under the shared field manager, and
//! duplicate CSR or key writes from a second replica would fight each other.
//! Replicas race for a coordination.k8s.io/v1 Lease and only the holder runs
//! the controllers.
//!
//! # Atomicity
//!
//! Updates carry the lease's resourceVersion, so a concurrent change fails
//! with 409 Conflict instead of silently overwriting. Two replicas can never
//! both conclude they acquired the lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lease name for operator leader election
pub const LEADER_LEASE_NAME: &str = "breakglass-operator-leader";

// Failover before a session noticeably stalls: sessions park on watch events
// for minutes at a time, so a 15s lease is plenty.
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Leader elector over a namespaced Lease.
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector with default timing (15s lease, 10s renew, 2s retry).
    ///
    /// `identity` is typically the pod name.
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Block until leadership is acquired, then return a guard.
    ///
    /// The guard renews the lease in the background; `lost()` resolves when
    /// renewal fails and the caller must stop its controllers.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard, LeaderElectionError> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Ok(self.create_guard());
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    // Transient API errors must not stop the candidate loop
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// Try to acquire or renew the lease atomically.
    ///
    /// Read the lease with its resourceVersion, decide, then write carrying
    /// that resourceVersion; any concurrent modification turns the write into
    /// a 409 and we treat the attempt as lost.
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => self.create_lease(&api, now).await,
            Some(lease) => {
                let spec = lease.spec.as_ref();
                let holder = spec.and_then(|s| s.holder_identity.as_ref());
                let resource_version = lease.metadata.resource_version.clone();

                if holder == Some(&self.identity) {
                    return self.renew_lease(&api, &lease, now).await;
                }

                if lease_is_expired(spec, now) {
                    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                    self.take_over_lease(&api, resource_version, now, transitions)
                        .await
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                // Another replica created it first; keep waiting
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let resource_version = existing.metadata.resource_version.as_ref().ok_or_else(|| {
            LeaderElectionError::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failed".to_string(),
                message: "Lease missing resourceVersion".to_string(),
                reason: "Invalid".to_string(),
                code: 500,
            }))
        })?;

        let mut updated = existing.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(now));
        }
        updated.metadata.resource_version = Some(resource_version.clone());

        match api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease renewed");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(identity = %self.identity, "Lease renewal conflict - lost leadership");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        resource_version: Option<String>,
        now: chrono::DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, LeaderElectionError> {
        let rv = resource_version.ok_or_else(|| {
            LeaderElectionError::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failed".to_string(),
                message: "Lease missing resourceVersion".to_string(),
                reason: "Invalid".to_string(),
                code: 500,
            }))
        })?;

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some(rv),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions + 1),
                ..Default::default()
            }),
        };

        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "Took over expired lease"
                );
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease takeover conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Release the lease by clearing the holder identity.
    ///
    /// Lets the standby replica acquire immediately instead of waiting out
    /// the lease duration. Called during graceful shutdown.
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(identity = %self.identity, "Lease not found, nothing to release");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        // Clear the holder and backdate renewTime so the lease reads as
        // expired to the next candidate.
        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });

        api.patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!(identity = %self.identity, "Lease released for fast failover");
        Ok(())
    }
}

/// Returns true when a lease held by someone else may be taken over.
///
/// A lease without renewTime or leaseDurationSeconds reads as expired; there
/// is no way to tell when it would end.
fn lease_is_expired(spec: Option<&LeaseSpec>, now: chrono::DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    }
}

/// Guard that maintains leadership.
///
/// While the guard exists, the elector renews the lease in the background.
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost.
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership by clearing the lease holder.
    ///
    /// Call during graceful shutdown so the standby takes over immediately.
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(renewed_secs_ago: i64, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other-pod".to_string()),
            lease_duration_seconds: Some(duration),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        assert!(!lease_is_expired(Some(&spec(5, 15)), Utc::now()));
    }

    #[test]
    fn stale_lease_is_expired() {
        assert!(lease_is_expired(Some(&spec(30, 15)), Utc::now()));
    }

    #[test]
    fn malformed_lease_is_expired() {
        assert!(lease_is_expired(None, Utc::now()));

        let mut no_renew = spec(5, 15);
        no_renew.renew_time = None;
        assert!(lease_is_expired(Some(&no_renew), Utc::now()));

        let mut no_duration = spec(5, 15);
        no_duration.lease_duration_seconds = None;
        assert!(lease_is_expired(Some(&no_duration), Utc::now()));
    }
}
