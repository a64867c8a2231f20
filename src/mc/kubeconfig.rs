//! Kubeconfig handling for management clusters and sessions
//!
//! Management cluster credentials are provisioned out of band as kubeconfig
//! secrets in the operator namespace, one per cluster, named after a hash of
//! the cloud resource ID (the ID itself contains slashes and is not a legal
//! secret name). This module also serializes the per-session kubeconfig that
//! the data plane hands to users.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::channel::mpsc::UnboundedSender;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, Config};

use crate::crd::Session;
use crate::{fnv1a32, Error, Result};

use super::registrar::ProviderFactory;
use super::{ManagementClusterProvider, CACHE_SYNC_TIMEOUT};

/// Key of the kubeconfig blob inside a management cluster secret.
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Name of the kubeconfig secret for a management cluster.
pub fn kubeconfig_secret_name(resource_id: &str) -> String {
    format!("mc-kubeconfig-{:08x}", fnv1a32(resource_id))
}

fn parse_kubeconfig(bytes: &[u8]) -> Result<Kubeconfig> {
    serde_yaml::from_slice(bytes)
        .map_err(|e| Error::serialization(format!("invalid kubeconfig: {e}")))
}

/// Build a client from raw kubeconfig bytes.
pub async fn client_from_kubeconfig(bytes: &[u8]) -> Result<Client> {
    let kubeconfig = parse_kubeconfig(bytes)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::provider(format!("failed to load kubeconfig: {e}")))?;
    Client::try_from(config).map_err(Error::from)
}

/// [`ProviderFactory`] reading management cluster kubeconfigs from secrets in
/// the operator namespace.
pub struct KubeconfigProviderFactory {
    local_client: Client,
    operator_namespace: String,
    wakes: UnboundedSender<ObjectRef<Session>>,
}

impl KubeconfigProviderFactory {
    /// Create a factory reading from `operator_namespace` on the local
    /// cluster.
    pub fn new(
        local_client: Client,
        operator_namespace: impl Into<String>,
        wakes: UnboundedSender<ObjectRef<Session>>,
    ) -> Self {
        Self {
            local_client,
            operator_namespace: operator_namespace.into(),
            wakes,
        }
    }
}

#[async_trait]
impl ProviderFactory for KubeconfigProviderFactory {
    async fn connect(&self, resource_id: &str) -> Result<ManagementClusterProvider> {
        let secret_name = kubeconfig_secret_name(resource_id);
        let api: Api<Secret> =
            Api::namespaced(self.local_client.clone(), &self.operator_namespace);
        let secret = api
            .get_opt(&secret_name)
            .await?
            .ok_or_else(|| Error::not_found("Secret", &secret_name))?;
        let kubeconfig = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                Error::provider(format!(
                    "secret {secret_name} has no {KUBECONFIG_SECRET_KEY} key"
                ))
            })?;

        let remote_client = client_from_kubeconfig(&kubeconfig.0).await?;
        ManagementClusterProvider::connect(
            resource_id,
            remote_client,
            self.local_client.clone(),
            self.wakes.clone(),
            CACHE_SYNC_TIMEOUT,
        )
        .await
    }
}

/// Serialize a single-context kubeconfig for a session, with the client
/// certificate and key embedded.
///
/// TLS verification against the hosted API server is skipped: sessions reach
/// it through the data plane proxy, which terminates with its own serving
/// certificate.
pub fn session_kubeconfig_yaml(
    cluster_name: &str,
    server: &str,
    certificate_pem: &[u8],
    key_pem: &[u8],
) -> Result<String> {
    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster_name,
            "cluster": {
                "server": server,
                "insecure-skip-tls-verify": true,
            },
        }],
        "users": [{
            "name": "breakglass",
            "user": {
                "client-certificate-data": BASE64.encode(certificate_pem),
                "client-key-data": BASE64.encode(key_pem),
            },
        }],
        "contexts": [{
            "name": cluster_name,
            "context": {
                "cluster": cluster_name,
                "user": "breakglass",
            },
        }],
        "current-context": cluster_name,
    });
    serde_yaml::to_string(&doc)
        .map_err(|e| Error::serialization(format!("failed to serialize kubeconfig: {e}")))
}
