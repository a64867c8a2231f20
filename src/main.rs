//! Breakglass operator - time-boxed break-glass access to hosted control planes

use std::sync::Arc;

use clap::Parser;
use futures::channel::mpsc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use breakglass::controller::{self, KubeSecretReader};
use breakglass::crd::Session;
use breakglass::dataplane::{self, ProxyRegistry};
use breakglass::endpoints::IngressEndpointProvider;
use breakglass::events::KubeEventPublisher;
use breakglass::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use breakglass::mc::kubeconfig::KubeconfigProviderFactory;
use breakglass::mc::{registrar_channel, ProviderRegistry, Registrar};
use breakglass::FIELD_MANAGER;

/// Breakglass - operator granting time-boxed certificate access to hosted control planes
#[derive(Parser, Debug)]
#[command(name = "breakglass-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the Session CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Base URL session endpoints are published under
    #[arg(
        long,
        env = "BREAKGLASS_ENDPOINT_BASE_URL",
        default_value = "https://breakglass.example.com"
    )]
    endpoint_base_url: String,

    /// Namespace the operator runs in; holds the leader lease and the
    /// management cluster kubeconfig secrets
    #[arg(long, env = "POD_NAMESPACE", default_value = "breakglass-system")]
    namespace: String,

    /// Leader election identity, normally the pod name
    #[arg(long, env = "POD_NAME", default_value = "breakglass-operator-0")]
    identity: String,

    /// Disable leader election (single-replica development setups)
    #[arg(long)]
    disable_leader_election: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Session::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_operator(cli).await
}

/// Install the Session CRD on startup via server-side apply, so the CRD
/// version always matches the operator version. The hypershift types are
/// foreign and installed by hypershift on the management clusters.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Session CRD...");
    crds.patch(
        "sessions.breakglass.openshift.io",
        &params,
        &Patch::Apply(&Session::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Session CRD: {}", e))?;

    Ok(())
}

async fn run_operator(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Breakglass operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    // Leadership before anything mutating: a standby replica must not run
    // controllers or management cluster watchers.
    let guard = if cli.disable_leader_election {
        tracing::warn!("Leader election disabled");
        None
    } else {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &cli.namespace,
            &cli.identity,
        ));
        Some(elector.acquire().await?)
    };

    // Wake channel: management cluster watchers push session refs, the
    // session controller consumes them as reconcile triggers.
    let (wake_tx, wake_rx) = mpsc::unbounded();

    let registry = Arc::new(ProviderRegistry::default());
    let (registrar_handle, registrar_rx) = registrar_channel();
    let factory = Arc::new(KubeconfigProviderFactory::new(
        client.clone(),
        &cli.namespace,
        wake_tx.clone(),
    ));
    let registrar = Registrar::new(
        registry.clone(),
        factory,
        client.clone(),
        wake_tx.clone(),
        registrar_rx,
    );
    let registrar_task = tokio::spawn(registrar.run());

    let ctx = Arc::new(controller::Context {
        client: client.clone(),
        registry,
        registrar: registrar_handle,
        secrets: Arc::new(KubeSecretReader::new(client.clone())),
        endpoints: Arc::new(IngressEndpointProvider::new(cli.endpoint_base_url)),
        events: Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER)),
    });

    let dataplane_ctx = Arc::new(dataplane::Context {
        client: client.clone(),
        registry: Arc::new(ProxyRegistry::default()),
    });

    tracing::info!("Starting breakglass controllers...");
    tracing::info!("  - Session controller");
    tracing::info!("  - Data plane controller");

    let session_controller = controller::run(ctx, wake_rx);
    let dataplane_controller = dataplane::run(dataplane_ctx);

    match guard {
        Some(mut guard) => {
            tokio::select! {
                _ = session_controller => tracing::info!("Session controller completed"),
                _ = dataplane_controller => tracing::info!("Data plane controller completed"),
                _ = guard.lost() => tracing::warn!("Leadership lost, shutting down"),
            }
            if let Err(e) = guard.release_leadership().await {
                tracing::warn!(error = %e, "Failed to release leadership on shutdown");
            }
        }
        None => {
            tokio::select! {
                _ = session_controller => tracing::info!("Session controller completed"),
                _ = dataplane_controller => tracing::info!("Data plane controller completed"),
            }
        }
    }

    registrar_task.abort();
    tracing::info!("Breakglass operator shutting down");
    Ok(())
}
