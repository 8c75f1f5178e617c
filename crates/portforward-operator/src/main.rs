use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use portforward_operator::client::{RestRouterClient, RouterClient};
use portforward_operator::config::{PortForwardConfig, PortForwardConfigSpec};
use portforward_operator::controllers::{self, Context};
use portforward_operator::events::KubeEventPublisher;
use portforward_operator::health::{run_health_server, HealthState, DEFAULT_HEALTH_PORT};
use portforward_operator::rate_limit::IDLE_TTL;
use portforward_operator::store::KubeServiceStore;

const CONTROLLER_NAME: &str = "portforward-operator";
const SWEEP_INTERVAL_SECS: u64 = 600;
const SHUTDOWN_GRACE_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("portforward-operator starting");

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let config = load_config(&kube_client)
        .await
        .context("Failed to load PortForwardConfig")?;

    info!(
        endpoint = %config.router.endpoint,
        site = %config.router.site,
        periodic_interval_secs = config.reconcile.periodic_interval_seconds,
        max_concurrent_passes = config.reconcile.max_concurrent_passes,
        "Loaded configuration"
    );

    let api_key = load_api_key(&kube_client, &config)
        .await
        .context("Failed to load router API key")?;

    let router: Arc<dyn RouterClient> = Arc::new(
        RestRouterClient::new(
            &config.router.endpoint,
            &config.router.site,
            &api_key,
            config.router.timeout(),
            &config.router.tls(),
        )
        .context("Failed to create router client")?,
    );

    let cancel = CancellationToken::new();
    let ctx = Arc::new(Context::new(
        router.clone(),
        Arc::new(KubeServiceStore::new(kube_client.clone())),
        Arc::new(KubeEventPublisher::new(kube_client.clone(), CONTROLLER_NAME)),
        &config,
        cancel.clone(),
    ));

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_HEALTH_PORT);
    let health = tokio::spawn(run_health_server(
        Arc::new(HealthState::new(router)),
        health_port,
        cancel.clone(),
    ));

    info!("Starting controller and periodic reconciler");

    let periodic = tokio::spawn(Arc::new(ctx.periodic(&config)).run(cancel.clone()));
    let controller = tokio::spawn(controllers::service::run(kube_client.clone(), ctx.clone()));
    let sweep = tokio::spawn(run_sweep(ctx.clone(), cancel.clone()));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    let outcome = select! {
        // The controller stream only ends once it has seen a shutdown signal itself
        result = controller => match result {
            Ok(()) => Ok(()),
            Err(e) => handle_task_exit("Service controller", Err(e)),
        },
        result = health => match result {
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("Health server failed")),
            other => handle_task_exit("Health server", other.map(|_| ())),
        },
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
            Ok(())
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
            Ok(())
        }
    };

    // Stop new passes and let in-flight ones finish their current operation
    cancel.cancel();
    drain("Periodic reconciler", periodic).await;
    drain("Limiter sweep", sweep).await;
    info!("Shutdown complete");

    outcome
}

/// Load the singleton PortForwardConfig from the cluster
async fn load_config(client: &Client) -> Result<PortForwardConfigSpec> {
    let api: Api<PortForwardConfig> = Api::all(client.clone());
    let configs = api.list(&ListParams::default()).await?;

    let Some(first) = configs.items.first() else {
        bail!("No PortForwardConfig found in cluster - please create one");
    };

    if configs.items.len() > 1 {
        warn!(
            count = configs.items.len(),
            "Multiple PortForwardConfig resources found, using first one"
        );
    }

    Ok(first.spec.clone())
}

/// Read the router API key from the referenced Secret
async fn load_api_key(client: &Client, config: &PortForwardConfigSpec) -> Result<String> {
    let secret_ref = &config.router.api_key_secret_ref;
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &secret_ref.namespace);

    let secret = secrets.get(&secret_ref.name).await.with_context(|| {
        format!("Secret {}/{} not found", secret_ref.namespace, secret_ref.name)
    })?;

    let data = secret.data.as_ref().context("Secret has no data field")?;
    let bytes = data
        .get(&secret_ref.key)
        .with_context(|| format!("Secret missing {}", secret_ref.key))?;

    let key = String::from_utf8(bytes.0.clone()).context("API key is not valid UTF-8")?;
    Ok(key.trim().to_string())
}

/// Drop idle rate limiter entries and unused Service locks
async fn run_sweep(ctx: Arc<Context>, cancel: CancellationToken) {
    let mut ticker = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let purged = ctx.limiter.purge_idle(IDLE_TTL);
                let pruned = ctx.locks.prune();
                if purged > 0 || pruned > 0 {
                    debug!(purged, pruned, "Swept idle limiter entries and locks");
                }
            }
        }
    }
}

async fn drain(name: &str, handle: JoinHandle<()>) {
    match timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), handle).await {
        Ok(Ok(())) => debug!(task = name, "Task stopped"),
        Ok(Err(e)) => error!(task = name, error = ?e, "Task failed during shutdown"),
        Err(_) => warn!(
            task = name,
            grace_seconds = SHUTDOWN_GRACE_SECS,
            "Task did not stop within the grace period"
        ),
    }
}

/// Handle a long-running task exit, returning an error to trigger pod restart
fn handle_task_exit(name: &str, result: std::result::Result<(), tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(()) => {
            error!(task = name, "Task exited unexpectedly");
            bail!("{} exited unexpectedly", name)
        }
        Err(e) if e.is_panic() => {
            error!(task = name, "Task panicked");
            bail!("{} panicked: {:?}", name, e.into_panic())
        }
        Err(e) if e.is_cancelled() => {
            warn!(task = name, "Task was cancelled");
            bail!("{} was cancelled", name)
        }
        Err(e) => {
            error!(task = name, error = ?e, "Task failed");
            bail!("{} task failed: {}", name, e)
        }
    }
}
