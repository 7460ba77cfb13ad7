mod orchestrator;
mod scheduler;
mod supervisor;
mod watcher;

use anyhow::Context;
use cr_acme::{InstantAcmeClient, LineageStore};
use cr_common::config::{ConfigSnapshot, EnvConfig, GlobalSettings};
use cr_dns::{DefaultProviderFactory, SystemResolver};
use cr_lineage::LineageProcessor;
use orchestrator::{Orchestrator, Sweep};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{spawn_supervised, ServicePriority};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_stream::StreamExt;
use tracing::info;
use watcher::SharedSnapshot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,certroute=debug".parse().unwrap()),
        )
        .init();

    info!("Certroute starting...");

    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment config
    let env = EnvConfig::from_env();
    info!(
        config = %env.config_path.display(),
        state = %env.state_dir.display(),
        "Environment loaded"
    );

    // Certificate store and ACME account
    let store = LineageStore::new(&env.state_dir);
    store.init().context("failed to initialize state directory")?;

    let acme = Arc::new(InstantAcmeClient::new(
        store.clone(),
        env.acme_directory_url.clone(),
        env.acme_email.clone(),
        Duration::from_secs(GlobalSettings::default().acme_timeout_secs),
    ));
    acme.init().await.context("failed to initialize ACME account")?;

    let resolver =
        Arc::new(SystemResolver::from_system_conf().context("failed to build DNS resolver")?);

    let processor = Arc::new(LineageProcessor::new(
        acme,
        Arc::new(DefaultProviderFactory),
        resolver,
        store,
    ));

    // Empty until the watcher publishes the first real snapshot
    let snapshot: SharedSnapshot = Arc::new(RwLock::new(Arc::new(ConfigSnapshot::default())));

    let (trigger_tx, trigger_rx) = mpsc::channel::<Sweep>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Signal handling: SIGHUP forces a sweep, SIGINT/SIGTERM shut down
    let signals = Signals::new([SIGHUP, SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();
    {
        let trigger_tx = trigger_tx.clone();
        tokio::spawn(async move {
            let mut signals = signals;
            while let Some(signal) = signals.next().await {
                match signal {
                    SIGHUP => {
                        info!("SIGHUP received, forcing reconciliation pass");
                        let _ = trigger_tx.send(Sweep::Manual).await;
                    }
                    _ => {
                        info!(signal, "Shutdown signal received");
                        let _ = shutdown_tx.send(true);
                    }
                }
            }
        });
    }

    // Background services, supervised
    {
        let path = env.config_path.clone();
        let snapshot = snapshot.clone();
        let triggers = trigger_tx.clone();
        let shutdown = shutdown_rx.clone();
        spawn_supervised("config-watcher", ServicePriority::Critical, move || {
            watcher::run(path.clone(), snapshot.clone(), triggers.clone(), shutdown.clone())
        });
    }
    {
        let snapshot = snapshot.clone();
        let triggers = trigger_tx.clone();
        let shutdown = shutdown_rx.clone();
        spawn_supervised("scheduler", ServicePriority::Critical, move || {
            scheduler::run(snapshot.clone(), triggers.clone(), shutdown.clone())
        });
    }

    let orch = Orchestrator::new(processor, snapshot);
    orch.run(trigger_rx, shutdown_rx).await;

    info!("Waiting for in-flight lineages to finish");
    orch.drain(Duration::from_secs(env.shutdown_grace_secs)).await;
    signals_handle.close();

    info!("Certroute stopped");
    Ok(())
}
