/**
 * HIVE KERNEL - Service d'agrégation du run
 *
 * RÔLE : Lire le fil de commentaires du work item, maintenir le SystemSnapshot
 * et l'exposer en pull (API REST) et en push (MQTT retenu, optionnel).
 *
 * FONCTIONNEMENT : observateur pur, n'écrit jamais sur le bus. Le bus GitHub
 * est enveloppé dans un RetryingBus ; une panne transitoire ne fait que
 * retarder le snapshot suivant.
 */

use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hive_kernel::bus::{GithubIssueBus, RetryPolicy, RetryingBus};
use hive_kernel::health::HealthMonitor;
use hive_kernel::http::{build_router, AppState};
use hive_kernel::publish::spawn_snapshot_publisher;
use hive_kernel::status::ServiceStatus;
use hive_kernel::{clock, config, Aggregator, SharedBus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let conf = config::load().await.context("loading hive config")?;
    conf.validate().context("validating hive config")?;
    let Some(github) = conf.github.clone() else {
        bail!("no `github` section in config: the kernel needs a work item to observe");
    };
    info!("[kernel] observing {}/{}#{}", github.owner, github.repo, github.issue);

    let bus: SharedBus = Arc::new(RetryingBus::new(
        GithubIssueBus::new(github).context("building GitHub bus")?,
        RetryPolicy::default(),
    ));
    let aggregator = Arc::new(
        Aggregator::new(
            bus,
            clock::system(),
            HealthMonitor::new(conf.coordination.stale_threshold()),
        )
        .incremental(conf.aggregator.incremental)
        .max_attempts(conf.coordination.max_attempts),
    );
    let hub = aggregator.hub();
    let status = ServiceStatus::new();

    if let Err(e) = aggregator.refresh().await {
        warn!("[kernel] initial snapshot failed, serving empty state: {}", e);
        status.record_failure(&e);
    }
    let _refresh = aggregator.clone().spawn(conf.aggregator.interval(), status.clone());

    let _mqtt = match conf.mqtt.clone() {
        Some(mqtt) => {
            info!("[kernel] pushing snapshots to mqtt://{}:{}/{}", mqtt.host, mqtt.port, mqtt.topic);
            Some(spawn_snapshot_publisher(hub.clone(), mqtt, status.clone()))
        }
        None => None,
    };

    let addr: SocketAddr = conf
        .aggregator
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {:?}", conf.aggregator.listen))?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    info!("[kernel] HTTP API listening on {}", addr);
    axum::serve(listener, build_router(AppState::new(hub, status)))
        .await
        .context("serving HTTP API")?;
    Ok(())
}
