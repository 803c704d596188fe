mod channel;
mod ingress;
mod listener;
mod problem;
mod router;
mod telemetry;

use std::{net::SocketAddr, sync::Arc};

use tokio::sync::watch;
use tracing::{info, warn};

use fitness_core::RuleBasedGenerator;
use fitness_identity::IdentityClient;
use fitness_storage::Database;
use fitness_util::{load_env_file, AppConfig};

use crate::channel::SqliteActivityChannel;
use crate::listener::{EventListener, ListenerSettings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let identity = IdentityClient::new(
        config.identity.base_url.clone(),
        config.identity.timeout,
        || {
            reqwest::Client::builder()
                .user_agent(concat!("fitness-app/", env!("CARGO_PKG_VERSION")))
                .connect_timeout(config.identity.timeout)
        },
    )?;

    let channel = SqliteActivityChannel::new(
        &database,
        config.listener.queue.clone(),
        config.listener.lease,
    );

    let listener = Arc::new(EventListener::new(
        Arc::new(channel.clone()),
        Arc::new(RuleBasedGenerator::new()),
        Arc::new(database.recommendations()),
        ListenerSettings {
            max_attempts: config.listener.max_attempts,
            poll_interval: config.listener.poll_interval,
            retry_backoff: config.listener.poll_interval,
        },
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = listener.spawn(config.listener.workers, shutdown_rx);
    info!(
        stage = "app",
        workers = config.listener.workers,
        queue = %config.listener.queue,
        identity = %config.identity.base_url,
        "activity listener started"
    );

    let state = router::AppState::new(metrics, database, identity, channel);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let tcp = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(tcp, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown_tx.send(true).ok();
    for worker in workers {
        if let Err(err) = worker.await {
            warn!(stage = "app", error = %err, "listener worker did not stop cleanly");
        }
    }
    info!(stage = "app", "shutdown complete");

    served.map_err(|err| err.into())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(stage = "app", error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!(stage = "app", "shutdown signal received");
}
