// Process wiring: adapters, coordinator, dispatcher and ingress.

use std::future::Future;

use anyhow::{Context, Result};
use repomirror_common::event::task::TaskGenerator;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::coordinator::{CoordinatorSettings, RepoSyncer, SyncCoordinator};
use crate::db::migrations::run_migrations;
use crate::db::pool::create_pg_pool;
use crate::dispatcher::requeue::{FailureSink, HttpForwarder};
use crate::dispatcher::{shutdown_requested, Dispatcher};
use crate::executor::SyncExecutor;
use crate::ingress::{self, IngressState};
use crate::lock::postgres::PgLockStore;
use crate::platform::gitlab::GitlabClient;
use crate::source::channel_source;
use crate::storage::obsutil::ObsutilStore;

/// Run the daemon until Ctrl+C or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let pool = create_pg_pool(&config.database.url, &config.pool_config())
        .await
        .context("failed to connect to the lock store")?;
    run_migrations(&pool).await.context("failed to migrate the lock store")?;

    let platform = GitlabClient::new(
        &config.platform.api_url,
        &config.platform.token,
        &config.platform.clone_username,
    )?;
    let objects =
        ObsutilStore::new(&config.storage.tool_path, &config.storage.bucket, &config.service.work_dir);
    let coordinator = SyncCoordinator::new(
        PgLockStore::new(pool),
        platform,
        objects,
        SyncExecutor::new(&config.service.sync_script),
        CoordinatorSettings::from_config(&config),
    );
    let forwarder = HttpForwarder::new(
        &config.dispatcher.forward_endpoint,
        &config.dispatcher.forward_token,
        config.dispatcher.max_resend,
    )?;
    let dispatcher = Dispatcher::new(
        TaskGenerator::new(&config.dispatcher.user_agent),
        coordinator,
        forwarder,
        config.queue_capacity(),
        config.retry_policy(),
    );

    let listener = TcpListener::bind(config.ingress.listen_addr)
        .await
        .with_context(|| format!("failed to bind ingress on {}", config.ingress.listen_addr))?;
    info!(
        listen_addr = %config.ingress.listen_addr,
        capacity = dispatcher.capacity(),
        "starting repomirror daemon"
    );

    serve(listener, dispatcher, config.ingress.token.clone(), shutdown_signal()).await
}

/// Serve hooks into `dispatcher` until `shutdown` resolves, then stop taking
/// hooks, drain the queue and return.
pub async fn serve<S, F, Sig>(
    listener: TcpListener,
    dispatcher: Dispatcher<S, F>,
    ingress_token: Option<String>,
    shutdown: Sig,
) -> Result<()>
where
    S: RepoSyncer,
    F: FailureSink,
    Sig: Future<Output = ()> + Send,
{
    let (sender, source) = channel_source(1);
    let app = ingress::router(IngressState::new(sender, dispatcher.state(), ingress_token));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_task = tokio::spawn(dispatcher.run(source, shutdown_rx.clone()));

    let mut server_shutdown = shutdown_rx;
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown_requested(&mut server_shutdown).await })
            .await
    });

    let early_exit = tokio::select! {
        _ = shutdown => None,
        joined = &mut server => Some(joined),
    };
    shutdown_tx.send_replace(true);

    if let Err(error) = dispatcher_task.await {
        error!(error = %error, "dispatcher task aborted");
    }
    let joined = match early_exit {
        Some(joined) => joined,
        None => server.await,
    };
    joined.context("ingress task aborted")?.context("ingress server failed")?;
    info!("repomirror daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
