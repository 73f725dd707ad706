// src/main.rs
use anyhow::Context;
use live_relay::{
    build_router, client_pool::ClientPool, config::Config, init_tracing, setup_shared_state,
    updater::Updater,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env());
    let state = setup_shared_state(config.clone()).await;
    let shutdown = CancellationToken::new();

    let supervisor = state.supervisor.clone().spawn(shutdown.clone());

    if config.check_updates {
        let pool = ClientPool::new(1, config.proxy_addr.clone(), config.user_agent.clone());
        tokio::spawn(Updater::new(pool).run(shutdown.clone()));
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("🚀 live-relay is running at http://{}", config.listen_addr);

    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("⚠️ Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        info!("🛑 Shutting down");
        signal.cancel();
    })
    .await
    .context("server failed")?;

    shutdown.cancel();
    let _ = supervisor.await;
    Ok(())
}
