mod cli;
mod http;
mod state;
mod task;

use std::sync::Arc;

use agent_core::{
    chain::{fake::FakeChainClient, http::HttpChainClient, ChainClient, NoSignerChainClient},
    config::Config,
};
use anyhow::Context;
use tracing::{info, instrument, warn};

use crate::{cli::AgentArgs, state::AppState, task::NotifyOnce};

fn main() -> anyhow::Result<()> {
    let args = AgentArgs::from_cli();
    if let Some(path) = &args.env_file {
        dotenvy::from_path(path).ok();
    } else {
        let _ = dotenvy::dotenv();
    }
    agent_logger::init();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr.to_string();
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the Tokio runtime")?;

    rt.block_on(run(config))
}

#[instrument(skip_all, name = "(agent)")]
async fn run(config: Config) -> anyhow::Result<()> {
    let chain: Arc<dyn ChainClient> = match &config.chain_signer_url {
        Some(signer_url) => {
            info!(%signer_url, "using the HTTP chain client");
            Arc::new(HttpChainClient::new(
                config.solana_rpc_url.clone(),
                config.wallet_public_key.clone(),
                signer_url.clone(),
                config.chain_rpc_timeout,
            ))
        }
        None if config.allow_fake_chain => {
            warn!("no CHAIN_SIGNER_URL configured, ALLOW_FAKE_CHAIN=true: falling back to the in-memory fake chain client");
            Arc::new(FakeChainClient::new(1_000_000_000))
        }
        None => {
            warn!(
                "no CHAIN_SIGNER_URL configured and ALLOW_FAKE_CHAIN is not set: \
                 payments will fail with SignerUnavailable until a signer is configured"
            );
            Arc::new(NoSignerChainClient)
        }
    };

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, chain));
    state.bootstrap().await.context("failed to bootstrap agent state")?;

    let shutdown = NotifyOnce::new();

    let balance_task = {
        let state = state.clone();
        let shutdown = shutdown.clone();
        task::LxTask::spawn("balance-poll", async move {
            let mut interval = tokio::time::interval(state.config.balance_poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => state.balance.poll_once().await,
                    _ = shutdown.recv() => break,
                }
            }
        })
    };

    let scheduler_task = {
        let state = state.clone();
        let shutdown = shutdown.clone();
        task::LxTask::spawn("autonomy-scheduler", async move {
            let mut interval = tokio::time::interval(state.config.autonomy_queue_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => state.scheduler.tick().await,
                    _ = shutdown.recv() => break,
                }
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(%bind_addr, "listening");

    let router = http::router(state);
    let server_shutdown = shutdown.clone();
    let server_task = task::LxTask::spawn("http-server", async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.recv().await })
            .await;
    });

    let ctrlc_shutdown = shutdown.clone();
    task::LxTask::spawn("ctrlc-handler", async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            ctrlc_shutdown.send();
        }
    })
    .detach();

    server_task.logged().await;
    balance_task.logged().await;
    scheduler_task.logged().await;

    Ok(())
}
