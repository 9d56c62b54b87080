use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use nftbal::api;
use nftbal::config::{self, Cli};
use nftbal::net::SystemNet;
use nftbal::nft::{NftEmitter, RuleEmitter, RuleRequest};
use nftbal::registry::Registry;
use nftbal::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Daemon mode: re-exec detached ──────────────────────────────
    if cli.daemon && std::env::var_os("NFTBAL_DAEMON_CHILD").is_none() {
        let args: Vec<String> = std::env::args().skip(1).collect();
        std::process::Command::new(std::env::current_exe()?)
            .args(args)
            .env("NFTBAL_DAEMON_CHILD", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        return Ok(());
    }

    // ── Tracing ────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nftbal={},tower_http=info", cli.log)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.log_output == "json" {
        builder.json().init();
    } else {
        builder.init();
    }

    tracing::info!("nftbal starting");

    // ── Auth key ───────────────────────────────────────────────────
    let auth_key = std::env::var("NFTBAL_SERVER_KEY")
        .ok()
        .filter(|k| !k.is_empty())
        .or_else(|| cli.key.clone());

    // ── Registry ───────────────────────────────────────────────────
    let masq_mark = cli.masq_mark()?;
    let emitter = Arc::new(NftEmitter::new(cli.serial));

    // A previous run may have left rules behind.
    if let Err(e) = emitter.rulerize(&RuleRequest::FlushAll) {
        tracing::warn!(error = %e, "initial rule flush failed (is nft available?)");
    }

    let mut reg = Registry::new(emitter, Arc::new(SystemNet::default()), masq_mark);

    if let Some(path) = &cli.config {
        config::load_file(&mut reg, path)
            .map_err(|e| anyhow::anyhow!("loading {}: {e}", path.display()))?;
        tracing::info!(
            farms = reg.total_farms(),
            addresses = reg.total_addresses(),
            policies = reg.total_policies(),
            "configuration loaded"
        );
        if let Err(e) = reg.rulerize_all() {
            tracing::error!(error = %e, "initial rule generation incomplete");
        }
    }

    if cli.exit {
        tracing::info!("exit mode, not starting the server");
        return Ok(());
    }

    let state = AppState {
        registry: Arc::new(Mutex::new(reg)),
        auth_key,
    };

    // ── Ether re-resolution timer ──────────────────────────────────
    let refresh = state.registry.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.tick().await;
        loop {
            tick.tick().await;
            refresh.lock().refresh_netinfo();
        }
    });

    // ── Server ─────────────────────────────────────────────────────
    let app = api::router(state.clone()).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", cli.bind_host(), cli.port);
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_state.registry.lock().teardown();
            tracing::info!("shutting down, bye");
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
