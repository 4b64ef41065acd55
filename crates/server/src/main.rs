use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, Level};

use benchnet_server::{data, listen, mgmt, session};

#[derive(Parser, Debug)]
#[command(name = "benchnet-server", about = "Benchnet monitoring server")]
struct Cli {
    /// Database file.
    #[arg(short = 'f', long, default_value = "benchsrv.db")]
    db: PathBuf,

    /// Client listen address.
    #[arg(long, default_value_t = format!("0.0.0.0:{}", benchnet_proto::CLIENT_PORT))]
    listen: String,

    /// Management listen address. Keep it on the loopback.
    #[arg(long, default_value_t = format!("127.0.0.1:{}", benchnet_proto::MGMT_PORT))]
    mgmt: String,

    /// Log debug detail.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    let ctx = data::start(&cli.db)
        .await
        .with_context(|| format!("can't init database {}", cli.db.display()))?;

    let clients = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("can't listen on {}", cli.listen))?;
    let mgmt_listener = TcpListener::bind(&cli.mgmt)
        .await
        .with_context(|| format!("can't listen on {}", cli.mgmt))?;

    let shutdown = Arc::new(Notify::new());
    let client_loop = tokio::spawn(listen::net_loop(
        clients,
        ctx.handle.clone(),
        shutdown.clone(),
        "client",
        session::handle,
    ));
    let mgmt_loop = tokio::spawn(listen::net_loop(
        mgmt_listener,
        ctx.handle.clone(),
        shutdown.clone(),
        "management",
        mgmt::handle,
    ));

    info!("RUNNING");
    wait_for_signal().await;
    info!("EXIT");

    shutdown.notify_waiters();
    let _ = client_loop.await;
    let _ = mgmt_loop.await;
    // last commit, then close the database
    ctx.shutdown().await;
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("can't install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
