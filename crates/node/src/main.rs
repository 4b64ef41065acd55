use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, Level};

use benchnet_node::config::NodeConfig;
use benchnet_node::jobs::Runner;
use benchnet_node::{session, store};

#[derive(Parser, Debug)]
#[command(name = "benchnet-node", about = "Benchnet monitoring node")]
struct Cli {
    /// Configuration file.
    #[arg(short = 'f', long, default_value = "benchnode.conf")]
    config: PathBuf,

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

    let cfg = NodeConfig::load(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;

    let db = store::open(&cfg.db)
        .await
        .with_context(|| format!("can't init database {}", cfg.db))?;

    let runner = Runner::new(db.clone());
    if let Err(e) = runner.load().await {
        let _ = db.close().await;
        anyhow::bail!("error while loading jobs from database: {e}");
    }

    let shutdown = Arc::new(Notify::new());
    let net = tokio::spawn(session::net_loop(
        cfg.clone(),
        db.clone(),
        runner.clone(),
        shutdown.clone(),
    ));

    info!("RUNNING");
    wait_for_signal().await;
    info!("EXIT");

    shutdown.notify_waiters();
    runner.stop_all().await;
    let _ = net.await;
    let _ = db.close().await;
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
