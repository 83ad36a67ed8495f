use clap::{Parser, Subcommand};
use common::config::Config;
use common::ShutdownMessage;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    name = "kimo",
    version = "0.1.0",
    about = "correlates MySQL client connections with the processes that opened them."
)]
struct KimoArgs {
    #[clap(long, short, value_name = "PATH", default_value = "/etc/kimo.yaml")]
    config: PathBuf,
    #[clap(long, short)]
    debug: bool,
    #[clap(subcommand)]
    command: KimoCommand,
}

#[derive(Subcommand, Debug, Clone)]
enum KimoCommand {
    #[command(about = "run the per-host agent")]
    Agent,
    #[command(about = "run the correlation server")]
    Server,
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("Kimo receive ctrl_c signal {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg = format!("Kimo receive terminate signal {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn main() -> anyhow::Result<()> {
    let args = KimoArgs::parse();
    let mut config = Config::from_file(&args.config)?;
    if args.debug {
        config.debug = true;
    }

    let level = if config.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse()?)
        .add_directive("h2=INFO".parse()?)
        .add_directive("tower=INFO".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("KIMO")
        .build()?;

    info!("Kimo running config={config:?}");
    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
    runtime.block_on(async move {
        tokio::spawn(async move {
            let shutdown_msg = shutdown_signal().await;
            let _ = shutdown_tx.send(shutdown_msg);
        });
        match args.command {
            KimoCommand::Agent => agent::Agent::new(config.agent).run(shutdown_rx).await,
            KimoCommand::Server => server::Server::new(config.server)?.run(shutdown_rx).await,
        }
    })
}
