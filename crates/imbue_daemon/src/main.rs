use clap::Parser;
use futures_util::stream::StreamExt;
use imbue_core::{ImbueConfig, Result};
use imbue_daemon::Daemon;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "imbued")]
#[command(about = "imbue clipboard broker daemon")]
struct Args {
    #[arg(short, long)]
    config: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let config = if let Some(config_path) = args.config {
        ImbueConfig::load_from(std::path::Path::new(&config_path)).await?
    } else {
        ImbueConfig::load().await?
    };

    imbue_daemon::write_pid_file()?;
    info!("imbued starting with PID {}", std::process::id());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut signals = match Signals::new([SIGTERM]) {
                Ok(signals) => signals,
                Err(e) => {
                    error!("Failed to create signal handler: {}", e);
                    return;
                }
            };
            while let Some(signal) = signals.next().await {
                if signal == SIGTERM {
                    info!("Received SIGTERM, shutting down gracefully");
                    shutdown.cancel();
                    break;
                }
            }
        });
    }

    let daemon = Daemon::new(config)?;
    let result = daemon.run(shutdown).await;

    if let Err(e) = imbue_daemon::remove_pid_file() {
        error!("Failed to remove PID file: {}", e);
    }
    result
}
