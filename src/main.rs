use clap::{Parser, Subcommand};
use imbue_core::{ImbueConfig, ImbueError, Item, RemoteBroker, Result};
use imbue_core::{BrokerClient, DEFAULT_NAMESPACE};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "imbue")]
#[command(about = "Clipboard broker: one clipboard across machines, containers, and shells")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a config file (defaults to the user config dir)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Broker address to connect to (defaults to the configured server)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Shared secret (must match the broker)
    #[arg(short, long, global = true)]
    token: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker in the foreground
    Serve,

    /// Copy stdin (or an argument) to the shared clipboard, like pbcopy
    Copy {
        /// Text to copy; stdin is read when omitted
        text: Option<String>,

        /// MIME type of the data being copied
        #[arg(short, long, default_value = "text/plain")]
        mime: String,

        /// Clipboard namespace
        #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,
    },

    /// Print the shared clipboard to stdout, like pbpaste
    Paste {
        /// Preferred MIME type to output
        #[arg(short, long, default_value = "text/plain")]
        mime: String,

        #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,
    },

    /// Stream clipboard updates to stdout
    Watch {
        #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,

        /// MIME types to accept (repeatable; empty = all)
        #[arg(short, long)]
        accept: Vec<String>,

        /// Only print the MIME types present, not the payloads
        #[arg(long)]
        metadata_only: bool,
    },

    /// Show connected peers and the upstream connection
    Status,

    /// Start the broker daemon in the background
    Daemon,

    /// Stop the running daemon
    Stop,

    /// Show whether the daemon is running
    DaemonStatus,

    /// Generate the default configuration file
    Config,
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

    if let Some(Commands::Config) = args.command {
        let config_path = ImbueConfig::config_path()?;
        let config = ImbueConfig::default();
        config.save().await?;
        println!("Generated default config at: {}", config_path.display());
        return Ok(());
    }

    let config = if let Some(ref config_path) = args.config {
        ImbueConfig::load_from(std::path::Path::new(config_path)).await?
    } else {
        ImbueConfig::load().await?
    };

    let server_flag = args.server.clone();
    let token_flag = args.token.clone();

    match args.command {
        Some(Commands::Serve) => {
            let daemon = imbue_daemon::Daemon::new(config)?;
            let shutdown = CancellationToken::new();
            {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("interrupted, shutting down");
                    shutdown.cancel();
                });
            }
            daemon.run(shutdown).await?;
        }

        Some(Commands::Copy {
            text,
            mime,
            namespace,
        }) => {
            let data = match text {
                Some(text) => text.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buf).await?;
                    buf
                }
            };
            if data.is_empty() {
                return Ok(());
            }
            let client = connect(&server_flag, &token_flag, &config)?;
            client
                .publish(&config.node.source, &namespace, vec![Item::new(mime, data)])
                .await?;
        }

        Some(Commands::Paste { mime, namespace }) => {
            let client = connect(&server_flag, &token_flag, &config)?;
            let (_, _, items) = client.retrieve(&namespace, &[mime.clone()]).await?;
            for item in items {
                if item.mime == mime {
                    use std::io::Write;
                    std::io::stdout().write_all(&item.data)?;
                    return Ok(());
                }
            }
        }

        Some(Commands::Watch {
            namespace,
            accept,
            metadata_only,
        }) => {
            let client = connect(&server_flag, &token_flag, &config)?;
            let mut sub = client.subscribe(&namespace, &accept, metadata_only).await?;
            eprintln!("watching '{}' (ctrl-c to stop)", namespace);
            loop {
                let frame = tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    frame = sub.next() => frame,
                };
                match frame? {
                    Some(frame) => {
                        if metadata_only {
                            println!(
                                "{}\t{}\t{}",
                                frame.source,
                                frame.namespace,
                                frame.available_types.join(",")
                            );
                            continue;
                        }
                        for item in &frame.items {
                            if item.mime == "text/plain" {
                                println!(
                                    "[{}] {}",
                                    frame.source,
                                    String::from_utf8_lossy(&item.data)
                                );
                            } else {
                                println!(
                                    "[{}] <{}: {} bytes>",
                                    frame.source,
                                    item.mime,
                                    item.data.len()
                                );
                            }
                        }
                    }
                    None => {
                        eprintln!("stream closed by broker");
                        break;
                    }
                }
            }
        }

        Some(Commands::Status) => {
            let client = connect(&server_flag, &token_flag, &config)?;
            let (peers, upstream) = client.inspect().await?;

            println!("Peers ({}):", peers.len());
            for peer in &peers {
                let accepts = if peer.accepted_types.is_empty() {
                    "all".to_string()
                } else {
                    peer.accepted_types.join(",")
                };
                println!(
                    "  {:<28} {:<10} ns={:<10} accepts={} source={}",
                    peer.id,
                    format!("{:?}", peer.role).to_lowercase(),
                    if peer.namespace.is_empty() {
                        "*"
                    } else {
                        &peer.namespace
                    },
                    accepts,
                    peer.source,
                );
            }
            match upstream {
                Some(up) => {
                    let state = match up.connected_at {
                        Some(at) => format!("connected since {}", at.to_rfc3339()),
                        None => "disconnected".to_string(),
                    };
                    println!("Upstream: {} ({})", up.addr, state);
                }
                None => println!("Upstream: none"),
            }
        }

        Some(Commands::Daemon) => match imbue_daemon::is_daemon_running()? {
            Some(pid) => println!("Daemon already running (PID: {})", pid),
            None => {
                let pid = spawn_daemon(&args)?;
                println!("Daemon started with PID: {}", pid);
            }
        },

        Some(Commands::Stop) => match imbue_daemon::is_daemon_running()? {
            Some(pid) => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{kill, Signal};
                    use nix::unistd::Pid;

                    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                        .map_err(|e| ImbueError::Other(format!("Failed to stop daemon: {}", e)))?;
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    match imbue_daemon::is_daemon_running()? {
                        Some(_) => println!("Daemon stop initiated (PID: {})", pid),
                        None => println!("Daemon stopped"),
                    }
                }
                #[cfg(not(unix))]
                println!("Daemon stop not supported on this platform. PID: {}", pid);
            }
            None => println!("Daemon is not running"),
        },

        Some(Commands::DaemonStatus) => match imbue_daemon::is_daemon_running()? {
            Some(pid) => {
                println!("Daemon is running (PID: {})", pid);
                println!("Log file: {}", imbue_daemon::get_log_file_path()?.display());
            }
            None => println!("Daemon is not running"),
        },

        Some(Commands::Config) => {
            unreachable!("Config command is handled before config loading")
        }

        None => {
            use clap::CommandFactory;
            Args::command().print_help()?;
            println!();
        }
    }

    Ok(())
}

fn connect(
    server: &Option<String>,
    token: &Option<String>,
    config: &ImbueConfig,
) -> Result<RemoteBroker> {
    let addr = server.clone().unwrap_or_else(|| config.client_addr());
    let token = token.clone().or_else(|| config.server.token.clone());
    RemoteBroker::new(addr, token, config.node.source.clone())
}

/// Starts `imbued` as a detached background process with output redirected
/// to the daemon log file.
fn spawn_daemon(args: &Args) -> Result<u32> {
    use std::process::{Command, Stdio};

    let current_exe = std::env::current_exe()
        .map_err(|e| ImbueError::Other(format!("Failed to get current executable: {}", e)))?;
    let imbued = current_exe.with_file_name("imbued");
    let program = if imbued.exists() {
        imbued
    } else {
        std::path::PathBuf::from("imbued")
    };

    let log_path = imbue_daemon::get_log_file_path()?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(ImbueError::Io)?;

    let mut cmd = Command::new(&program);
    if let Some(ref config_path) = args.config {
        cmd.arg("--config").arg(config_path);
    }
    if args.verbose {
        cmd.arg("--verbose");
    }
    cmd.stdout(log_file.try_clone().map_err(ImbueError::Io)?)
        .stderr(log_file)
        .stdin(Stdio::null());

    let child = cmd
        .spawn()
        .map_err(|e| ImbueError::Other(format!("Failed to spawn daemon process: {}", e)))?;
    Ok(child.id())
}
