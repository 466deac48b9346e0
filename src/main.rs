//! browsectl - browser control session daemon
//!
//! Main entry point for the CLI application.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use browsectl::bridge::{host, peer};
use browsectl::core::config::{EngineKind, Transport};
use browsectl::{Client, Config, Daemon, Engine, MemoryEngine, Registry};

/// browsectl - drive a browser through a per-session daemon
#[derive(Parser, Debug)]
#[command(name = "browsectl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Session name (defaults to BROWSECTL_SESSION or "default")
    #[arg(long, short = 's', global = true)]
    session: Option<String>,

    /// Directory for session sockets and pid files
    #[arg(long, global = true)]
    socket_dir: Option<PathBuf>,

    /// Automation engine for newly spawned daemons
    #[arg(long, global = true, value_parser = ["bridge", "memory"])]
    engine: Option<String>,

    /// JSON page fixtures for the memory engine
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,

    /// Address daemons over TCP loopback
    #[arg(long, global = true)]
    tcp: bool,

    /// Enable debug logging on stderr
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one command to the session, starting its daemon if needed
    Send {
        /// Action name, e.g. navigate, snapshot, click
        action: Option<String>,

        /// Command fields as a JSON object, e.g. '{"url":"https://example.com"}'
        fields: Option<String>,

        /// Send a complete raw command instead of action + fields
        #[arg(long, conflicts_with_all = ["action", "fields"])]
        json: Option<String>,
    },

    /// Run the session daemon in the foreground
    Daemon,

    /// Attach a host to the session's bridge
    BridgeHost {
        /// Answer bridge calls from the in-memory engine instead of relaying stdio
        #[arg(long)]
        memory: bool,
    },

    /// List live sessions
    Sessions,

    /// Close the session's browser and stop its daemon
    Close,

    /// Show the active configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "browsectl=debug" } else { "browsectl=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Stdout belongs to responses and bridge frames
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Resolves on ctrl-c, or on SIGTERM where there is one
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = interrupted() => tracing::info!("interrupted, shutting down"),
                    _ = term.recv() => tracing::info!("terminated, shutting down"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    interrupted().await;
    tracing::info!("interrupted, shutting down");
}

/// Ctrl-c; never resolves if the handler cannot be installed
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.verbose);

    // Build configuration
    let mut config = Config::load();

    // Apply CLI overrides
    if let Some(dir) = args.socket_dir {
        config.daemon.socket_dir = Some(dir);
    }
    if let Some(engine) = args.engine.as_deref() {
        config.engine.kind = match engine {
            "memory" => EngineKind::Memory,
            _ => EngineKind::Bridge,
        };
    }
    if let Some(fixtures) = args.fixtures {
        config.engine.fixtures = Some(fixtures);
    }
    if args.tcp {
        config.daemon.transport = Transport::Tcp;
    }
    let session = args
        .session
        .unwrap_or_else(|| config.session.default_name.clone());

    match args.command {
        Commands::Send { action, fields, json } => {
            let registry = Registry::new(config);
            let endpoint = registry.ensure_running(&session).await?;
            let mut client = Client::connect(&endpoint).await?;

            let response = match (json, action) {
                (Some(raw), _) => {
                    let command: Value = serde_json::from_str(&raw).context("--json is not valid JSON")?;
                    client.send_value(&command).await?
                }
                (None, Some(action)) => {
                    let fields = match fields {
                        Some(raw) => serde_json::from_str(&raw).context("fields are not valid JSON")?,
                        None => Value::Null,
                    };
                    client.request(&action, fields).await?
                }
                (None, None) => anyhow::bail!("give an action or --json"),
            };

            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                std::process::exit(1);
            }
        }

        Commands::Daemon => {
            let daemon = Daemon::new(&session, config)?;
            let token = daemon.shutdown_token();
            tokio::spawn(async move {
                shutdown_signal().await;
                token.cancel();
            });
            daemon.run().await?;
        }

        Commands::BridgeHost { memory } => {
            let registry = Registry::new(config.clone());
            let endpoint = registry.bridge_endpoint(&session)?;
            if memory {
                let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::from_config(&config.engine)?);
                let stream = endpoint
                    .connect()
                    .await
                    .with_context(|| format!("cannot reach bridge at {}", endpoint))?;
                tracing::info!(endpoint = %endpoint, "serving bridge from the memory engine");
                peer::serve(stream, engine).await?;
            } else {
                host::relay_stdio(&endpoint).await?;
            }
        }

        Commands::Sessions => {
            let registry = Registry::new(config);
            let sessions = registry.list().await?;
            if sessions.is_empty() {
                println!("No live sessions");
            }
            for info in sessions {
                match info.pid {
                    Some(pid) => println!("{}\tpid {}\t{}", info.name, pid, info.endpoint),
                    None => println!("{}\t-\t{}", info.name, info.endpoint),
                }
            }
        }

        Commands::Close => {
            let registry = Registry::new(config);
            let endpoint = registry.endpoint(&session)?;
            if !endpoint.is_live().await {
                println!("Session '{}' is not running", session);
                return Ok(());
            }
            let mut client = Client::connect(&endpoint).await?;
            let response = client.request("close", Value::Null).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Config { init } => {
            if init {
                let path = config.save()?;
                println!("Wrote {}", path.display());
            } else {
                println!("# {}", Config::config_file().display());
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}
