//! dnsveil CLI
//!
//! Runs the DNS forwarder in the foreground and exposes the event
//! channel a GUI front-end attaches to.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dnsveil_engine::{
    Config, Event, EventHandler, EventSender, EventServer, Proxy, ProxyHooks, DEFAULT_ENDPOINT,
};

/// dnsveil - redirect all system DNS traffic into a DoH upstream
#[derive(Parser)]
#[command(name = "dnsveil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dnsveil.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy in the foreground
    Run,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "dnsveil.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run => run(cli.config).await,
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Lifecycle requests a UI sends over the event channel
enum UiCommand {
    Enable,
    Disable,
    Status,
}

/// Event-channel handler that turns inbound frames into commands for
/// the run loop
struct UiBridge {
    commands: mpsc::Sender<UiCommand>,
}

#[async_trait::async_trait]
impl EventHandler for UiBridge {
    async fn on_event(&self, event: Event) {
        let command = match event.name.as_str() {
            "enable" | "start" => UiCommand::Enable,
            "disable" | "stop" => UiCommand::Disable,
            "status" => UiCommand::Status,
            other => {
                debug!("Ignoring event: {}", other);
                return;
            }
        };
        let _ = self.commands.send(command).await;
    }

    async fn on_connected(&self) {
        // greet a fresh client with the current state
        let _ = self.commands.send(UiCommand::Status).await;
    }
}

/// Engine hooks: log everything, mirror state changes and errors onto
/// the event channel when one is attached
struct EngineHooks {
    events: Option<EventSender>,
}

#[async_trait::async_trait]
impl ProxyHooks for EngineHooks {
    async fn on_state_change(&self, running: bool) {
        info!(
            "proxy {}",
            if running { "started" } else { "stopped" }
        );
        if let Some(ref events) = self.events {
            let _ = events.send(Event::status(running));
        }
    }

    async fn on_query(&self, msg_id: u16, qname: &str) {
        debug!("query {:04x} {}", msg_id, qname);
    }

    async fn on_info(&self, message: &str) {
        info!("{}", message);
    }

    async fn on_error(&self, err: &dnsveil_engine::Error) {
        error!("{}", err);
        if let Some(ref events) = self.events {
            let _ = events.send(Event::error(err.to_string()));
        }
    }
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;
    info!("Configuration loaded from {:?}", config_path);

    #[cfg(windows)]
    {
        veil_tun::windows::ensure_admin()
            .context("dnsveil needs to own the tunnel device and the resolver settings")?;
        if !veil_tun::windows::is_wintun_installed() {
            anyhow::bail!("WinTun driver not found; install it from https://www.wintun.net/");
        }
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let (command_tx, mut command_rx) = mpsc::channel(16);

    // Event channel for a UI front-end
    let events = if config.ipc.enabled {
        let endpoint = config
            .ipc
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let handler = Arc::new(UiBridge {
            commands: command_tx.clone(),
        });
        let (server, sender) = EventServer::new(endpoint, handler);
        let server_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = server.run(server_shutdown).await {
                error!("Event channel error: {}", e);
            }
        });
        Some(sender)
    } else {
        None
    };

    let hooks = Arc::new(EngineHooks {
        events: events.clone(),
    });
    let mut proxy = Proxy::new(config)
        .context("Failed to create proxy")?
        .with_hooks(hooks);

    proxy.start().await.context("Failed to start proxy")?;

    let shutdown_signal = wait_for_shutdown();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => break,
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    UiCommand::Enable => {
                        if let Err(e) = proxy.start().await {
                            error!("Failed to start proxy: {}", e);
                            if let Some(ref events) = events {
                                let _ = events.send(Event::error(e.to_string()));
                            }
                        }
                    }
                    UiCommand::Disable => {
                        if let Err(e) = proxy.stop().await {
                            error!("Failed to stop proxy: {}", e);
                        }
                    }
                    UiCommand::Status => {
                        if let Some(ref events) = events {
                            let _ = events.send(Event::status(proxy.started()));
                        }
                    }
                }
            }
        }
    }

    info!("Shutting down...");
    proxy.stop().await.context("Failed to stop proxy")?;
    let _ = shutdown_tx.send(());

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the configuration file and set your DoH upstream before running.");

    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c()
            .await
            .expect("Failed to register Ctrl-C handler");
        info!("Received Ctrl-C");
    }
}
