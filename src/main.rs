use crate::config::{Config, ConfigError, DEFAULT_PORT};
use crate::scheduler::Daemon;
use anyhow::Context;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod interface;
mod protocol;
mod query;
mod radio;
mod scheduler;
mod snapshot;
mod store;
mod transport;

use clap::{ArgAction, Args, Parser, Subcommand};

/// etxd: link-quality (ETX) measurement daemon for wireless mesh nodes
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground (default)
    Run(RunArgs),
    /// Validate configuration
    Validate(RunArgs),
    /// Show the neighbor snapshot of a running daemon
    Show {
        /// Snapshot server URL (default: http://<eth0 address>:9157)
        #[arg(long)]
        api: Option<String>,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,
    /// Query port; probes use PORT + 1
    #[arg(short, long)]
    port: Option<u16>,
    /// Probe interval in seconds
    #[arg(short, long)]
    interval: Option<u64>,
    /// Statistics window in seconds
    #[arg(short, long)]
    window: Option<u64>,
    /// Increase verbosity (-D, -DD)
    #[arg(short = 'D', action = ArgAction::Count)]
    debug: u8,
    /// Snapshot server address, overriding the management interface
    #[arg(long)]
    http_listen: Option<SocketAddr>,
    /// Wireless interfaces to measure
    interfaces: Vec<String>,
}

impl RunArgs {
    /// Configuration file (if any) with command-line values on top.
    fn load_config(&self) -> Result<Config, ConfigError> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(interval) = self.interval {
            cfg.interval = interval;
        }
        if let Some(window) = self.window {
            cfg.window = window;
        }
        if let Some(addr) = self.http_listen {
            cfg.http_listen = Some(addr);
        }
        if !self.interfaces.is_empty() {
            cfg.interfaces = self.interfaces.clone();
        }
        cfg.verbosity = cfg.verbosity.max(self.debug);
        Ok(cfg)
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run(cli.run)) {
        Commands::Run(args) => {
            let config = args.load_config();
            init_tracing(config.as_ref().map_or(args.debug, |c| c.verbosity));
            run_daemon(config?).await
        }
        Commands::Validate(args) => {
            init_tracing(args.debug);
            validate_config(&args)
        }
        Commands::Show { api } => show_state(api).await,
    }
}

fn validate_config(args: &RunArgs) -> anyhow::Result<()> {
    let source = args.config.as_deref().unwrap_or("<command line>");
    match args.load_config().and_then(|cfg| cfg.validate().map(|()| cfg)) {
        Ok(cfg) => {
            info!("Configuration '{}' is valid.", source);
            info!("Interfaces: {}", cfg.interfaces.join(", "));
            info!(
                "Query port: {}, probe port: {}",
                cfg.port,
                cfg.probe_port()
            );
            info!("Interval: {}s, window: {}s", cfg.interval, cfg.window);
            for name in cfg.interfaces.iter().filter(|name| !interface::exists(name)) {
                warn!("Interface {} does not exist on this host", name);
            }
            Ok(())
        }
        Err(e) => {
            error!("Configuration '{}' is INVALID: {}", source, e);
            Err(anyhow::anyhow!("Invalid config"))
        }
    }
}

async fn run_daemon(mut config: Config) -> anyhow::Result<()> {
    config.validate().context("Invalid configuration")?;

    config.interfaces.retain(|name| {
        let found = interface::exists(name);
        if !found {
            warn!("Interface {} does not exist, ignoring it", name);
        }
        found
    });
    if config.interfaces.is_empty() {
        anyhow::bail!("None of the configured interfaces exist");
    }

    info!(
        "Starting etxd on {} (interval {}s, window {}s)",
        config.interfaces.join(", "),
        config.interval,
        config.window
    );

    let config = Arc::new(config);
    let daemon = Daemon::new(config.clone());
    let shutdown = CancellationToken::new();

    let loopback = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, config.port));
    // stays open until the daemon returns
    let query_listener = query::listen(loopback, daemon.handle())
        .with_context(|| format!("Unable to listen for queries on {}", loopback))?;
    info!("Query server listening on {}", query_listener.local_addr());

    let http_addr = config.http_listen.or_else(|| {
        interface::ipv4_address(&config.http_interface)
            .map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, config.port)))
    });
    match http_addr {
        Some(addr) => {
            let handle = daemon.handle();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                info!("Snapshot server running at http://{}", addr);
                if let Err(e) = snapshot::serve(addr, handle, snapshot::hostname(), stop).await {
                    error!("Snapshot server error: {}", e);
                }
            });
        }
        None => warn!(
            "No address on {}, snapshot server disabled",
            config.http_interface
        ),
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let stop = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
        stop.cancel();
    });

    daemon.run(shutdown).await;
    Ok(())
}

async fn show_state(api: Option<String>) -> anyhow::Result<()> {
    let api_url = match api {
        Some(url) => url,
        None => {
            let name = Config::default().http_interface;
            let ip = interface::ipv4_address(&name)
                .with_context(|| format!("No IPv4 address on {}, pass --api", name))?;
            format!("http://{}:{}", ip, DEFAULT_PORT)
        }
    };

    match reqwest::get(&api_url).await {
        Ok(resp) => {
            let state = resp.json::<snapshot::Snapshot>().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Err(e) => eprintln!("Failed to connect to {}: {}", api_url, e),
    }
    Ok(())
}
