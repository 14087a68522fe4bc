use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use lucidcoder_reaper::{default_controller, Reaper};
use lucidcoder_registry::ProcessRegistry;
use lucidcoder_server::config::{config_path, load_config, LucidcoderConfig};
use lucidcoder_server::state::AppState;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "lucidcoder", version, about = "LucidCoder dev-server orchestrator and preview gateway")]
struct Cli {
    #[arg(
        long,
        default_value = "~/.lucidcoder",
        help = "Config root directory (contains config/, logs/ and projects.yaml)"
    )]
    config_root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the HTTP API server and preview gateway")]
    Serve {
        #[arg(long, help = "Override the port from server.listen")]
        port: Option<u16>,
    },
    #[command(subcommand, about = "Inspect and reclaim local ports")]
    Ports(PortsCommands),
    #[command(about = "Validate config files")]
    Validate,
}

#[derive(Subcommand)]
enum PortsCommands {
    #[command(about = "List the pids listening on a port")]
    Who {
        #[arg(help = "Port number")]
        port: u16,
    },
    #[command(about = "Kill whatever holds the given ports")]
    Free {
        #[arg(required = true, help = "Port numbers")]
        ports: Vec<u16>,
        #[arg(long, help = "Keep retrying until the ports are free or the wait times out")]
        wait: bool,
    },
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

/// Replaces the port of `server.listen`, keeping its host.
fn with_port(config: &mut LucidcoderConfig, port: u16) -> Result<()> {
    let mut addr = config.listen_addr()?;
    addr.set_port(port);
    config.server.listen = addr.to_string();
    Ok(())
}

fn reaper(config: &LucidcoderConfig) -> Reaper {
    Reaper::new(
        default_controller(),
        ProcessRegistry::new(),
        config.reaper.clone(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    cli.config_root = expand_home(&cli.config_root);

    let log_dir = cli.config_root.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "lucidcoder.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Validate => {
            let config = load_config(&cli.config_root)?;
            println!(
                "Config valid ({}). Listening on {}, debug routes {}.",
                config_path(&cli.config_root).display(),
                config.server.listen,
                if config.server.debug_routes { "on" } else { "off" }
            );
        }
        Commands::Serve { port } => {
            let mut config = load_config(&cli.config_root)?;
            if let Some(port) = port {
                with_port(&mut config, port)?;
            }
            let listen = config.server.listen.clone();
            let state = AppState::build(cli.config_root.clone(), config)?;
            lucidcoder_server::serve(state, &listen).await?;
        }
        Commands::Ports(PortsCommands::Who { port }) => {
            let config = load_config(&cli.config_root)?;
            let reaper = reaper(&config);
            let pids = reaper.find_pids_by_port(port).await;
            if pids.is_empty() {
                println!("Port {port} is free.");
            }
            for pid in pids {
                let note = if reaper.is_protected(pid) {
                    " (protected)"
                } else {
                    ""
                };
                println!("{port}\t{pid}{note}");
            }
        }
        Commands::Ports(PortsCommands::Free { ports, wait }) => {
            let config = load_config(&cli.config_root)?;
            let reaper = reaper(&config);
            let killed = reaper.ensure_ports_freed(&ports).await;
            println!("Signalled {} process(es).", killed.len());
            if wait {
                let freed = reaper
                    .wait_for_ports_to_free(
                        &ports,
                        config.reaper.port_wait_timeout(),
                        config.reaper.port_wait_interval(),
                    )
                    .await;
                if !freed {
                    anyhow::bail!("ports still in use after waiting: {ports:?}");
                }
                println!("Ports free.");
            }
        }
    }

    Ok(())
}
