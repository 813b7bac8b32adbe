// Main binary: runs the control plane or talks to a running one
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use registrar_server::RegistrarConfig;
use std::io::stderr;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, registry};

mod cmd;

use cmd::client::ApiClient;
use cmd::transfer::{ExportArgs, ImportArgs};

#[derive(Parser, Debug)]
#[command(author, version, about = "Dynamic API resource registration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// YAML configuration file for `serve`
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server to talk to for client commands
    #[arg(
        long,
        global = true,
        env = "REGISTRAR_SERVER",
        default_value = "http://127.0.0.1:8080"
    )]
    server: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane and its HTTP API (default action)
    Serve(ServeArgs),
    /// List registrations and their conditions
    List,
    /// Show one registration as YAML
    Get {
        /// Registration name, e.g. widgets.example.com
        name: String,
    },
    /// Delete a registration; its instances are drained first
    Delete {
        /// Registration name, e.g. widgets.example.com
        name: String,
    },
    /// Export instances of a registered type as YAML
    Export(ExportArgs),
    /// Re-create exported instances under a (possibly different) registered type
    Import(ImportArgs),
}

#[derive(Parser, Debug, Default)]
struct ServeArgs {
    /// Listen address, overrides the config file and REGISTRAR_LISTEN
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

/// Default directives when RUST_LOG is unset
fn default_directives(verbose: bool, config_filter: Option<&str>) -> String {
    if let Some(filter) = config_filter {
        if !verbose {
            return filter.to_string();
        }
    }
    let level = if verbose { "debug" } else { "info" };
    format!(
        "registrar={level},registrar_server={level},tower_http=warn,hyper=warn,reqwest=warn,h2=warn",
        level = level
    )
}

fn load_config(cli: &Cli, args: &ServeArgs) -> Result<RegistrarConfig> {
    let mut config = RegistrarConfig::load(cli.config.as_deref()).wrap_err("failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let command = cli.command.as_ref();

    // Config only matters for serve, but its log filter is needed before the subscriber exists.
    let serve_config = match command {
        Some(Commands::Serve(args)) => Some(load_config(&cli, args)?),
        None => Some(load_config(&cli, &ServeArgs::default())?),
        _ => None,
    };

    let log_filter = serve_config.as_ref().and_then(|c| c.log_filter.as_deref());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(cli.verbose, log_filter)));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    let client = ApiClient::new(&cli.server);
    match cli.command {
        Some(Commands::Serve(_)) | None => {
            let config = serve_config.unwrap_or_default();
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Ctrl+C received, sending shutdown signal..."),
                    Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
                }
                let _ = shutdown_tx.send(true);
            });

            println!("Starting registrar on {} - press Ctrl+C to stop", config.listen);
            if let Err(e) = registrar_server::run(config, shutdown_rx).await {
                error!("Server failed to run: {:#}", e);
                return Err(color_eyre::eyre::eyre!("{:#}", e));
            }
        }
        Some(Commands::List) => cmd::registrations::list(&client).await?,
        Some(Commands::Get { name }) => cmd::registrations::get(&client, &name).await?,
        Some(Commands::Delete { name }) => cmd::registrations::delete(&client, &name).await?,
        Some(Commands::Export(args)) => cmd::transfer::export(&client, args).await?,
        Some(Commands::Import(args)) => cmd::transfer::import(&client, args).await?,
    }

    Ok(())
}
