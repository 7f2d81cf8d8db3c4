//! Tabinit binary.
//!
//! Runs as PID 1, or sends requests to a running instance.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tabinit::{
    logging, ControlClient, Init, InittabLoader, Runlevel, SupervisorConfig, TableLoader,
};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "tabinit",
    about = "Tabinit - inittab driven PID 1 process supervisor",
    version,
    author
)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Service table (overrides the configuration)
    #[arg(long)]
    inittab: Option<PathBuf>,

    /// Control FIFO (overrides the configuration)
    #[arg(long)]
    control_fifo: Option<PathBuf>,

    /// Don't require running as PID 1
    #[arg(long)]
    no_pid1: bool,

    /// Don't mount virtual filesystems
    #[arg(long)]
    no_mount: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as init system (PID 1)
    Init,

    /// Ask the running supervisor to change runlevel
    Telinit {
        /// Target runlevel
        level: Runlevel,
    },

    /// Ask the running supervisor to shut down
    Shutdown,

    /// Parse the service table and print its definitions
    Check {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command {
        Some(Commands::Init) | None => {
            logging::init(Some(&config.syslog));
            let init = Init::new(config)?;
            init.run().await?;
        }

        Some(Commands::Telinit { level }) => {
            logging::init(None);
            let payload: i32 = level
                .as_str()
                .parse()
                .map_err(|_| anyhow::anyhow!("runlevel {} has no numeric encoding", level))?;
            ControlClient::new(&config.control_fifo).change_runlevel(payload)?;
            info!(runlevel = %level, "Runlevel change requested");
        }

        Some(Commands::Shutdown) => {
            logging::init(None);
            ControlClient::new(&config.control_fifo).shutdown()?;
            info!("Shutdown requested");
        }

        Some(Commands::Check { json }) => {
            logging::init(None);
            let table = InittabLoader.load(&config.inittab)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&table.definitions)?);
            } else {
                print_table(&config, &table);
            }
        }
    }

    Ok(())
}

/// Defaults, then the configuration file, then command line flags.
fn resolve_config(cli: &Cli) -> anyhow::Result<SupervisorConfig> {
    let mut config = SupervisorConfig::load(cli.config.as_deref())?;

    if cli.no_pid1 {
        config.require_pid1 = false;
    }
    if cli.no_mount {
        config.mount_filesystems = false;
    }
    if let Some(inittab) = &cli.inittab {
        config.inittab = inittab.clone();
    }
    if let Some(fifo) = &cli.control_fifo {
        config.control_fifo = fifo.clone();
    }

    Ok(config)
}

fn print_table(config: &SupervisorConfig, table: &tabinit::ServiceTable) {
    let default = table
        .default_runlevel
        .as_ref()
        .unwrap_or(&config.default_runlevel);
    println!(
        "{} ({} definitions, default runlevel {})",
        config.inittab.display(),
        table.len(),
        default
    );

    for def in &table.definitions {
        println!(
            "  {:<8} {:<10} {:<8} {:?}  {}",
            def.id,
            def.runlevels.to_string(),
            def.action.to_string(),
            def.profile,
            def.command
        );
    }
}
