//! von-node: run one node of a Voronoi overlay network.
//!
//! `von-node seed` starts a new overlay, `von-node join <gateway>` enters an
//! existing one. Either way the node then reads console commands from stdin.

mod cli;
mod config;
mod console;

use crate::cli::{Cli, Commands};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use von_types::{LogConfig, NodeConfig, VonResult};
use von_wire::Node;

/// Install the tracing subscriber described by the `[log]` section.
/// `RUST_LOG` takes priority over the configured level.
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    let file = log.file.as_ref().and_then(|path| match open_log_file(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("{e}, logging to stderr");
            None
        }
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (file, log.json) {
        (Some(file), true) => builder
            .json()
            .with_writer(std::sync::Mutex::new(file))
            .init(),
        (Some(file), false) => builder
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init(),
        (None, true) => builder.json().with_writer(std::io::stderr).init(),
        (None, false) => builder.with_writer(std::io::stderr).init(),
    }
}

/// Open `path` for appending, creating its directory first.
fn open_log_file(path: &Path) -> Result<File, String> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Cannot create log directory {}: {e}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Cannot open log file {}: {e}", path.display()))
}

async fn run(command: Commands, config: NodeConfig) -> VonResult<()> {
    let (node, _accept) = Node::start(&config).await?;
    let place = command.placement().clone();

    match &command {
        Commands::Seed { .. } => node.initial(place.position(), place.aoi),
        Commands::Join { gateway, .. } => {
            node.join(gateway, place.position(), place.aoi).await?;
        }
    }

    println!(
        "{} at {} with {} neighbors. Type 'help' for commands.",
        node.address(),
        node.position(),
        node.neighbors().len()
    );
    console::run(node).await
}

fn main() {
    let cli = Cli::parse();

    let (mut config, source) = config::load_config(cli.config.as_deref());
    cli.apply(&mut config);
    init_tracing(&config.log);
    source.log();

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        std::process::exit(2);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(cli.command, config)) {
        Ok(()) => info!("VON: node stopped"),
        Err(e) => {
            error!("VON: {e}");
            std::process::exit(1);
        }
    }
}
