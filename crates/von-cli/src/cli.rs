//! Clap CLI definitions for von-node.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use von_types::{Address, NodeConfig, Vec2};

pub const AFTER_HELP: &str = "\
Examples:
  von-node seed --x 0 --y 0                          Start a new overlay
  von-node --listen 0.0.0.0:8182 join von://host     Join through a gateway
  von-node join 10.0.0.5:8181 --x -3.5 --y 12 --aoi 50

Console commands (stdin):
  move <x> <y>    Move to a new position
  neighbors       List the current enclosing neighbors
  where           Show this node's identity
  leave           Leave the overlay and exit";

/// A node of a Voronoi overlay network.
#[derive(Parser, Debug)]
#[command(name = "von-node", version, about = "Voronoi overlay network node", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.von/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Socket address to listen on, overriding the config file.
    #[arg(long, global = true)]
    pub listen: Option<SocketAddr>,

    /// Address advertised to peers (`host:port`).
    #[arg(long, global = true)]
    pub advertise: Option<String>,

    /// Log level filter, overriding the config file.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new overlay with this node as its only member.
    Seed {
        #[command(flatten)]
        place: Placement,
    },
    /// Join an existing overlay through a gateway node.
    Join {
        /// Gateway address: `host:port` or `von://host[:port]`.
        gateway: Address,
        #[command(flatten)]
        place: Placement,
    },
}

impl Commands {
    pub fn placement(&self) -> &Placement {
        match self {
            Commands::Seed { place } | Commands::Join { place, .. } => place,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct Placement {
    /// X coordinate of the node.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub x: f64,

    /// Y coordinate of the node.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub y: f64,

    /// Area-of-interest radius.
    #[arg(long, default_value_t = 100)]
    pub aoi: u32,
}

impl Placement {
    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    pub fn apply(&self, config: &mut NodeConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(advertise) = &self.advertise {
            config.advertise = Some(advertise.clone());
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
    }
}
