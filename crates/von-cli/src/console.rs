//! Line-oriented stdin console driving a running node.

use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use von_types::{Vec2, VonResult};
use von_wire::Node;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Move(Vec2),
    Neighbors,
    Where,
    Leave,
    Help,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Err("empty command".to_string());
        };
        let command = match head {
            "move" | "m" => {
                let mut coord = |name: &str| -> Result<f64, String> {
                    let raw = words
                        .next()
                        .ok_or_else(|| format!("move needs <x> <y>, missing {name}"))?;
                    raw.parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .ok_or_else(|| format!("invalid {name}: '{raw}'"))
                };
                let x = coord("x")?;
                let y = coord("y")?;
                Command::Move(Vec2::new(x, y))
            }
            "neighbors" | "n" => Command::Neighbors,
            "where" | "w" => Command::Where,
            "leave" | "quit" | "exit" => Command::Leave,
            "help" | "?" => Command::Help,
            other => return Err(format!("unknown command '{other}', try 'help'")),
        };
        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument '{extra}'"));
        }
        Ok(command)
    }
}

/// Read commands from stdin until `leave`, end of input or Ctrl+C, then
/// leave the overlay.
pub async fn run(node: Arc<Node>) -> VonResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(Command::Leave) => break,
            Ok(command) => execute(&node, command).await,
            Err(e) => println!("{e}"),
        }
    }

    let missed = node.leave().await;
    for (addr, e) in &missed {
        warn!("VON: {} did not acknowledge leave: {}", addr, e);
    }
    node.shutdown().await;
    Ok(())
}

async fn execute(node: &Node, command: Command) {
    match command {
        Command::Move(position) => match node.move_to(position).await {
            Ok(missed) => {
                println!("moved to {} ({} neighbors)", position, node.neighbors().len());
                for (addr, e) in missed {
                    println!("  unreachable: {addr} ({e})");
                }
            }
            Err(e) => println!("move failed: {e}"),
        },
        Command::Neighbors => {
            let neighbors = node.neighbors();
            if neighbors.is_empty() {
                println!("no neighbors");
            }
            for n in neighbors {
                let link = if node.has_connection(&n.addr) { "connected" } else { "idle" };
                println!("  {:<24} {:<20} aoi {:<6} {}", n.addr, n.pos, n.aoi_radius, link);
            }
        }
        Command::Where => {
            let me = node.identity();
            println!(
                "{} at {} (aoi {}), listening on {}",
                me.addr,
                me.pos,
                me.aoi_radius,
                node.local_addr()
            );
        }
        Command::Help => println!("{}", crate::cli::AFTER_HELP),
        Command::Leave => {}
    }
}
