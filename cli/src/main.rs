// meshbase — command-line front end for the mesh core
//
// Inspect and edit settings, decode captured envelopes, and run meshes on
// the simulated air.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use meshbase_core::message::{peek_message_type, MeshEnvelope, MessageType};
use meshbase_core::sim::SimNetwork;
use meshbase_core::MeshEvent;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "meshbase")]
#[command(about = "meshbase — flood mesh over short-range radio links", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show this installation's identity
    Identity,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Decode a hex-encoded envelope
    Decode { hex: String },
    /// Run nodes on the simulated air and send a message across them
    Simulate {
        #[arg(short, long, default_value = "3")]
        nodes: usize,
        #[arg(short, long, value_enum, default_value = "line")]
        topology: Topology,
        #[arg(short, long, default_value = "hello mesh")]
        message: String,
        /// Deliver to every node instead of the last one
        #[arg(short, long)]
        broadcast: bool,
        /// Simulated seconds to wait for each phase
        #[arg(long, default_value = "60")]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Path,
    Reset,
}

#[derive(Clone, Copy, ValueEnum)]
enum Topology {
    /// Each node reaches only its two neighbors
    Line,
    /// Every node reaches every other
    Full,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identity => cmd_identity().await,
        Commands::Config { action } => cmd_config(action).await,
        Commands::Decode { hex } => cmd_decode(&hex),
        Commands::Simulate {
            nodes,
            topology,
            message,
            broadcast,
            timeout,
        } => cmd_simulate(nodes, topology, message, broadcast, timeout).await,
    }
}

async fn cmd_identity() -> Result<()> {
    let mut config = config::Config::load()?;
    let had_identity = config.identity.is_some();
    let identity = config.identity();
    if !had_identity {
        config.save()?;
    }

    println!("{}", "Identity Information".bold());
    println!();
    println!("  {:<10} {}", "Identity:".bright_cyan(), identity);
    println!("  {:<10} {}", "Short:".bright_cyan(), identity.short());
    println!("  {:<10} {}", "Hex:".bright_cyan(), hex::encode(identity.to_bytes()));
    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }

        ConfigAction::Reset => {
            config.mesh = meshbase_core::MeshConfig::default();
            config.save()?;
            println!("{} Mesh settings reset to defaults", "✓".green());
        }
    }

    Ok(())
}

fn cmd_decode(input: &str) -> Result<()> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = hex::decode(&cleaned).context("Input is not valid hex")?;

    let message_type = peek_message_type(&raw).context("Not an envelope")?;
    let envelope = MeshEnvelope::decode(&raw).context("Failed to decode envelope")?;

    println!("{}", "Envelope".bold());
    println!("  {:<12} {:?} ({})", "type".bright_cyan(), message_type, message_type.code());
    println!("  {:<12} {}", "hop limit".bright_cyan(), envelope.hop_limit);
    println!("  {:<12} {}", "message id".bright_cyan(), envelope.message_id);
    println!("  {:<12} {}", "sender".bright_cyan(), envelope.sender);
    println!("  {:<12} {} bytes", "body".bright_cyan(), envelope.body.len());

    match message_type {
        MessageType::SendMessage => {}
        MessageType::Ack => {
            let ack = envelope.ack_body().context("Failed to decode ack body")?;
            println!();
            println!("{}", "Ack".bold());
            println!("  {:<12} {:?}", "message".bright_cyan(), ack.message);
            return Ok(());
        }
        _ => {
            println!("  {}", "(body not decoded for this type)".dimmed());
            return Ok(());
        }
    }

    let body = envelope.send_body().context("Failed to decode body")?;
    println!();
    println!("{}", "Body".bold());
    println!("  {:<12} {}", "command".bright_cyan(), body.command);
    println!("  {:<12} {}", "broadcast".bright_cyan(), body.is_broadcast);
    match body.destination {
        Some(destination) => println!("  {:<12} {}", "destination".bright_cyan(), destination),
        None => println!("  {:<12} {}", "destination".bright_cyan(), "(none)".dimmed()),
    }
    match std::str::from_utf8(&body.msg) {
        Ok(text) => println!("  {:<12} {:?}", "msg".bright_cyan(), text),
        Err(_) => println!("  {:<12} {}", "msg".bright_cyan(), hex::encode(&body.msg)),
    }
    Ok(())
}

async fn cmd_simulate(
    count: usize,
    topology: Topology,
    message: String,
    broadcast: bool,
    timeout: u64,
) -> Result<()> {
    if count < 2 {
        anyhow::bail!("A mesh needs at least 2 nodes");
    }
    let config = config::Config::load()?;
    let pairs: Vec<(usize, usize)> = match topology {
        Topology::Line => (1..count).map(|b| (b - 1, b)).collect(),
        Topology::Full => (0..count)
            .flat_map(|a| (a + 1..count).map(move |b| (a, b)))
            .collect(),
    };
    let mut net = SimNetwork::with_config(count, pairs, config.mesh)
        .context("Failed to build simulated mesh")?;
    let limit = Duration::from_secs(timeout);

    println!("{}", "meshbase — Simulating...".bold());
    println!();
    for i in 0..count {
        let sim = net.sim_node(i);
        println!("  {} {} {}", sim.name.bright_cyan(), sim.address, sim.node.identity());
    }
    println!();

    info!(nodes = count, "starting simulated mesh");
    net.start_all();
    if !net.run_until(limit, |n| n.fully_linked()) {
        print_events(&mut net);
        anyhow::bail!("Nodes did not link up within {}s", timeout);
    }
    println!("{} All links up after {:?}", "✓".green(), net.now());
    print_events(&mut net);

    let last = count - 1;
    let target = net.node(last).identity();
    let id = if broadcast {
        net.node(0).send_to_all(message.as_bytes())?
    } else {
        net.node(0).send(message.as_bytes(), target)?
    };
    info!(%id, broadcast, "message sent from node-0");
    println!("{} node-0 sent message {}", "✓".green(), id);

    let delivered = net.run_until(limit, |n| {
        n.events(last)
            .iter()
            .any(|e| matches!(e, MeshEvent::DataReceived { .. }))
    });
    net.run_for(Duration::from_secs(1));
    print_events(&mut net);

    if !delivered {
        anyhow::bail!("Message did not reach node-{} within {}s", last, timeout);
    }
    println!();
    println!("{}", "Message delivered!".green().bold());
    Ok(())
}

fn print_events(net: &mut SimNetwork) {
    for i in 0..net.len() {
        let name = net.sim_node(i).name.clone();
        for event in net.drain_events(i) {
            let line = match event {
                MeshEvent::NeighborDiscovered { name: peer, address } => {
                    format!("link up with {} ({})", peer.unwrap_or_default(), address).dimmed()
                }
                MeshEvent::NeighborConnected(n) => {
                    format!("neighbor {} connected as {}", n.name, n.role).green()
                }
                MeshEvent::NeighborDisconnected(n) => {
                    format!("neighbor {} disconnected", n.name).yellow()
                }
                MeshEvent::DataReceived {
                    sender,
                    data,
                    broadcast,
                    ..
                } => format!(
                    "received {:?} from {}{}",
                    String::from_utf8_lossy(&data),
                    sender.short(),
                    if broadcast { " (broadcast)" } else { "" }
                )
                .bright_magenta(),
            };
            println!("  {:<8} {}", name.bright_cyan(), line);
        }
    }
}
