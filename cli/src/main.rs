// gnodemesh CLI - drive hierarchical mesh routing from the command line

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use gnodemesh_core::{AddressMap, Nip, RoutingConfig, SimNetwork, Topology};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gnodemesh")]
#[command(about = "Hierarchical mesh routing - simulate and inspect", long_about = None)]
#[command(version)]
struct Cli {
    /// Routing configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run probe rounds over a generated network and print the converged routes
    Simulate {
        #[arg(short, long, default_value = "8")]
        nodes: usize,
        #[arg(short, long, value_enum, default_value = "line")]
        topology: TopologyArg,
        /// Maximum number of probe rounds
        #[arg(short, long, default_value = "20")]
        rounds: usize,
        /// Round-trip time of every link in milliseconds
        #[arg(long, default_value = "10")]
        rtt: u64,
        /// Network id in hex (random when omitted)
        #[arg(long)]
        netid: Option<String>,
        /// Only print the summary
        #[arg(short, long)]
        quiet: bool,
    },
    /// Convert between a flat id and a dotted address
    Address { value: String },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as JSON
    Show,
    /// Validate a configuration file
    Validate { path: PathBuf },
    /// Write the defaults to the config file
    Init {
        #[arg(short, long)]
        force: bool,
    },
    Get { key: String },
    Set { key: String, value: String },
    List,
    /// Print the config file location
    Path,
}

#[derive(Clone, Copy, ValueEnum)]
enum TopologyArg {
    Line,
    Ring,
    Star,
}

impl From<TopologyArg> for Topology {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::Line => Topology::Line,
            TopologyArg::Ring => Topology::Ring,
            TopologyArg::Star => Topology::Star,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            topology,
            rounds,
            rtt,
            netid,
            quiet,
        } => cmd_simulate(
            cli.config.as_deref(),
            nodes,
            topology.into(),
            rounds,
            rtt,
            netid,
            quiet,
        ),
        Commands::Address { value } => cmd_address(cli.config.as_deref(), &value),
        Commands::Config { action } => cmd_config(cli.config, action),
    }
}

fn parse_netid(text: Option<String>) -> Result<u64> {
    match text {
        Some(text) => {
            let digits = text.trim_start_matches("0x");
            u64::from_str_radix(digits, 16).with_context(|| format!("Invalid netid: {}", text))
        }
        None => Ok(gnodemesh_core::random_netid()),
    }
}

fn format_netid(netid: u64) -> String {
    hex::encode(netid.to_be_bytes())
}

fn cmd_simulate(
    config_path: Option<&std::path::Path>,
    nodes: usize,
    topology: Topology,
    rounds: usize,
    rtt: u64,
    netid: Option<String>,
    quiet: bool,
) -> Result<()> {
    let (routing, _) = config::load(config_path)?;
    let netid = parse_netid(netid)?;

    tracing::info!(nodes, ?topology, rounds, "Starting simulation");
    let mut net = SimNetwork::generate(routing, topology, nodes, rtt, netid)
        .context("Failed to build the simulated network")?;

    println!(
        "{} {} nodes, {:?} topology, netid {}",
        "Simulation".bold(),
        nodes,
        topology,
        format_netid(netid).dimmed()
    );

    match net.run_until_quiet(2, rounds) {
        Some(rounds) => println!("{} Converged after {} rounds", "✓".green(), rounds),
        None => println!(
            "{} Still changing after {} rounds",
            "⚠".yellow(),
            rounds
        ),
    }

    if !quiet {
        println!();
        for node in net.nodes() {
            println!(
                "{} {}  ({} neighbours)",
                "Node".bold(),
                node.nip().to_string().bright_cyan(),
                node.neighbours().len()
            );
            let best = node.routes().best_routes();
            if best.is_empty() {
                println!("  {}", "(no routes)".dimmed());
            }
            for (level, dest, route) in best {
                let rem = route.rem();
                println!(
                    "  L{} {:<5} via {:<12} hops {:<3} rtt {:>7.1} ms",
                    level,
                    dest,
                    route.gateway.to_string(),
                    route.hops,
                    rem.rtt_ms
                );
            }
        }
    }

    let stats = net.stats();
    println!();
    println!("{}", "Statistics".bold());
    println!("  {:<16} {}", "rounds".bright_cyan(), stats.rounds);
    println!("  {:<16} {}", "frames".bright_cyan(), stats.frames);
    println!("  {:<16} {}", "tracers".bright_cyan(), stats.tracers);
    println!("  {:<16} {}", "route changes".bright_cyan(), stats.route_changes);
    println!("  {:<16} {}", "dropped".bright_cyan(), stats.dropped);

    if net.fully_connected() {
        println!("{} Every node reaches every other node", "✓".green());
    } else {
        println!("{} Some nodes are unreachable", "✗".red());
    }

    Ok(())
}

fn cmd_address(config_path: Option<&std::path::Path>, value: &str) -> Result<()> {
    let (routing, _) = config::load(config_path)?;
    let map: AddressMap<()> = AddressMap::new(routing.levels, routing.group_size, Box::new(|_, _| ()));

    if value.contains('.') {
        let nip: Nip = value
            .parse()
            .with_context(|| format!("Invalid address: {}", value))?;
        let flat = map.to_flat(&nip).context("Address outside the configured space")?;
        println!("{} = {}", nip.to_string().bright_cyan(), flat);
    } else {
        let flat: u64 = value
            .parse()
            .with_context(|| format!("Invalid flat id: {}", value))?;
        let nip = map.to_address(flat).context("Flat id outside the configured space")?;
        println!("{} = {}", flat, nip.to_string().bright_cyan());
    }
    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    let target = match &config_path {
        Some(path) => path.clone(),
        None => config::config_file()?,
    };

    match action {
        ConfigAction::Show => {
            let (routing, source) = config::load(config_path.as_deref())?;
            if let config::Source::File(path) = source {
                eprintln!("{} {}", "Loaded".dimmed(), path.display());
            }
            println!("{}", routing.to_json()?);
        }

        ConfigAction::Validate { path } => {
            let routing = config::load_file(&path)?;
            println!(
                "{} {} is valid ({} levels of {}, {} addresses)",
                "✓".green(),
                path.display(),
                routing.levels,
                routing.group_size,
                routing
                    .address_space()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".to_string())
            );
        }

        ConfigAction::Init { force } => {
            if target.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    target.display()
                );
            }
            config::save(&RoutingConfig::default(), &target)?;
            println!("{} Wrote defaults to {}", "✓".green(), target.display());
        }

        ConfigAction::Get { key } => {
            let (routing, _) = config::load(config_path.as_deref())?;
            println!("{} = {}", key.bright_cyan(), config::get(&routing, &key)?);
        }

        ConfigAction::Set { key, value } => {
            let (routing, _) = config::load(config_path.as_deref())?;
            let routing = config::set(&routing, &key, &value)?;
            config::save(&routing, &target)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::List => {
            let (routing, _) = config::load(config_path.as_deref())?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config::list(&routing)? {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", target.display());
        }
    }

    Ok(())
}
