//! fedavg-node: federated averaging node
//!
//! Entry point for the `fedavg-node` binary. `run` joins a real federation
//! over TCP, `simulate` runs a whole federation inside this process.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use fedavg_node::cli::{Cli, Commands, ConfigSubcommand};
use fedavg_node::config::{self, NodeConfig};
use fedavg_node::error::{Error, Result};
use fedavg_node::federation::{
    run_simulation, CoordinatorConfig, FederationCoordinator, FederationReport, SimulationConfig,
};
use fedavg_node::logging;
use fedavg_node::peer::{BootstrapConfig, PeerDirectory};
use fedavg_node::trainer::LogisticTrainer;
use fedavg_node::transport::TcpMesh;
use fedavg_node::version;

fn main() {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Simulate {
            nodes,
            rounds,
            retry_ms,
        } => {
            let level = if cli.quiet {
                tracing::Level::ERROR
            } else if cli.verbose > 0 {
                tracing::Level::DEBUG
            } else {
                tracing::Level::INFO
            };
            logging::init_simple(level)?;
            run_simulate(nodes, rounds, retry_ms)
        }
        Commands::Run { config, node } => {
            let cfg = NodeConfig::load_for_node(config.as_deref(), node.as_deref())?;

            // Guards must outlive the runtime so buffered log lines are flushed
            let _log_guards = logging::init_logging(&cfg.logging, cli.verbose, cli.quiet)?;

            let build = version::build_info();
            info!(
                version = %build.full_version(),
                target = %build.target,
                profile = %build.profile,
                "Starting fedavg-node"
            );

            run_node(cfg)
        }
    }
}

fn build_runtime(name: &str) -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name(name)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))
}

/// Join the configured federation over TCP
fn run_node(config: NodeConfig) -> Result<()> {
    let local_id = config.local_id()?.to_string();
    let partition = config.local_index()? as u64;

    info!(
        node = %local_id,
        peers = config.peers.len(),
        quorum = config.quorum(),
        rounds = config.federation.rounds,
        topic = %config.federation.topic,
        "Configuration loaded"
    );

    let runtime = build_runtime("fedavg-node")?;
    runtime.block_on(async move {
        let mesh = TcpMesh::new(config.mesh_config()?, local_id.clone());
        let directory = PeerDirectory::new(local_id, config.peer_entries(), config.bootstrap_config())?;
        let trainer = LogisticTrainer::new(config.trainer.clone(), partition)?;
        let coordinator = FederationCoordinator::new(
            config.coordinator_config(),
            directory,
            Arc::new(mesh.clone()),
            trainer,
        );

        let result = tokio::select! {
            result = coordinator.run() => result,
            _ = tokio::signal::ctrl_c() => {
                warn!("Shutdown signal received, abandoning federation");
                Err(Error::Cancelled("interrupted by signal".to_string()))
            }
        };
        mesh.shutdown();

        let report = result?;
        print_report(&report);
        Ok(())
    })
}

/// Run a federation of `nodes` peers inside this process
fn run_simulate(nodes: usize, rounds: u64, retry_ms: u64) -> Result<()> {
    if retry_ms == 0 {
        return Err(Error::config_field_invalid("retry_ms", "must be greater than 0"));
    }

    let config = SimulationConfig {
        nodes,
        coordinator: CoordinatorConfig {
            rounds,
            ..Default::default()
        },
        bootstrap: BootstrapConfig {
            retry_interval: Duration::from_millis(retry_ms),
            timeout: None,
        },
        ..Default::default()
    };

    let runtime = build_runtime("fedavg-sim")?;
    let reports = runtime.block_on(run_simulation(config))?;

    println!();
    println!("Simulation finished ({} nodes, {} rounds):", nodes, rounds);
    for report in &reports {
        match report.final_evaluation() {
            Some(eval) => println!("  {:<10} {}", report.node_id, eval),
            None => println!("  {:<10} no rounds completed", report.node_id),
        }
    }
    Ok(())
}

fn print_report(report: &FederationReport) {
    println!();
    println!(
        "Federation finished on {} after {:.2}s ({} bootstrap passes):",
        report.node_id,
        report.elapsed.as_secs_f64(),
        report.bootstrap.passes
    );
    for round in &report.rounds {
        println!(
            "  round {:>3}: local {} -> averaged {} ({} contributors)",
            round.round,
            round.local,
            round.averaged,
            round.contributors.len()
        );
    }
    println!(
        "  envelopes: {} accepted, {} duplicate, {} stale, {} rejected",
        report.aggregator.accepted,
        report.aggregator.duplicates,
        report.aggregator.stale,
        report.aggregator.rejected
    );
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config, node } => {
            let cfg = NodeConfig::load_for_node(config.as_deref(), node.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config, node } => {
            let cfg = NodeConfig::load_for_node(config.as_deref(), node.as_deref())?;
            println!(
                "Configuration is valid: {} peers, node {}.",
                cfg.peers.len(),
                cfg.local_id()?
            );
        }
    }

    Ok(())
}
