//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// Federated averaging node
///
/// Joins a fixed set of peers, trains a local model on its own data
/// partition and averages parameters with every peer once per round.
#[derive(Parser, Debug)]
#[command(name = "fedavg-node")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the federation described by the config and run all rounds
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "FEDAVG_CONFIG")]
        config: Option<String>,

        /// Which peer entry this process is: an id, or a 1-based index
        #[arg(short, long)]
        node: Option<String>,
    },

    /// Run a whole federation in this process over the in-memory transport
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// Communication rounds
        #[arg(short, long, default_value_t = 5)]
        rounds: u64,

        /// Bootstrap retry interval in milliseconds
        #[arg(long, default_value_t = 100)]
        retry_ms: u64,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Peer entry to show the configuration for
        #[arg(short, long)]
        node: Option<String>,
    },

    /// Write a default configuration file
    Init {
        /// Where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,

        /// Peer entry to validate as
        #[arg(short, long)]
        node: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from(["fedavg-node", "run"]);
        match cli.command {
            Commands::Run { config, node } => {
                assert!(config.is_none());
                assert!(node.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_node_and_config() {
        let cli = Cli::parse_from([
            "fedavg-node",
            "run",
            "--config",
            "/etc/fedavg/node.toml",
            "--node",
            "2",
        ]);
        match cli.command {
            Commands::Run { config, node } => {
                assert_eq!(config.as_deref(), Some("/etc/fedavg/node.toml"));
                assert_eq!(node.as_deref(), Some("2"));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_simulate_defaults() {
        let cli = Cli::parse_from(["fedavg-node", "simulate"]);
        match cli.command {
            Commands::Simulate { nodes, rounds, retry_ms } => {
                assert_eq!(nodes, 3);
                assert_eq!(rounds, 5);
                assert_eq!(retry_ms, 100);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_simulate_with_options() {
        let cli = Cli::parse_from(["fedavg-node", "simulate", "-n", "4", "-r", "2"]);
        match cli.command {
            Commands::Simulate { nodes, rounds, .. } => {
                assert_eq!(nodes, 4);
                assert_eq!(rounds, 2);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["fedavg-node", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_quiet_flag() {
        let cli = Cli::parse_from(["fedavg-node", "--quiet", "version"]);
        assert!(cli.quiet);
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["fedavg-node", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_config_validate() {
        let cli = Cli::parse_from(["fedavg-node", "config", "validate", "-c", "node.toml", "-n", "beta"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Validate { config, node },
            } => {
                assert_eq!(config.as_deref(), Some("node.toml"));
                assert_eq!(node.as_deref(), Some("beta"));
            }
            _ => panic!("Expected Config Validate command"),
        }
    }
}
