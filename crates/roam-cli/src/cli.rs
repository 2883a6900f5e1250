use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "roam", about = "Edge node for geo-distributed session hosting")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run an edge node: serve sessions, gossip status, migrate load.
    Serve {
        /// Node config file (YAML).
        #[arg(long, env = "ROAM_CONFIG")]
        config: PathBuf,
    },
    /// Validate an infrastructure file and print the flattened tree.
    Check {
        /// Infrastructure file (JSON).
        #[arg(long)]
        infrastructure: PathBuf,
    },
}
