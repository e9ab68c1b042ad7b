use anyhow::Context;
use clap::{Parser, Subcommand};
use discovery::DiscoveryConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "discovery",
    about = "Worker registration and membership over etcd",
    version = env!("CARGO_PKG_VERSION"),
    author = "Discovery Project Team",
    long_about = "Runs a membership master that follows a namespace of worker keys, or a worker that keeps its own key alive with a refreshed lease."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Coordination store endpoint, repeatable; replaces the configured list
    #[arg(long = "store-node", value_name = "URL", global = true)]
    pub store_nodes: Vec<String>,

    /// Key prefix for worker registrations
    #[arg(long, value_name = "PREFIX", global = true)]
    pub namespace: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Follow the worker namespace and report membership
    Master {
        /// Seconds between membership reports, 0 disables them
        #[arg(long, default_value = "30")]
        report_interval: u64,
    },

    /// Register a worker and keep its lease alive until interrupted
    Worker {
        /// Worker name, the last segment of its key
        #[arg(short, long)]
        name: String,

        /// Address other services reach the worker at
        #[arg(short, long)]
        address: String,
    },

    /// Write a configuration file with default settings
    InitConfig {
        /// Output file path
        #[arg(short, long, default_value = "discovery.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Configuration from file or defaults, with command-line overrides
    pub fn resolve_config(&self) -> anyhow::Result<DiscoveryConfig> {
        let mut config = match &self.config {
            Some(path) => DiscoveryConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => DiscoveryConfig::default(),
        };

        if !self.store_nodes.is_empty() {
            config.store_nodes = self.store_nodes.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.worker_namespace = namespace.clone();
        }

        Ok(config)
    }
}
