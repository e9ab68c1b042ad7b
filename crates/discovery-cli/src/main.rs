use anyhow::{bail, Context};
use clap::Parser;
use discovery::{DiscoveryConfig, Master, Worker};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.resolve_config()?;

    match cli.command {
        Commands::Master { report_interval } => {
            config.validate()?;
            run_master(config, report_interval).await
        }
        Commands::Worker { name, address } => {
            config.validate()?;
            run_worker(config, name, address).await
        }
        Commands::InitConfig { output, force } => init_config(&config, &output, force),
    }
}

async fn run_master(config: DiscoveryConfig, report_interval: u64) -> anyhow::Result<()> {
    let master = Arc::new(
        Master::new(config)
            .await
            .context("Failed to start membership master")?,
    );

    let runner = Arc::clone(&master);
    let mut watch = tokio::spawn(async move { runner.run().await });

    let mut report = if report_interval > 0 {
        Some(tokio::time::interval(Duration::from_secs(report_interval)))
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping master");
                master.shutdown();
                watch.await??;
                return Ok(());
            }
            result = &mut watch => {
                result??;
                bail!("Membership watch ended");
            }
            _ = tick(&mut report) => {
                let alive = master.alive_members().await;
                let known = master.list_members().await.len();
                tracing::info!("{} of {} members alive", alive.len(), known);
                for member in alive {
                    tracing::info!("  {} at {}", member.name, member.address);
                }
            }
        }
    }
}

async fn tick(report: &mut Option<tokio::time::Interval>) {
    match report {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_worker(config: DiscoveryConfig, name: String, address: String) -> anyhow::Result<()> {
    let worker = Arc::new(
        Worker::new(name, address, config)
            .await
            .context("Failed to start worker")?,
    );

    let registrant = Arc::clone(&worker);
    let heartbeat = tokio::spawn(async move { registrant.register().await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;
    tracing::info!("Interrupted, unregistering worker '{}'", worker.name());

    let result = worker.unregister().await;
    heartbeat.await?;
    result.with_context(|| format!("Failed to remove key '{}'", worker.key()))
}

fn init_config(config: &DiscoveryConfig, output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists, pass --force to overwrite",
            output.display()
        );
    }

    config.to_file(output)?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Filter used when `RUST_LOG` is unset; quiet wins over verbose
fn default_directive(verbose: bool, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "off",
        (false, true) => "debug",
        (false, false) => "info",
    }
}

fn setup_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let directive = default_directive(verbose, quiet);
    let filter = if quiet {
        // An exported RUST_LOG must not override --quiet
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    tracing_subscriber::fmt()
        .with_target(verbose)
        .with_env_filter(filter)
        .init();
}
