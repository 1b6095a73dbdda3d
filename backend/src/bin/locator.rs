//! The locator orchestrator daemon: refines preliminary origins from the
//! associator through the remote location service and republishes them
//! with fresh catalog identifiers.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use seismon_backend::broadcast::{OriginPublisher, OriginSubscriber};
use seismon_backend::config::{log_filter, LocatorModuleConfig};
use seismon_backend::locator::{
    IncrementerClient, LocatorClient, LocatorOptions, LocatorOrchestrator,
};
use seismon_backend::Shutdown;

#[derive(Parser)]
#[command(
    name = "seismon-locator",
    about = "Refines preliminary origins built by the associator through \
             the remote location service."
)]
struct Args {
    /// Initialization file for this module
    #[arg(long, value_name = "FILE")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = LocatorModuleConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter(config.general.verbose).into()),
        )
        .init();
    let region = config.region()?;
    info!(
        module = %config.general.module_name,
        version = env!("CARGO_PKG_VERSION"),
        ?region,
        "locator module starting"
    );

    let shutdown = Shutdown::new();
    let orchestrator = LocatorOrchestrator::start(
        LocatorOptions {
            module_name: config.general.module_name.clone(),
            region,
            queue_capacity: config.locator.queue_capacity,
            ..Default::default()
        },
        Box::new(OriginSubscriber::new(config.subscriber_socket())),
        Box::new(LocatorClient::new(config.locator_socket())),
        Box::new(IncrementerClient::new(config.incrementer_socket())),
        Box::new(OriginPublisher::new(config.publisher_socket())),
        shutdown.clone(),
    )?;
    info!("locator running");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line?.trim() {
            "quit" | "exit" => break,
            "" => {}
            "help" => println!("Commands:\n   help    Displays this message.\n   quit    Exits the program."),
            other => println!("Unknown command: {other}. Type help."),
        }
    }

    info!("shutting down");
    shutdown.trigger();
    orchestrator.stop();
    info!("locator module exiting");
    Ok(())
}
