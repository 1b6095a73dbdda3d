//! The ML detector pipeline daemon: polls the channel directory, builds the
//! per-sensor state machines, and drives them from a pool of worker
//! threads until told to quit.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;

use seismon_backend::broadcast::ProbabilityPublisher;
use seismon_backend::cache_client::PacketCacheClient;
use seismon_backend::config::{log_filter, DetectorModuleConfig};
use seismon_backend::directory::{ChannelDirectory, FileChannelCatalog, QueryMode};
use seismon_backend::inference::{DetectorClient, DetectorProperties};
use seismon_backend::scheduler::{
    build_sensors, partition_sensors, Pipeline, PipelineClients, SensorBuildOptions,
};
use seismon_backend::{now_micros, Shutdown};

#[derive(Parser)]
#[command(
    name = "seismon-detector",
    about = "Runs the ML phase detectors over the real-time waveform cache \
             and republishes probability streams."
)]
struct Args {
    /// Initialization file for this module
    #[arg(long, value_name = "FILE")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = DetectorModuleConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter(config.general.verbose).into()),
        )
        .init();
    info!(
        module = %config.general.module_name,
        version = env!("CARGO_PKG_VERSION"),
        "detector module starting"
    );

    // Channel directory: primed synchronously so startup fails hard when
    // the catalog is unreachable.
    let Some(channel_file) = config.database.channel_file.clone() else {
        bail!("database.channel_file is not set; the catalog poller needs a channel list");
    };
    let catalog = FileChannelCatalog::new(&channel_file);
    let mut directory = ChannelDirectory::start(
        Box::new(catalog),
        QueryMode::Current,
        config.database.poller_interval(),
    )
    .context("priming the channel directory")?;
    directory.subscribe(|snapshot| {
        info!(
            channels = snapshot.len(),
            "channel catalog changed; restart to repartition sensors"
        );
    });

    // Build and partition the sensor table.
    let properties = DetectorProperties::default();
    let build_options = SensorBuildOptions {
        config: config.sensor_config(&properties),
        active_networks: config.detectors.active_networks.clone(),
        valid_sampling_rates: config.detectors.valid_sampling_rates.clone(),
        run_p3c: config.detectors.run_p3c,
        run_s3c: config.detectors.run_s3c,
        run_p1c: config.detectors.run_p1c,
    };
    let (three_component, one_component) =
        build_sensors(&directory.snapshot(), &build_options, now_micros());
    info!(
        three_component = three_component.len(),
        one_component = one_component.len(),
        "sensor table built"
    );
    if three_component.is_empty() && one_component.is_empty() {
        bail!("no channels in the catalog qualify for the configured detectors");
    }
    let partitions = partition_sensors(three_component, one_component, config.worker_threads());

    // One private client set per worker; sockets are never shared.
    let shutdown = Shutdown::new();
    let client_config = config.clone();
    let client_factory = move |_instance: usize| -> seismon_backend::Result<PipelineClients> {
        let detectors = &client_config.detectors;
        Ok(PipelineClients {
            cache: Box::new(PacketCacheClient::new(client_config.packet_cache_socket())),
            p3c_detector: detectors.run_p3c.then(|| {
                Box::new(DetectorClient::new(
                    client_config.detector_socket(&detectors.p3c),
                    properties,
                    "UNetThreeComponentP",
                )) as Box<dyn seismon_backend::inference::DetectorService>
            }),
            s3c_detector: detectors.run_s3c.then(|| {
                Box::new(DetectorClient::new(
                    client_config.detector_socket(&detectors.s3c),
                    properties,
                    "UNetThreeComponentS",
                )) as Box<dyn seismon_backend::inference::DetectorService>
            }),
            p1c_detector: detectors.run_p1c.then(|| {
                Box::new(DetectorClient::new(
                    client_config.detector_socket(&detectors.p1c),
                    properties,
                    "UNetOneComponentP",
                )) as Box<dyn seismon_backend::inference::DetectorService>
            }),
            publisher: Box::new(ProbabilityPublisher::new(
                client_config.probability_socket(),
            )),
        })
    };
    let pipeline = Pipeline::start(partitions, client_factory, shutdown.clone())?;
    info!(workers = pipeline.worker_count(), "pipeline running");

    // The main thread serves the operator console until "quit".
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
    pipeline.stop();
    directory.stop();
    info!("detector module exiting");
    Ok(())
}
