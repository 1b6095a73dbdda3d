//! seis-sim: stands up a complete fake field on localhost — packet cache
//! fed by synthetic digitizers, P/S detector services, a probability
//! capture bus, a location service, and an incrementer — so the real
//! seismon daemons can be exercised without hardware or models.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use seis_simulator::{
    spawn_capture_bus, spawn_detector, spawn_incrementer, spawn_locator, spawn_packet_cache,
    DetectorBehavior, LocatorBehavior, PacketStore, Scenario,
};
use seis_types::ProbabilityPacket;

#[derive(Parser)]
#[command(
    name = "seis-sim",
    about = "Simulated field network and services for seismon development."
)]
struct Args {
    /// Scenario file; omit for the built-in two-station scenario
    #[arg(long, value_name = "FILE")]
    scenario: Option<PathBuf>,
    /// How long to run before shutting down, in seconds
    #[arg(long, default_value_t = 60)]
    duration_s: u64,
    /// Simulated probability the mock detectors emit
    #[arg(long, default_value_t = 0.05)]
    detector_fill: f64,
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();
    let scenario = match &args.scenario {
        Some(path) => Scenario::load(path)?,
        None => Scenario::default(),
    };
    let channels = scenario.channels();
    info!(channels = channels.len(), "scenario loaded");

    // Stand the field up.
    let store = PacketStore::new();
    let cache = spawn_packet_cache(store.clone());
    let p_detector = spawn_detector(DetectorBehavior::Constant(args.detector_fill));
    let s_detector = spawn_detector(DetectorBehavior::Constant(args.detector_fill));
    let (probability_bus, captured) = spawn_capture_bus();
    let locator = spawn_locator(LocatorBehavior {
        latitude: 39.027048,
        longitude: -111.401232,
        depth_m: 1146.0,
        time_us: now_micros(),
        residual_s: 0.0,
        fail: false,
    });
    let incrementer = spawn_incrementer(1);

    println!("packet cache        {}", cache.address);
    println!("P detector          {}", p_detector.address);
    println!("S detector          {}", s_detector.address);
    println!("probability bus     {}", probability_bus.address);
    println!("location service    {}", locator.address);
    println!("incrementer         {}", incrementer.address);

    // Feed the cache one second of fresh packets per channel per second,
    // trailing the wall clock the way real telemetry does.
    let start_us = now_micros();
    let gaps = scenario.gaps_us(start_us);
    let mut fed_until = start_us;
    let deadline = start_us + args.duration_s as i64 * 1_000_000;
    while now_micros() < deadline {
        let target = now_micros();
        if target > fed_until {
            for channel in &channels {
                store.extend(channel.packets(
                    fed_until,
                    target,
                    scenario.samples_per_packet,
                    &gaps,
                ));
            }
            fed_until = target;
        }
        std::thread::sleep(Duration::from_secs(1));
        info!(
            channels = store.channel_count(),
            probability_packets = captured.typed::<ProbabilityPacket>().len(),
            "simulation tick"
        );
    }
    info!("simulation complete");
    Ok(())
}
