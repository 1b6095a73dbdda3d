//! # scheduler
//!
//! Pipeline workers: each worker thread owns a keyed table of sensor state
//! machines and drives them Query → Inference → Publish in a round-robin
//! loop. A failing step resets only that sensor; the worker itself never
//! stops for anything but shutdown. Sensors are partitioned across workers
//! at startup and never migrate, so no sensor state is ever shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use seis_types::channel::SAMPLING_RATE_TOLERANCE_HZ;
use seis_types::{ChannelDescriptor, ThreeComponentGroup};

use crate::broadcast::ProbabilitySink;
use crate::cache_client::CacheService;
use crate::error::{Error, Result};
use crate::inference::DetectorService;
use crate::now_micros;
use crate::sensor::{OneComponentSensor, SensorConfig, ThreeComponentSensor};
use crate::shutdown::Shutdown;

// ── Sensor construction ───────────────────────────────────────────────────────

/// Which detectors run and which channels qualify.
#[derive(Debug, Clone)]
pub struct SensorBuildOptions {
    pub config: SensorConfig,
    /// Networks to process; empty means all
    pub active_networks: Vec<String>,
    /// Acceptable nominal sampling rates; empty means all
    pub valid_sampling_rates: Vec<f64>,
    pub run_p3c: bool,
    pub run_s3c: bool,
    pub run_p1c: bool,
}

impl Default for SensorBuildOptions {
    fn default() -> Self {
        Self {
            config: SensorConfig::default(),
            active_networks: Vec::new(),
            valid_sampling_rates: Vec::new(),
            run_p3c: true,
            run_s3c: true,
            run_p1c: false,
        }
    }
}

impl SensorBuildOptions {
    fn admits(&self, channel: &ChannelDescriptor) -> bool {
        if channel.channel.len() < 3 {
            return false;
        }
        if !self.active_networks.is_empty()
            && !self.active_networks.iter().any(|n| n == &channel.network)
        {
            return false;
        }
        if !self.valid_sampling_rates.is_empty()
            && !self
                .valid_sampling_rates
                .iter()
                .any(|r| (r - channel.sampling_rate).abs() <= SAMPLING_RATE_TOLERANCE_HZ)
        {
            return false;
        }
        true
    }
}

/// Builds the sensor table from a catalog snapshot: channels sharing a
/// station, location and band prefix combine into three-component groups
/// (Z with N/1 and E/2); leftover vertical channels become one-component
/// sensors when the 1C detector is enabled.
pub fn build_sensors(
    snapshot: &[ChannelDescriptor],
    options: &SensorBuildOptions,
    now_us: i64,
) -> (Vec<ThreeComponentSensor>, Vec<OneComponentSensor>) {
    let mut by_station: HashMap<(String, String, String, String), Vec<&ChannelDescriptor>> =
        HashMap::new();
    for channel in snapshot.iter().filter(|c| options.admits(c)) {
        let key = (
            channel.network.clone(),
            channel.station.clone(),
            channel.location_code.clone(),
            channel.channel[..2].to_string(),
        );
        let members = by_station.entry(key).or_default();
        // Catalogs occasionally carry stacked epochs; keep the first row
        // per channel code.
        if !members.iter().any(|m| m.channel == channel.channel) {
            members.push(channel);
        }
    }

    let mut three_component = Vec::new();
    let mut one_component = Vec::new();
    for members in by_station.values() {
        let component = |suffixes: &[char]| {
            members
                .iter()
                .find(|c| {
                    c.channel
                        .chars()
                        .next_back()
                        .is_some_and(|last| suffixes.contains(&last))
                })
                .copied()
        };
        let vertical = component(&['Z']);
        let north = component(&['N', '1']);
        let east = component(&['E', '2']);
        let mut grouped = false;
        if options.run_p3c || options.run_s3c {
            if let (Some(v), Some(n), Some(e)) = (vertical, north, east) {
                match ThreeComponentGroup::new(v.clone(), n.clone(), e.clone()) {
                    Ok(group) => {
                        match ThreeComponentSensor::new(
                            group,
                            options.config,
                            options.run_p3c,
                            options.run_s3c,
                            now_us,
                        ) {
                            Ok(sensor) => {
                                grouped = true;
                                three_component.push(sensor);
                            }
                            Err(e) => warn!("skipping three-component sensor: {e}"),
                        }
                    }
                    Err(e) => warn!("skipping malformed group: {e}"),
                }
            }
        }
        if !grouped && options.run_p1c {
            if let Some(v) = vertical {
                match OneComponentSensor::new(v.clone(), options.config, now_us) {
                    Ok(sensor) => one_component.push(sensor),
                    Err(e) => warn!("skipping one-component sensor: {e}"),
                }
            }
        }
    }
    // Deterministic iteration order for partitioning.
    three_component.sort_by_key(|s| s.hash());
    one_component.sort_by_key(|s| s.hash());
    (three_component, one_component)
}

// ── Worker ────────────────────────────────────────────────────────────────────

/// One row of a worker's table.
pub enum SensorItem {
    ThreeComponent(ThreeComponentSensor),
    OneComponent(OneComponentSensor),
}

impl SensorItem {
    pub fn hash(&self) -> u64 {
        match self {
            SensorItem::ThreeComponent(s) => s.hash(),
            SensorItem::OneComponent(s) => s.hash(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SensorItem::ThreeComponent(s) => s.name(),
            SensorItem::OneComponent(s) => s.name(),
        }
    }

    fn reset_to_query(&mut self) {
        match self {
            SensorItem::ThreeComponent(s) => s.reset_to_query(),
            SensorItem::OneComponent(s) => s.reset_to_query(),
        }
    }
}

/// The per-worker client set. Every socket here is owned by exactly this
/// worker's thread.
pub struct PipelineClients {
    pub cache: Box<dyn CacheService>,
    pub p3c_detector: Option<Box<dyn DetectorService>>,
    pub s3c_detector: Option<Box<dyn DetectorService>>,
    pub p1c_detector: Option<Box<dyn DetectorService>>,
    pub publisher: Box<dyn ProbabilitySink>,
}

/// Breather between full passes so an all-idle worker does not spin.
const PASS_WAIT: Duration = Duration::from_millis(10);

pub struct PipelineWorker {
    instance: usize,
    sensors: HashMap<u64, SensorItem>,
    clients: PipelineClients,
    shutdown: Arc<Shutdown>,
}

impl PipelineWorker {
    pub fn new(
        instance: usize,
        sensors: Vec<SensorItem>,
        clients: PipelineClients,
        shutdown: Arc<Shutdown>,
    ) -> Result<Self> {
        // The P and S detectors consume the same interpolated signal, which
        // only works when their declared input contracts agree.
        if let (Some(p), Some(s)) = (&clients.p3c_detector, &clients.s3c_detector) {
            if p.properties() != s.properties() {
                return Err(Error::InvalidArgument(
                    "P and S three-component detectors declare different input contracts"
                        .to_string(),
                ));
            }
        }
        let sensors = sensors
            .into_iter()
            .map(|item| (item.hash(), item))
            .collect();
        Ok(Self {
            instance,
            sensors,
            clients,
            shutdown,
        })
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Drives every sensor until shutdown. Per-sensor failures are logged
    /// and reset that sensor to Query; nothing stops the loop.
    pub fn run(&mut self) {
        info!(
            instance = self.instance,
            sensors = self.sensors.len(),
            "pipeline worker starting"
        );
        while !self.shutdown.is_triggered() {
            self.run_once();
            self.shutdown.wait_timeout(PASS_WAIT);
        }
        info!(instance = self.instance, "pipeline worker leaving");
    }

    /// One full pass over the sensor table.
    pub fn run_once(&mut self) {
        let instance = self.instance;
        let clients = &mut self.clients;
        for item in self.sensors.values_mut() {
            let now_us = now_micros();
            let step = Self::drive(item, clients, now_us);
            if let Err(e) = step {
                error!(instance, sensor = item.name(), "{e}");
                item.reset_to_query();
            }
        }
    }

    fn drive(item: &mut SensorItem, clients: &mut PipelineClients, now_us: i64) -> Result<()> {
        match item {
            SensorItem::ThreeComponent(sensor) => {
                sensor.query_packet_cache(now_us, clients.cache.as_mut())?;
                let p_detector: Option<&mut dyn DetectorService> = match clients.p3c_detector.as_mut() {
                    Some(b) => Some(&mut **b),
                    None => None,
                };
                let s_detector: Option<&mut dyn DetectorService> = match clients.s3c_detector.as_mut() {
                    Some(b) => Some(&mut **b),
                    None => None,
                };
                sensor.run_inference(p_detector, s_detector)?;
                sensor.publish(clients.publisher.as_mut())?;
            }
            SensorItem::OneComponent(sensor) => {
                sensor.query_packet_cache(now_us, clients.cache.as_mut())?;
                let p_detector: Option<&mut dyn DetectorService> = match clients.p1c_detector.as_mut() {
                    Some(b) => Some(&mut **b),
                    None => None,
                };
                let Some(detector) = p_detector else {
                    return Err(Error::NotSet("one-component P detector client"));
                };
                sensor.run_inference(detector)?;
                sensor.publish(clients.publisher.as_mut())?;
            }
        }
        Ok(())
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Splits the sensor table round-robin into one partition per worker.
pub fn partition_sensors(
    three_component: Vec<ThreeComponentSensor>,
    one_component: Vec<OneComponentSensor>,
    workers: usize,
) -> Vec<Vec<SensorItem>> {
    let workers = workers.max(1);
    let mut partitions: Vec<Vec<SensorItem>> = (0..workers).map(|_| Vec::new()).collect();
    let items = three_component
        .into_iter()
        .map(SensorItem::ThreeComponent)
        .chain(one_component.into_iter().map(SensorItem::OneComponent));
    for (index, item) in items.enumerate() {
        partitions[index % workers].push(item);
    }
    partitions
}

/// The running detector pipeline: one thread per non-empty partition.
pub struct Pipeline {
    shutdown: Arc<Shutdown>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns the workers. The factory builds each worker's private client
    /// set on the worker's own thread assignment, so sockets are never
    /// shared.
    pub fn start<F>(
        partitions: Vec<Vec<SensorItem>>,
        mut client_factory: F,
        shutdown: Arc<Shutdown>,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> Result<PipelineClients>,
    {
        let mut handles = Vec::new();
        for (instance, partition) in partitions.into_iter().enumerate() {
            if partition.is_empty() {
                debug!(instance, "no sensors assigned, worker not started");
                continue;
            }
            let clients = client_factory(instance)?;
            let mut worker = PipelineWorker::new(instance, partition, clients, shutdown.clone())?;
            let handle = std::thread::Builder::new()
                .name(format!("pipeline-{instance}"))
                .spawn(move || worker.run())
                .map_err(|e| Error::Communication(format!("failed to spawn worker: {e}")))?;
            handles.push(handle);
        }
        Ok(Self { shutdown, handles })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Requests shutdown and joins every worker.
    pub fn stop(self) {
        self.shutdown.trigger();
        for handle in self.handles {
            if let Err(e) = handle.join() {
                error!("pipeline worker panicked: {e:?}");
            }
        }
    }
}
