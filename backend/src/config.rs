//! # config
//!
//! The initialization-file surface for both daemons. One TOML file per
//! module; unknown keys are ignored, missing required keys fail startup
//! with a message naming the key. Database credentials may come from the
//! environment (`URTS_AQMS_RDONLY_USER`, `URTS_AQMS_RDONLY_PASSWORD`,
//! `URTS_AQMS_DATABASE_NAME`) with explicit config taking precedence;
//! credentials are never logged.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use seis_types::MonitoringRegion;

use crate::error::{Error, Result};
use crate::inference::DetectorProperties;
use crate::sensor::SensorConfig;
use crate::transport::SocketOptions;

pub const ENV_READ_ONLY_USER: &str = "URTS_AQMS_RDONLY_USER";
pub const ENV_READ_ONLY_PASSWORD: &str = "URTS_AQMS_RDONLY_PASSWORD";
pub const ENV_DATABASE_NAME: &str = "URTS_AQMS_DATABASE_NAME";

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidArgument(format!("cannot read {}: {e}", path.display()))
    })?;
    toml::from_str(&text)
        .map_err(|e| Error::InvalidArgument(format!("malformed {}: {e}", path.display())))
}

/// Maps the `verbose` level to a tracing filter directive.
pub fn log_filter(verbose: i32) -> &'static str {
    match verbose {
        i32::MIN..=0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    }
}

// ── Shared sections ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralSection {
    pub module_name: String,
    /// 0 = error, 1 = warn, 2 = info, 3+ = debug
    pub verbose: i32,
    pub log_file_directory: Option<PathBuf>,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            module_name: String::new(),
            verbose: 2,
            log_file_directory: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub address: String,
    pub port: u16,
    pub name: String,
    pub read_only_user: String,
    pub read_only_password: String,
    pub poller_interval_s: u64,
    /// Channel list consumed by the in-tree file catalog; deployments with
    /// a live metadata connector leave this unset.
    pub channel_file: Option<PathBuf>,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 5432,
            name: String::new(),
            read_only_user: String::new(),
            read_only_password: String::new(),
            poller_interval_s: 3600,
            channel_file: None,
        }
    }
}

impl DatabaseSection {
    /// Fills the credential fields from the environment when the file left
    /// them blank.
    fn apply_environment(&mut self) {
        if self.read_only_user.is_empty() {
            if let Ok(user) = std::env::var(ENV_READ_ONLY_USER) {
                self.read_only_user = user;
            }
        }
        if self.read_only_password.is_empty() {
            if let Ok(password) = std::env::var(ENV_READ_ONLY_PASSWORD) {
                self.read_only_password = password;
            }
        }
        if self.name.is_empty() {
            if let Ok(name) = std::env::var(ENV_DATABASE_NAME) {
                self.name = name;
            }
        }
    }

    pub fn poller_interval(&self) -> Duration {
        Duration::from_secs(self.poller_interval_s)
    }

    fn validate(&self) -> Result<()> {
        if self.poller_interval_s == 0 {
            return Err(Error::InvalidArgument(
                "database.poller_interval_s must be positive".to_string(),
            ));
        }
        if self.channel_file.is_some() {
            return Ok(());
        }
        // Without a channel file the live catalog connection must be fully
        // specified.
        if self.address.is_empty() {
            return Err(Error::InvalidArgument(
                "database.address is not set".to_string(),
            ));
        }
        if self.name.is_empty() {
            return Err(Error::InvalidArgument(
                "database.name is not set".to_string(),
            ));
        }
        if self.read_only_user.is_empty() {
            return Err(Error::InvalidArgument(
                "database.read_only_user is not set".to_string(),
            ));
        }
        if self.read_only_password.is_empty() {
            return Err(Error::InvalidArgument(
                "database.read_only_password is not set".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceEndpoint {
    pub service_name: String,
    pub service_address: String,
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            service_address: String::new(),
        }
    }
}

impl ServiceEndpoint {
    fn require_address(&self, what: &str) -> Result<()> {
        if self.service_address.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{what} service address indeterminable"
            )));
        }
        Ok(())
    }
}

// ── Detector module configuration ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacketCacheSection {
    pub service_name: String,
    pub service_address: String,
    pub request_timeout_ms: u64,
}

impl Default for PacketCacheSection {
    fn default() -> Self {
        Self {
            service_name: "RawDataPackets".to_string(),
            service_address: String::new(),
            request_timeout_ms: 5000,
        }
    }
}

impl PacketCacheSection {
    fn require_address(&self, what: &str) -> Result<()> {
        if self.service_address.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{what} service address indeterminable"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorsSection {
    pub run_p3c: bool,
    pub run_s3c: bool,
    pub run_p1c: bool,
    pub p3c: ServiceEndpoint,
    pub s3c: ServiceEndpoint,
    pub p1c: ServiceEndpoint,
    pub inference_request_timeout_ms: u64,
    pub maximum_signal_latency_s: u64,
    /// Gap tolerance in samples
    pub gap_tolerance: u32,
    pub data_query_wait_percentage: f64,
    /// Networks to process; empty means all
    pub active_networks: Vec<String>,
    /// Acceptable nominal sampling rates; empty means all
    pub valid_sampling_rates: Vec<f64>,
    /// Pipeline worker threads; 0 means one per available core
    pub n_threads: usize,
}

impl Default for DetectorsSection {
    fn default() -> Self {
        Self {
            run_p3c: true,
            run_s3c: true,
            run_p1c: false,
            p3c: ServiceEndpoint {
                service_name: "PDetector3C".to_string(),
                service_address: String::new(),
            },
            s3c: ServiceEndpoint {
                service_name: "SDetector3C".to_string(),
                service_address: String::new(),
            },
            p1c: ServiceEndpoint {
                service_name: "PDetector1C".to_string(),
                service_address: String::new(),
            },
            inference_request_timeout_ms: 1000,
            maximum_signal_latency_s: 180,
            gap_tolerance: 5,
            data_query_wait_percentage: 30.0,
            active_networks: Vec::new(),
            valid_sampling_rates: Vec::new(),
            n_threads: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastSection {
    pub name: String,
    pub address: String,
    pub high_water_mark: usize,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            high_water_mark: 0,
        }
    }
}

impl BroadcastSection {
    fn require_address(&self, what: &str) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{what} broadcast indeterminable"
            )));
        }
        Ok(())
    }
}

/// Configuration of the ML detector pipeline daemon.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DetectorModuleConfig {
    pub general: GeneralSection,
    pub database: DatabaseSection,
    pub packet_cache: PacketCacheSection,
    pub detectors: DetectorsSection,
    pub probability_broadcast: BroadcastSection,
}

impl DetectorModuleConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config: Self = read_toml(path)?;
        if config.general.module_name.is_empty() {
            config.general.module_name = "MLDetector".to_string();
        }
        config.database.apply_environment();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.packet_cache.require_address("packet cache")?;
        self.probability_broadcast
            .require_address("probability packet")?;
        let detectors = &self.detectors;
        if !detectors.run_p3c && !detectors.run_s3c && !detectors.run_p1c {
            return Err(Error::InvalidArgument("no detectors to run".to_string()));
        }
        if detectors.run_p3c {
            detectors.p3c.require_address("P three-component detector")?;
        }
        if detectors.run_s3c {
            detectors.s3c.require_address("S three-component detector")?;
        }
        if detectors.run_p1c {
            detectors.p1c.require_address("P one-component detector")?;
        }
        if detectors.maximum_signal_latency_s == 0 {
            return Err(Error::InvalidArgument(
                "detectors.maximum_signal_latency_s must be positive".to_string(),
            ));
        }
        if !(detectors.data_query_wait_percentage > 0.0
            && detectors.data_query_wait_percentage < 100.0)
        {
            return Err(Error::InvalidArgument(
                "detectors.data_query_wait_percentage must be in (0, 100)".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker-thread count, defaulting to the available parallelism.
    pub fn worker_threads(&self) -> usize {
        if self.detectors.n_threads > 0 {
            self.detectors.n_threads
        } else {
            num_cpus::get()
        }
    }

    /// The sensor timing knobs layered over a detector's declared window
    /// contract.
    pub fn sensor_config(&self, properties: &DetectorProperties) -> SensorConfig {
        SensorConfig {
            maximum_signal_latency_us: self.detectors.maximum_signal_latency_s as i64 * 1_000_000,
            gap_tolerance_samples: self.detectors.gap_tolerance,
            data_query_wait_percentage: self.detectors.data_query_wait_percentage,
            ..SensorConfig::from_properties(properties)
        }
    }

    pub fn packet_cache_socket(&self) -> SocketOptions {
        SocketOptions::new(self.packet_cache.service_address.clone())
            .with_receive_timeout(Duration::from_millis(self.packet_cache.request_timeout_ms))
    }

    pub fn detector_socket(&self, endpoint: &ServiceEndpoint) -> SocketOptions {
        SocketOptions::new(endpoint.service_address.clone()).with_receive_timeout(
            Duration::from_millis(self.detectors.inference_request_timeout_ms),
        )
    }

    pub fn probability_socket(&self) -> SocketOptions {
        SocketOptions::new(self.probability_broadcast.address.clone())
            .with_high_water_mark(self.probability_broadcast.high_water_mark)
    }
}

// ── Locator module configuration ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocatorSection {
    /// Monitoring region served by this instance: "utah" or "yellowstone"
    /// (alias "ynp")
    pub region: String,
    pub input_origin_broadcast: BroadcastSection,
    pub output_origin_broadcast: BroadcastSection,
    pub locator_service: ServiceEndpoint,
    pub locator_request_timeout_s: u64,
    pub incrementer_service: ServiceEndpoint,
    pub increment_request_timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for LocatorSection {
    fn default() -> Self {
        Self {
            region: String::new(),
            input_origin_broadcast: BroadcastSection {
                name: "PreliminaryOrigin".to_string(),
                ..Default::default()
            },
            output_origin_broadcast: BroadcastSection {
                name: "Origin".to_string(),
                ..Default::default()
            },
            locator_service: ServiceEndpoint {
                service_name: "uLocator".to_string(),
                service_address: String::new(),
            },
            locator_request_timeout_s: 45,
            incrementer_service: ServiceEndpoint {
                service_name: "Incrementer".to_string(),
                service_address: String::new(),
            },
            increment_request_timeout_ms: 1000,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LocatorModuleConfig {
    pub general: GeneralSection,
    pub locator: LocatorSection,
}

impl LocatorModuleConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config: Self = read_toml(path)?;
        if config.general.module_name.is_empty() {
            config.general.module_name = "Locator".to_string();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.region()?;
        self.locator
            .input_origin_broadcast
            .require_address("input origin")?;
        self.locator
            .output_origin_broadcast
            .require_address("output origin")?;
        self.locator.locator_service.require_address("location")?;
        self.locator
            .incrementer_service
            .require_address("incrementer")?;
        if self.locator.queue_capacity == 0 {
            return Err(Error::InvalidArgument(
                "locator.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn region(&self) -> Result<MonitoringRegion> {
        match self.locator.region.to_ascii_lowercase().as_str() {
            "utah" => Ok(MonitoringRegion::Utah),
            "ynp" | "yellowstone" => Ok(MonitoringRegion::Yellowstone),
            other => Err(Error::InvalidArgument(format!(
                "unhandled region: {other:?}"
            ))),
        }
    }

    pub fn subscriber_socket(&self) -> SocketOptions {
        SocketOptions::new(self.locator.input_origin_broadcast.address.clone())
            .with_high_water_mark(self.locator.input_origin_broadcast.high_water_mark)
    }

    pub fn publisher_socket(&self) -> SocketOptions {
        SocketOptions::new(self.locator.output_origin_broadcast.address.clone())
            .with_high_water_mark(self.locator.output_origin_broadcast.high_water_mark)
    }

    pub fn locator_socket(&self) -> SocketOptions {
        SocketOptions::new(self.locator.locator_service.service_address.clone())
            .with_receive_timeout(Duration::from_secs(self.locator.locator_request_timeout_s))
    }

    pub fn incrementer_socket(&self) -> SocketOptions {
        SocketOptions::new(self.locator.incrementer_service.service_address.clone())
            .with_receive_timeout(Duration::from_millis(
                self.locator.increment_request_timeout_ms,
            ))
    }
}
