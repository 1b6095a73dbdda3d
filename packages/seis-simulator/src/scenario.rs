//! # scenario
//!
//! TOML-driven simulation scenarios: which stations exist, what their
//! signals look like, and where to inject telemetry dropouts.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::waveform::SyntheticChannel;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StationSpec {
    pub network: String,
    pub station: String,
    pub location_code: String,
    /// Band/instrument prefix, e.g. "HH"
    pub band: String,
    /// Three-component station (Z/N/E) or vertical only
    pub three_component: bool,
}

impl Default for StationSpec {
    fn default() -> Self {
        Self {
            network: "UU".to_string(),
            station: "SIM1".to_string(),
            location_code: "01".to_string(),
            band: "HH".to_string(),
            three_component: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub stations: Vec<StationSpec>,
    pub sampling_rate: f64,
    pub samples_per_packet: usize,
    pub amplitude: f64,
    pub frequency_hz: f64,
    pub noise_std: f64,
    pub seed: u64,
    /// Dropout windows in seconds relative to the simulation start
    pub gaps_s: Vec<(f64, f64)>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            stations: vec![
                StationSpec::default(),
                StationSpec {
                    station: "SIM2".to_string(),
                    ..Default::default()
                },
            ],
            sampling_rate: 100.0,
            samples_per_packet: 100,
            amplitude: 1000.0,
            frequency_hz: 1.5,
            noise_std: 25.0,
            seed: 1,
            gaps_s: Vec::new(),
        }
    }
}

impl Scenario {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing scenario {}", path.display()))
    }

    /// Expands the station list into simulated channels.
    pub fn channels(&self) -> Vec<SyntheticChannel> {
        let mut channels = Vec::new();
        for station in &self.stations {
            let suffixes: &[&str] = if station.three_component {
                &["Z", "N", "E"]
            } else {
                &["Z"]
            };
            for suffix in suffixes {
                let mut channel = SyntheticChannel::new(
                    &station.network,
                    &station.station,
                    &format!("{}{suffix}", station.band),
                    &station.location_code,
                );
                channel.sampling_rate = self.sampling_rate;
                channel.amplitude = self.amplitude;
                channel.frequency_hz = self.frequency_hz;
                channel.noise_std = self.noise_std;
                channel.seed = self.seed;
                channels.push(channel);
            }
        }
        channels
    }

    /// Dropout windows converted to microseconds after `start_us`.
    pub fn gaps_us(&self, start_us: i64) -> Vec<(i64, i64)> {
        self.gaps_s
            .iter()
            .map(|(g0, g1)| {
                (
                    start_us + (g0 * 1.0e6).round() as i64,
                    start_us + (g1 * 1.0e6).round() as i64,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scenario_expands_to_six_channels() {
        let scenario = Scenario::default();
        let channels = scenario.channels();
        assert_eq!(channels.len(), 6);
        assert!(channels.iter().any(|c| c.channel == "HHN"));
    }

    #[test]
    fn scenario_parses_from_toml() {
        let text = r#"
sampling_rate = 100.0
gaps_s = [[10.0, 10.5]]

[[stations]]
network = "WY"
station = "YGC"
band = "EH"
three_component = false
"#;
        let scenario: Scenario = toml::from_str(text).unwrap();
        assert_eq!(scenario.stations.len(), 1);
        let channels = scenario.channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].channel, "EHZ");
        assert_eq!(scenario.gaps_us(0), vec![(10_000_000, 10_500_000)]);
    }
}
