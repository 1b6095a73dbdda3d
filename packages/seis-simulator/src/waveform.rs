//! # waveform
//!
//! Synthetic digitizer output: a sine carrier with Gaussian noise, chunked
//! into cache-style packets, with optional dropout windows to exercise the
//! gap handling downstream.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use seis_types::Packet;

/// One simulated channel and the shape of its signal.
#[derive(Debug, Clone)]
pub struct SyntheticChannel {
    pub network: String,
    pub station: String,
    pub channel: String,
    pub location_code: String,
    pub sampling_rate: f64,
    /// Peak amplitude of the sine carrier, in counts
    pub amplitude: f64,
    pub frequency_hz: f64,
    /// Standard deviation of the additive Gaussian noise
    pub noise_std: f64,
    /// Seed so a scenario replays identically
    pub seed: u64,
}

impl SyntheticChannel {
    pub fn new(network: &str, station: &str, channel: &str, location_code: &str) -> Self {
        Self {
            network: network.to_string(),
            station: station.to_string(),
            channel: channel.to_string(),
            location_code: location_code.to_string(),
            sampling_rate: 100.0,
            amplitude: 1000.0,
            frequency_hz: 1.5,
            noise_std: 25.0,
            seed: 1,
        }
    }

    pub fn name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.channel, self.location_code
        )
    }

    fn in_gap(gaps: &[(i64, i64)], time_us: i64) -> bool {
        gaps.iter().any(|(g0, g1)| *g0 <= time_us && time_us < *g1)
    }

    /// Generates packets covering [start_us, end_us), split into chunks of
    /// at most `samples_per_packet`. Samples falling inside any of the
    /// half-open `gaps` windows are dropped, splitting packets exactly the
    /// way a flaky telemetry link does.
    pub fn packets(
        &self,
        start_us: i64,
        end_us: i64,
        samples_per_packet: usize,
        gaps: &[(i64, i64)],
    ) -> Vec<Packet> {
        assert!(samples_per_packet > 0, "packets need at least one sample");
        let dt = 1.0e6 / self.sampling_rate;
        let noise = Normal::new(0.0, self.noise_std.max(f64::EPSILON))
            .expect("noise standard deviation is finite");
        // Seed per channel so components differ but replays agree.
        let mut rng = StdRng::seed_from_u64(
            self.seed ^ seis_types::channel::stable_name_hash(&self.name()),
        );

        let mut packets = Vec::new();
        let mut pending_start: Option<i64> = None;
        let mut pending: Vec<f64> = Vec::with_capacity(samples_per_packet);
        let flush =
            |pending_start: &mut Option<i64>, pending: &mut Vec<f64>, packets: &mut Vec<Packet>| {
                if let Some(packet_start) = pending_start.take() {
                    if !pending.is_empty() {
                        packets.push(Packet {
                            network: self.network.clone(),
                            station: self.station.clone(),
                            channel: self.channel.clone(),
                            location_code: self.location_code.clone(),
                            sampling_rate: self.sampling_rate,
                            start_time_us: packet_start,
                            data: std::mem::take(pending),
                        });
                    }
                }
            };

        let mut index = 0i64;
        loop {
            let time_us = start_us + (index as f64 * dt).round() as i64;
            if time_us >= end_us {
                break;
            }
            index += 1;
            if Self::in_gap(gaps, time_us) {
                flush(&mut pending_start, &mut pending, &mut packets);
                continue;
            }
            let time_s = time_us as f64 * 1.0e-6;
            let value = self.amplitude
                * (2.0 * std::f64::consts::PI * self.frequency_hz * time_s).sin()
                + noise.sample(&mut rng);
            if pending_start.is_none() {
                pending_start = Some(time_us);
            }
            pending.push(value);
            if pending.len() >= samples_per_packet {
                flush(&mut pending_start, &mut pending, &mut packets);
            }
        }
        flush(&mut pending_start, &mut pending, &mut packets);
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> SyntheticChannel {
        SyntheticChannel::new("UU", "CVRU", "HHZ", "01")
    }

    #[test]
    fn continuous_generation_chunks_cleanly() {
        let packets = channel().packets(0, 10_000_000, 100, &[]);
        assert_eq!(packets.len(), 10);
        assert_eq!(packets[0].start_time_us, 0);
        assert_eq!(packets[1].start_time_us, 1_000_000);
        assert!(packets.iter().all(|p| p.data.len() == 100));
    }

    #[test]
    fn gaps_split_packets() {
        // Drop 300 ms in the middle of 3 s of data.
        let packets = channel().packets(0, 3_000_000, 1000, &[(1_000_000, 1_300_000)]);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data.len(), 100);
        assert_eq!(packets[1].start_time_us, 1_300_000);
    }

    #[test]
    fn replays_are_deterministic() {
        let a = channel().packets(0, 2_000_000, 200, &[]);
        let b = channel().packets(0, 2_000_000, 200, &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn components_decorrelate() {
        let z = channel().packets(0, 1_000_000, 100, &[]);
        let mut north = channel();
        north.channel = "HHN".to_string();
        let n = north.packets(0, 1_000_000, 100, &[]);
        assert_ne!(z[0].data, n[0].data);
    }
}
