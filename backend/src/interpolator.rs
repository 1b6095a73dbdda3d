//! # interpolator
//!
//! Turns a list of possibly-overlapping, possibly-gappy cache packets into a
//! uniformly sampled window on the sensor's nominal grid, with a per-sample
//! gap mask. Three-component interpolation aligns the three channels on the
//! intersection of their valid ranges and ANDs the masks.
//!
//! Resampling is nearest-neighbor in sample index; the nominal rate matches
//! the source rate in the overwhelming majority of cases and a genuine
//! mismatch is flagged at the sensor level, not here.

use tracing::debug;

use seis_types::{Packet, MICROSECONDS_PER_SECOND};

use crate::error::{Error, Result};

// ── Waveform window ───────────────────────────────────────────────────────────

/// A uniformly sampled, gap-annotated slice of one or three channels.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformWindow {
    /// UTC time of sample 0, microseconds
    pub start_time_us: i64,
    pub sampling_rate: f64,
    /// One (1C) or three (3C, vertical/north/east order) signals of equal
    /// length
    pub signals: Vec<Vec<f64>>,
    /// 1 = trustworthy sample, 0 = inside a gap wider than the tolerance
    pub gap_mask: Vec<u8>,
}

impl WaveformWindow {
    pub fn empty(sampling_rate: f64, component_count: usize) -> Self {
        Self {
            start_time_us: 0,
            sampling_rate,
            signals: vec![Vec::new(); component_count],
            gap_mask: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.gap_mask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gap_mask.is_empty()
    }

    pub fn sample_spacing_us(&self) -> f64 {
        MICROSECONDS_PER_SECOND / self.sampling_rate
    }

    /// UTC time of the last sample: start + (N-1)/rate.
    pub fn end_time_us(&self) -> i64 {
        if self.is_empty() {
            return self.start_time_us;
        }
        let span = (self.len() - 1) as f64 * self.sample_spacing_us();
        self.start_time_us + span.round() as i64
    }

    pub fn duration_us(&self) -> i64 {
        self.end_time_us() - self.start_time_us
    }

    pub fn have_gaps(&self) -> bool {
        self.gap_mask.iter().any(|&m| m == 0)
    }
}

// ── Interpolator ──────────────────────────────────────────────────────────────

pub struct Interpolator {
    nominal_sampling_rate: f64,
    gap_tolerance_us: i64,
}

impl Interpolator {
    pub fn new(nominal_sampling_rate: f64, gap_tolerance_samples: u32) -> Result<Self> {
        if !(nominal_sampling_rate > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "nominal sampling rate {nominal_sampling_rate} is not positive"
            )));
        }
        let gap_tolerance_us = (gap_tolerance_samples as f64 / nominal_sampling_rate
            * MICROSECONDS_PER_SECOND)
            .round() as i64;
        Ok(Self {
            nominal_sampling_rate,
            gap_tolerance_us,
        })
    }

    pub fn nominal_sampling_rate(&self) -> f64 {
        self.nominal_sampling_rate
    }

    pub fn gap_tolerance_us(&self) -> i64 {
        self.gap_tolerance_us
    }

    fn sample_spacing_us(&self) -> f64 {
        MICROSECONDS_PER_SECOND / self.nominal_sampling_rate
    }

    /// Interpolates one channel onto the nominal grid anchored at `t0_us`,
    /// clipped to [t0_us, t1_us]. An input covering less than one grid
    /// sample yields an empty window, which is not an error.
    pub fn interpolate(&self, packets: &[Packet], t0_us: i64, t1_us: i64) -> Result<WaveformWindow> {
        if t1_us <= t0_us {
            return Err(Error::InvalidArgument(format!(
                "clip window start {t0_us} is not before end {t1_us}"
            )));
        }
        match self.resample_channel(packets, t0_us, t1_us)? {
            None => Ok(WaveformWindow::empty(self.nominal_sampling_rate, 1)),
            Some(channel) => {
                let dt = self.sample_spacing_us();
                Ok(WaveformWindow {
                    start_time_us: t0_us + (channel.first_index as f64 * dt).round() as i64,
                    sampling_rate: self.nominal_sampling_rate,
                    gap_mask: channel.mask,
                    signals: vec![channel.values],
                })
            }
        }
    }

    /// Interpolates an aligned three-component set onto the nominal grid.
    /// The output covers the intersection of the three channels' valid
    /// ranges; the mask is the per-sample AND of the component masks.
    pub fn interpolate3(
        &self,
        vertical: &[Packet],
        north: &[Packet],
        east: &[Packet],
        t0_us: i64,
        t1_us: i64,
    ) -> Result<WaveformWindow> {
        if t1_us <= t0_us {
            return Err(Error::InvalidArgument(format!(
                "clip window start {t0_us} is not before end {t1_us}"
            )));
        }
        let empty = || WaveformWindow::empty(self.nominal_sampling_rate, 3);
        let Some(v) = self.resample_channel(vertical, t0_us, t1_us)? else {
            return Ok(empty());
        };
        let Some(n) = self.resample_channel(north, t0_us, t1_us)? else {
            return Ok(empty());
        };
        let Some(e) = self.resample_channel(east, t0_us, t1_us)? else {
            return Ok(empty());
        };
        // All three grids are anchored at t0, so alignment is an integer
        // index shift.
        let first = v.first_index.max(n.first_index).max(e.first_index);
        let last = v.last_index().min(n.last_index()).min(e.last_index());
        if last < first {
            return Ok(empty());
        }
        let count = (last - first + 1) as usize;
        let slice = |c: &ResampledChannel| -> Vec<f64> {
            let offset = (first - c.first_index) as usize;
            c.values[offset..offset + count].to_vec()
        };
        let mut gap_mask = vec![1u8; count];
        for c in [&v, &n, &e] {
            let offset = (first - c.first_index) as usize;
            for (m, &cm) in gap_mask.iter_mut().zip(&c.mask[offset..offset + count]) {
                *m &= cm;
            }
        }
        let dt = self.sample_spacing_us();
        Ok(WaveformWindow {
            start_time_us: t0_us + (first as f64 * dt).round() as i64,
            sampling_rate: self.nominal_sampling_rate,
            signals: vec![slice(&v), slice(&n), slice(&e)],
            gap_mask,
        })
    }

    fn resample_channel(
        &self,
        packets: &[Packet],
        t0_us: i64,
        t1_us: i64,
    ) -> Result<Option<ResampledChannel>> {
        let dt = self.sample_spacing_us();
        let half = (dt / 2.0).round() as i64;

        // Keep packets that overlap the clip window, sorted by start time.
        let mut spans: Vec<&Packet> = packets
            .iter()
            .filter(|p| !p.data.is_empty() && p.sampling_rate > 0.0)
            .filter(|p| p.end_time_us() >= t0_us && p.start_time_us <= t1_us)
            .collect();
        if spans.is_empty() {
            return Ok(None);
        }
        spans.sort_by_key(|p| p.start_time_us);

        let coverage_start = spans[0].start_time_us.max(t0_us);
        let coverage_end = spans
            .iter()
            .map(|p| p.end_time_us())
            .max()
            .expect("spans is non-empty")
            .min(t1_us);
        let first_index = (((coverage_start - t0_us) as f64) / dt - 1.0e-9).ceil() as i64;
        let last_index = (((coverage_end - t0_us) as f64) / dt + 1.0e-9).floor() as i64;
        if last_index < first_index {
            return Ok(None);
        }

        let count = (last_index - first_index + 1) as usize;
        let mut values = vec![0.0f64; count];
        let mut mask = vec![1u8; count];

        let mut current = 0usize;
        // Running maximum end over spans already reached, with the sample
        // value at that edge; carries the signal over tolerable gaps.
        let mut reached_end = spans[0].end_time_us();
        let mut edge_value = *spans[0].data.last().expect("non-empty packet");
        for index in 0..count {
            let grid_index = first_index + index as i64;
            let tk = t0_us + (grid_index as f64 * dt).round() as i64;
            while current + 1 < spans.len() && spans[current + 1].start_time_us <= tk {
                current += 1;
                let end = spans[current].end_time_us();
                if end > reached_end {
                    reached_end = end;
                    edge_value = *spans[current].data.last().expect("non-empty packet");
                }
            }
            let span = spans[current];
            if tk <= span.end_time_us() + half {
                values[index] = nearest_sample(span, tk);
            } else if tk <= reached_end {
                // Shadowed by an earlier, longer packet; carry its edge.
                values[index] = edge_value;
            } else if let Some(next) = spans.get(current + 1) {
                let gap = next.start_time_us - reached_end;
                if gap > self.gap_tolerance_us {
                    mask[index] = 0;
                } else if tk - reached_end <= next.start_time_us - tk {
                    values[index] = edge_value;
                } else {
                    values[index] = *next.data.first().expect("non-empty packet");
                }
            } else {
                // Past all data; only reachable through rounding at the very
                // edge of coverage.
                debug!(tk, "grid sample beyond packet coverage");
                mask[index] = 0;
            }
        }
        Ok(Some(ResampledChannel {
            first_index,
            values,
            mask,
        }))
    }
}

struct ResampledChannel {
    /// Index on the grid anchored at t0 of the first output sample
    first_index: i64,
    values: Vec<f64>,
    mask: Vec<u8>,
}

impl ResampledChannel {
    fn last_index(&self) -> i64 {
        self.first_index + self.values.len() as i64 - 1
    }
}

fn nearest_sample(packet: &Packet, tk: i64) -> f64 {
    let spacing = MICROSECONDS_PER_SECOND / packet.sampling_rate;
    let index = ((tk - packet.start_time_us) as f64 / spacing).round() as i64;
    let index = index.clamp(0, packet.data.len() as i64 - 1) as usize;
    packet.data[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f64 = 100.0;
    const DT: i64 = 10_000;

    fn packet(start_time_us: i64, data: Vec<f64>) -> Packet {
        Packet {
            network: "UU".to_string(),
            station: "CVRU".to_string(),
            channel: "HHZ".to_string(),
            location_code: "01".to_string(),
            sampling_rate: RATE,
            start_time_us,
            data,
        }
    }

    fn ramp(start_value: f64, count: usize) -> Vec<f64> {
        (0..count).map(|i| start_value + i as f64).collect()
    }

    fn interpolator() -> Interpolator {
        Interpolator::new(RATE, 5).unwrap()
    }

    #[test]
    fn gap_tolerance_converts_to_microseconds() {
        assert_eq!(interpolator().gap_tolerance_us(), 50_000);
        assert_eq!(Interpolator::new(40.0, 5).unwrap().gap_tolerance_us(), 125_000);
    }

    #[test]
    fn continuous_packets_produce_gapless_window() {
        let packets = vec![
            packet(0, ramp(0.0, 100)),
            packet(100 * DT, ramp(100.0, 100)),
        ];
        let window = interpolator()
            .interpolate(&packets, 0, 300 * DT)
            .unwrap();
        assert_eq!(window.len(), 200);
        assert!(!window.have_gaps());
        assert_eq!(window.start_time_us, 0);
        assert_eq!(window.end_time_us(), 199 * DT);
        // end − start == (len − 1)/rate within rounding
        assert_eq!(
            window.duration_us(),
            ((window.len() - 1) as f64 * window.sample_spacing_us()).round() as i64
        );
        assert_eq!(window.signals[0][0], 0.0);
        assert_eq!(window.signals[0][150], 150.0);
    }

    #[test]
    fn wide_gap_is_masked_and_zero_filled() {
        // 100 samples, then silence for 7 sample periods, then 100 more.
        // Samples strictly between the packets fall in a 70 ms gap, wider
        // than the 50 ms tolerance.
        let packets = vec![
            packet(0, ramp(1.0, 100)),
            packet(99 * DT + 7 * DT, ramp(1.0, 100)),
        ];
        let window = interpolator()
            .interpolate(&packets, 0, 300 * DT)
            .unwrap();
        assert!(window.have_gaps());
        let masked: usize = window.gap_mask.iter().filter(|&&m| m == 0).count();
        assert_eq!(masked, 6);
        for (value, mask) in window.signals[0].iter().zip(&window.gap_mask) {
            if *mask == 0 {
                assert_eq!(*value, 0.0);
            } else {
                assert!(*value != 0.0);
            }
        }
    }

    #[test]
    fn narrow_gap_continues_the_signal() {
        // 4 missing sample periods: inside tolerance, no masking.
        let packets = vec![
            packet(0, ramp(1.0, 100)),
            packet(99 * DT + 5 * DT, ramp(200.0, 100)),
        ];
        let window = interpolator()
            .interpolate(&packets, 0, 300 * DT)
            .unwrap();
        assert!(!window.have_gaps());
        // The bridged samples carry the nearer packet edge.
        assert_eq!(window.signals[0][100], 100.0);
        assert_eq!(window.signals[0][103], 200.0);
    }

    #[test]
    fn clip_window_drops_outside_packets() {
        let packets = vec![
            packet(-2_000_000, ramp(0.0, 100)),
            packet(0, ramp(0.0, 100)),
        ];
        let window = interpolator()
            .interpolate(&packets, 0, 99 * DT)
            .unwrap();
        assert_eq!(window.start_time_us, 0);
        assert_eq!(window.len(), 100);
    }

    #[test]
    fn no_coverage_yields_empty_window() {
        let packets = vec![packet(10_000_000, ramp(0.0, 100))];
        let window = interpolator().interpolate(&packets, 0, 1_000_000).unwrap();
        assert!(window.is_empty());
        let window = interpolator().interpolate(&[], 0, 1_000_000).unwrap();
        assert!(window.is_empty());
    }

    #[test]
    fn interpolation_is_idempotent() {
        let packets = vec![
            packet(0, ramp(3.0, 100)),
            packet(99 * DT + 7 * DT, ramp(9.0, 50)),
        ];
        let a = interpolator().interpolate(&packets, 0, 300 * DT).unwrap();
        let b = interpolator().interpolate(&packets, 0, 300 * DT).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn three_components_align_on_intersection() {
        let vertical = vec![packet(0, ramp(0.0, 200))];
        let north = vec![packet(10 * DT, ramp(0.0, 200))];
        let east = vec![packet(5 * DT, ramp(0.0, 220))];
        let window = interpolator()
            .interpolate3(&vertical, &north, &east, 0, 400 * DT)
            .unwrap();
        // Intersection: [10*DT, 199*DT]
        assert_eq!(window.start_time_us, 10 * DT);
        assert_eq!(window.len(), 190);
        assert_eq!(window.signals.len(), 3);
        for signal in &window.signals {
            assert_eq!(signal.len(), window.gap_mask.len());
        }
    }

    #[test]
    fn three_component_mask_is_the_and_of_components() {
        // North has a wide gap; the group's mask inherits it.
        let vertical = vec![packet(0, ramp(1.0, 300))];
        let north = vec![
            packet(0, ramp(1.0, 100)),
            packet(99 * DT + 7 * DT, ramp(1.0, 194)),
        ];
        let east = vec![packet(0, ramp(1.0, 300))];
        let window = interpolator()
            .interpolate3(&vertical, &north, &east, 0, 400 * DT)
            .unwrap();
        let masked: usize = window.gap_mask.iter().filter(|&&m| m == 0).count();
        assert_eq!(masked, 6);
    }

    #[test]
    fn missing_component_yields_empty_window() {
        let vertical = vec![packet(0, ramp(0.0, 100))];
        let window = interpolator()
            .interpolate3(&vertical, &[], &vertical.clone(), 0, 200 * DT)
            .unwrap();
        assert!(window.is_empty());
        assert_eq!(window.signals.len(), 3);
    }

    #[test]
    fn inverted_clip_window_is_an_error() {
        let err = interpolator().interpolate(&[], 1_000, 1_000);
        assert!(err.is_err());
    }
}
