//! # sensor
//!
//! Per-sensor state machines: one row of the pipeline's table, owning the
//! Query → Inference → Publish loop for either a three-component group or a
//! single vertical channel.
//!
//! Each machine tracks the timestamp just past its last emitted probability
//! sample (`last_probability_time`) and uses it to build cache queries and
//! slice detector output so the emitted stream never overlaps and never
//! repeats a sample. The wall clock is handed in by the worker each step,
//! never read here.

use tracing::{debug, warn};

use seis_types::channel::stable_name_hash;
use seis_types::messages::{
    BulkDataRequest, DataRequest, InferenceStrategy, ProcessingRequest,
};
use seis_types::{ChannelDescriptor, ProbabilityPacket, ThreeComponentGroup};

use crate::broadcast::ProbabilitySink;
use crate::cache_client::CacheService;
use crate::error::{Error, Result};
use crate::inference::{DetectorProperties, DetectorService};
use crate::interpolator::{Interpolator, WaveformWindow};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Timing and windowing knobs for one sensor state machine. The window and
/// center-window fields come from the detector contract; the rest from the
/// module configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorConfig {
    /// Fixed detector input duration in microseconds
    pub detector_window_us: i64,
    /// Force a latency reset when the wall clock runs this far ahead of
    /// `last_probability_time`
    pub maximum_signal_latency_us: i64,
    /// Gap tolerance in samples, converted per-sensor to microseconds
    pub gap_tolerance_samples: u32,
    /// Minimum spacing between cache queries as a percentage of the
    /// detector window
    pub data_query_wait_percentage: f64,
    /// First trusted output sample of a detector window
    pub center_window_start: usize,
    /// One past the last trusted output sample
    pub center_window_end: usize,
    /// Detector output sampling rate in Hz
    pub output_sampling_rate: f64,
    /// Safety margin added to the front of each cache query
    pub prepad_query_us: i64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            detector_window_us: 10_080_000,
            maximum_signal_latency_us: 180_000_000,
            gap_tolerance_samples: 5,
            data_query_wait_percentage: 30.0,
            center_window_start: 254,
            center_window_end: 754,
            output_sampling_rate: 100.0,
            prepad_query_us: 500_000,
        }
    }
}

impl SensorConfig {
    /// Copies the window contract from a detector's declared properties,
    /// keeping every operational default.
    pub fn from_properties(properties: &DetectorProperties) -> Self {
        Self {
            detector_window_us: properties.window_duration_us(),
            center_window_start: properties.center_window_start,
            center_window_end: properties.center_window_end,
            output_sampling_rate: properties.output_sampling_rate,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.detector_window_us <= 0 {
            return Err(Error::InvalidArgument(
                "detector window must be positive".to_string(),
            ));
        }
        if self.maximum_signal_latency_us <= 0 {
            return Err(Error::InvalidArgument(
                "maximum signal latency must be positive".to_string(),
            ));
        }
        if !(self.data_query_wait_percentage > 0.0 && self.data_query_wait_percentage < 100.0) {
            return Err(Error::InvalidArgument(format!(
                "data query wait percentage {} must be in (0, 100)",
                self.data_query_wait_percentage
            )));
        }
        if self.center_window_start >= self.center_window_end {
            return Err(Error::InvalidArgument(
                "center window start must precede its end".to_string(),
            ));
        }
        if !(self.output_sampling_rate > 0.0) {
            return Err(Error::InvalidArgument(
                "output sampling rate must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Minimum spacing between successive cache queries.
    pub fn query_wait_interval_us(&self) -> i64 {
        (self.detector_window_us as f64 * self.data_query_wait_percentage / 100.0).round() as i64
    }

    /// Time from a window's start to its first trusted output sample.
    pub fn start_window_time_us(&self) -> i64 {
        (self.center_window_start as f64 / self.output_sampling_rate * 1.0e6).round() as i64
    }

    /// Time from a window's start to the end of its trusted region.
    pub fn end_window_time_us(&self) -> i64 {
        (self.center_window_end as f64 / self.output_sampling_rate * 1.0e6).round() as i64
    }

    /// Output sample spacing in microseconds.
    pub fn output_spacing_us(&self) -> i64 {
        (1.0e6 / self.output_sampling_rate).round() as i64
    }
}

/// Where a sensor is in its processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Query,
    Inference,
    Publish,
}

// Sentinel old enough that the first pacing check always passes, without
// risking i64 underflow in the comparison arithmetic.
const NEVER_QUERIED_US: i64 = i64::MIN / 4;

// ── Shared slicing arithmetic ─────────────────────────────────────────────────

/// Start/end sample indices of the newly valid interior of a probability
/// trace. `i1` is where the center-window guarantee stops holding; `i0`
/// continues from the last emitted sample in steady state, or skips the
/// untrusted prefix after a cold start or gap.
fn probability_slice_indices(
    config: &SensorConfig,
    signal_start_us: i64,
    signal_end_us: i64,
    last_probability_time_us: i64,
    trace_samples: usize,
) -> (usize, usize) {
    let dt = config.output_spacing_us();
    let end_window_duration = config.detector_window_us - config.end_window_time_us();
    let mut i1 = (((signal_end_us - end_window_duration) - signal_start_us) as f64 / dt as f64)
        .round() as i64;
    i1 = i1.clamp(0, trace_samples as i64);
    let i0 = if signal_start_us + config.start_window_time_us()
        <= last_probability_time_us + dt / 2
    {
        // The detector had a proper build-up: continue from the last
        // emitted sample.
        ((last_probability_time_us - signal_start_us) as f64 / dt as f64).round() as i64
    } else {
        // Cold start or gap: the first trusted sample sits a center-window
        // start into the trace.
        (config.start_window_time_us() as f64 / dt as f64).round() as i64
    };
    let i0 = i0.clamp(0, i1);
    (i0 as usize, i1 as usize)
}

/// Copies the [i0, i1) slice out of a probability trace, applying the gap
/// mask where it is usable.
fn extract_probability(
    trace: &[f64],
    i0: usize,
    i1: usize,
    window: &WaveformWindow,
    changes_sampling_rate: bool,
) -> Vec<f64> {
    let i1 = i1.min(trace.len());
    if i0 >= i1 {
        return Vec::new();
    }
    if !window.have_gaps() {
        return trace[i0..i1].to_vec();
    }
    if !changes_sampling_rate {
        (i0..i1)
            .map(|i| trace[i] * f64::from(*window.gap_mask.get(i).unwrap_or(&1)))
            .collect()
    } else {
        // The mask lives on the sensor grid and does not align
        // sample-for-sample with a differently-rated output trace.
        // TODO: resample the mask onto the output grid before applying it.
        trace[i0..i1].to_vec()
    }
}

fn probability_template(
    network: &str,
    station: &str,
    channel: &str,
    location_code: &str,
    output_rate: f64,
    original_channels: Vec<String>,
    positive_class: &str,
    algorithm: &str,
) -> ProbabilityPacket {
    ProbabilityPacket {
        network: network.to_string(),
        station: station.to_string(),
        channel: channel.to_string(),
        location_code: location_code.to_string(),
        sampling_rate: output_rate,
        start_time_us: 0,
        data: Vec::new(),
        original_channels,
        positive_class: positive_class.to_string(),
        negative_class: "Noise".to_string(),
        algorithm: algorithm.to_string(),
    }
}

fn data_request(
    identifier: i64,
    network: &str,
    station: &str,
    channel: &str,
    location_code: &str,
) -> DataRequest {
    DataRequest {
        identifier,
        network: network.to_string(),
        station: station.to_string(),
        channel: channel.to_string(),
        location_code: location_code.to_string(),
        start_time_s: 0.0,
        end_time_s: 0.0,
    }
}

// ── Three-component sensor ────────────────────────────────────────────────────

/// State machine for one three-component group running the P and/or S
/// detectors on a shared interpolated signal.
pub struct ThreeComponentSensor {
    group: ThreeComponentGroup,
    name: String,
    hash: u64,
    config: SensorConfig,
    interpolator: Interpolator,
    changes_sampling_rate: bool,
    run_p: bool,
    run_s: bool,
    // Fully-addressed request templates; only the query times change.
    vertical_request: DataRequest,
    north_request: DataRequest,
    east_request: DataRequest,
    p_inference_request: ProcessingRequest,
    s_inference_request: ProcessingRequest,
    p_packet_template: ProbabilityPacket,
    s_packet_template: ProbabilityPacket,
    window: WaveformWindow,
    state: State,
    last_query_time_us: i64,
    last_probability_time_us: i64,
    request_identifier: i64,
    inferenced_p: bool,
    inferenced_s: bool,
    p_outgoing: Option<ProbabilityPacket>,
    s_outgoing: Option<ProbabilityPacket>,
}

impl ThreeComponentSensor {
    pub fn new(
        group: ThreeComponentGroup,
        config: SensorConfig,
        run_p: bool,
        run_s: bool,
        now_us: i64,
    ) -> Result<Self> {
        config.validate()?;
        if !run_p && !run_s {
            return Err(Error::InvalidArgument(format!(
                "{}: no detector enabled",
                group.name()
            )));
        }
        let sampling_rate = group.nominal_sampling_rate();
        let interpolator = Interpolator::new(sampling_rate, config.gap_tolerance_samples)?;
        let changes_sampling_rate =
            (config.output_sampling_rate - sampling_rate).abs() > 1.0e-4;

        let network = group.network().to_string();
        let station = group.station().to_string();
        let location = group.location_or_default();
        let prefix = group.band_prefix().to_string();
        let original_channels = vec![
            group.vertical.channel.clone(),
            group.north.channel.clone(),
            group.east.channel.clone(),
        ];
        let name = group.name();
        let hash = group.hash();

        let inference_request = |identifier: i64| ProcessingRequest {
            identifier,
            sampling_rate,
            strategy: InferenceStrategy::SlidingWindow,
            signals: Vec::new(),
        };

        Ok(Self {
            vertical_request: data_request(0, &network, &station, &group.vertical.channel, &location),
            north_request: data_request(1, &network, &station, &group.north.channel, &location),
            east_request: data_request(2, &network, &station, &group.east.channel, &location),
            p_inference_request: inference_request(1),
            s_inference_request: inference_request(2),
            p_packet_template: probability_template(
                &network,
                &station,
                &format!("{prefix}P"),
                &location,
                config.output_sampling_rate,
                original_channels.clone(),
                "P",
                "UNetThreeComponentP",
            ),
            s_packet_template: probability_template(
                &network,
                &station,
                &format!("{prefix}S"),
                &location,
                config.output_sampling_rate,
                original_channels,
                "S",
                "UNetThreeComponentS",
            ),
            group,
            name,
            hash,
            config,
            interpolator,
            changes_sampling_rate,
            run_p,
            run_s,
            window: WaveformWindow::empty(sampling_rate, 3),
            state: State::Query,
            last_query_time_us: NEVER_QUERIED_US,
            last_probability_time_us: now_us,
            request_identifier: 0,
            inferenced_p: false,
            inferenced_s: false,
            p_outgoing: None,
            s_outgoing: None,
        })
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn group(&self) -> &ThreeComponentGroup {
        &self.group
    }

    pub fn last_probability_time_us(&self) -> i64 {
        self.last_probability_time_us
    }

    /// Error recovery: clear the step flags and fall back to Query without
    /// touching `last_probability_time`.
    pub fn reset_to_query(&mut self) {
        self.inferenced_p = false;
        self.inferenced_s = false;
        self.p_outgoing = None;
        self.s_outgoing = None;
        self.state = State::Query;
    }

    /// Query step: fetch the bytes needed to extend the probability stream
    /// and interpolate them. Moves to Inference only when the window is
    /// long enough to produce new trusted samples.
    pub fn query_packet_cache(
        &mut self,
        now_us: i64,
        cache: &mut dyn CacheService,
    ) -> Result<()> {
        if self.state != State::Query {
            return Ok(());
        }
        // Never spam the cache: at most one query per wait interval.
        if now_us - self.config.query_wait_interval_us() < self.last_query_time_us {
            return Ok(());
        }
        // Highly latent data: snap to the present rather than chase the
        // backlog. The one allowed discontinuity in the output stream.
        if now_us - self.config.maximum_signal_latency_us > self.last_probability_time_us {
            debug!(sensor = %self.name, "latency reset");
            self.last_probability_time_us = now_us;
        }
        if self.request_identifier > i64::MAX - 10 {
            self.request_identifier = 0;
        }
        let t0_us = self.last_probability_time_us
            - self.config.start_window_time_us()
            - self.config.prepad_query_us;
        let t1_us = now_us;
        let start_time_s = seis_types::micros_to_seconds(t0_us);
        let end_time_s = seis_types::micros_to_seconds(t1_us);
        self.vertical_request.set_query_times(start_time_s, end_time_s);
        self.north_request.set_query_times(start_time_s, end_time_s);
        self.east_request.set_query_times(start_time_s, end_time_s);
        let bulk = BulkDataRequest {
            identifier: self.request_identifier,
            requests: vec![
                self.vertical_request.clone(),
                self.north_request.clone(),
                self.east_request.clone(),
            ],
        };
        self.request_identifier += 1;
        let reply = match cache.bulk_request(&bulk) {
            Ok(reply) => {
                self.last_query_time_us = now_us;
                reply
            }
            Err(e) => {
                // The pacing clock still ticks so a failing cache cannot be
                // spam-retried.
                self.last_query_time_us = now_us;
                return Err(e);
            }
        };
        // Demultiplex by request identifier; a short reply happens a lot
        // with latent channels and is not an error.
        if reply.responses.len() != 3 {
            return Ok(());
        }
        let Some(vertical) = reply.response_for(self.vertical_request.identifier) else {
            return Ok(());
        };
        let Some(north) = reply.response_for(self.north_request.identifier) else {
            return Ok(());
        };
        let Some(east) = reply.response_for(self.east_request.identifier) else {
            return Ok(());
        };
        if vertical.packets.is_empty() || north.packets.is_empty() || east.packets.is_empty() {
            return Ok(());
        }
        let window = self.interpolator.interpolate3(
            &vertical.packets,
            &north.packets,
            &east.packets,
            t0_us,
            t1_us,
        )?;
        if window.is_empty() {
            return Ok(());
        }
        // Enough signal for one full detector window?
        if window.duration_us() < self.config.detector_window_us {
            return Ok(());
        }
        // Enough new signal to extend the stream?
        let end_window_duration =
            self.config.detector_window_us - self.config.end_window_time_us();
        if window.end_time_us() < self.last_probability_time_us + end_window_duration {
            return Ok(());
        }
        self.window = window;
        self.state = State::Inference;
        Ok(())
    }

    /// Inference step: run the enabled detectors over the interpolated
    /// window and slice out the newly valid probability samples. The stream
    /// position advances even when a phase fails, so one bad inference
    /// cannot stall the sensor.
    pub fn run_inference(
        &mut self,
        mut p_detector: Option<&mut dyn DetectorService>,
        mut s_detector: Option<&mut dyn DetectorService>,
    ) -> Result<()> {
        self.inferenced_p = false;
        self.inferenced_s = false;
        self.p_outgoing = None;
        self.s_outgoing = None;
        if self.state != State::Inference {
            return Ok(());
        }
        let signal_start = self.window.start_time_us;
        let signal_end = self.window.end_time_us();

        let mut p_trace: Option<Vec<f64>> = None;
        if self.run_p {
            if let Some(detector) = p_detector.as_deref_mut() {
                self.p_inference_request.signals = self.window.signals.clone();
                match detector.process(&self.p_inference_request) {
                    Ok(response) => {
                        p_trace = response.probability_signal;
                        self.inferenced_p = p_trace.is_some();
                    }
                    Err(e) => {
                        warn!(sensor = %self.name, "P inference request failed: {e}");
                    }
                }
                self.p_inference_request.signals = Vec::new();
            }
        }
        let mut s_trace: Option<Vec<f64>> = None;
        if self.run_s {
            if let Some(detector) = s_detector.as_deref_mut() {
                self.s_inference_request.signals = self.window.signals.clone();
                match detector.process(&self.s_inference_request) {
                    Ok(response) => {
                        s_trace = response.probability_signal;
                        self.inferenced_s = s_trace.is_some();
                    }
                    Err(e) => {
                        warn!(sensor = %self.name, "S inference request failed: {e}");
                    }
                }
                self.s_inference_request.signals = Vec::new();
            }
        }

        // The only cross-detector consistency requirement: when both ran,
        // the traces must agree in length.
        let trace_samples = match (&p_trace, &s_trace) {
            (Some(p), Some(s)) => {
                if p.len() != s.len() {
                    self.state = State::Query;
                    return Err(Error::Algorithmic(format!(
                        "{}: P and S probability traces differ in length ({} vs {})",
                        self.name,
                        p.len(),
                        s.len()
                    )));
                }
                p.len()
            }
            (Some(p), None) => p.len(),
            (None, Some(s)) => s.len(),
            (None, None) => {
                self.state = State::Query;
                return Err(Error::Algorithmic(format!(
                    "{}: no probability trace produced",
                    self.name
                )));
            }
        };

        let (i0, i1) = probability_slice_indices(
            &self.config,
            signal_start,
            signal_end,
            self.last_probability_time_us,
            trace_samples,
        );
        let dt = self.config.output_spacing_us();
        if let Some(trace) = &p_trace {
            let data =
                extract_probability(trace, i0, i1, &self.window, self.changes_sampling_rate);
            if !data.is_empty() {
                let mut packet = self.p_packet_template.clone();
                packet.start_time_us = signal_start + i0 as i64 * dt;
                packet.data = data;
                self.p_outgoing = Some(packet);
            }
        }
        if let Some(trace) = &s_trace {
            let data =
                extract_probability(trace, i0, i1, &self.window, self.changes_sampling_rate);
            if !data.is_empty() {
                let mut packet = self.s_packet_template.clone();
                packet.start_time_us = signal_start + i0 as i64 * dt;
                packet.data = data;
                self.s_outgoing = Some(packet);
            }
        }
        // The machine moves forward from here no matter what was extracted;
        // the next query continues at this timestamp.
        self.last_probability_time_us = signal_start + i1 as i64 * dt;
        debug!(
            sensor = %self.name,
            inferenced_p = self.inferenced_p,
            inferenced_s = self.inferenced_s,
            i0,
            i1,
            "inference step complete"
        );
        self.state = State::Publish;
        Ok(())
    }

    /// Publish step: send whatever the inference step marked for broadcast.
    /// Failures are reported but never roll the stream position back.
    pub fn publish(&mut self, sink: &mut dyn ProbabilitySink) -> Result<()> {
        if self.state != State::Publish {
            return Ok(());
        }
        let mut errors = String::new();
        if let Some(packet) = self.p_outgoing.take() {
            if let Err(e) = sink.send(&packet) {
                warn!(sensor = %self.name, "problems broadcasting P: {e}");
                errors = format!("problems broadcasting P: {e}");
            }
        }
        if let Some(packet) = self.s_outgoing.take() {
            if let Err(e) = sink.send(&packet) {
                warn!(sensor = %self.name, "problems broadcasting S: {e}");
                if !errors.is_empty() {
                    errors.push_str("; ");
                }
                errors.push_str(&format!("problems broadcasting S: {e}"));
            }
        }
        self.state = State::Query;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Communication(errors))
        }
    }
}

// ── One-component sensor ──────────────────────────────────────────────────────

/// State machine for a single vertical channel running the one-component P
/// detector. Same loop as the three-component machine with one cache range
/// query and one emitted phase.
pub struct OneComponentSensor {
    channel: ChannelDescriptor,
    name: String,
    hash: u64,
    config: SensorConfig,
    interpolator: Interpolator,
    changes_sampling_rate: bool,
    data_request: DataRequest,
    p_inference_request: ProcessingRequest,
    p_packet_template: ProbabilityPacket,
    window: WaveformWindow,
    state: State,
    last_query_time_us: i64,
    last_probability_time_us: i64,
    request_identifier: i64,
    inferenced_p: bool,
    p_outgoing: Option<ProbabilityPacket>,
}

impl OneComponentSensor {
    pub fn new(channel: ChannelDescriptor, config: SensorConfig, now_us: i64) -> Result<Self> {
        config.validate()?;
        channel.validate().map_err(Error::from)?;
        if channel.channel.len() < 3 {
            return Err(Error::InvalidArgument(format!(
                "{}: channel code too short",
                channel.name()
            )));
        }
        let sampling_rate = channel.sampling_rate;
        let interpolator = Interpolator::new(sampling_rate, config.gap_tolerance_samples)?;
        let changes_sampling_rate =
            (config.output_sampling_rate - sampling_rate).abs() > 1.0e-4;
        let location = channel.location_or_default();
        let name = format!(
            "{}.{}.{}.{}",
            channel.network, channel.station, channel.channel, location
        );
        let hash = stable_name_hash(&name);
        let prefix = channel.channel[..2].to_string();
        Ok(Self {
            data_request: data_request(
                0,
                &channel.network,
                &channel.station,
                &channel.channel,
                &location,
            ),
            p_inference_request: ProcessingRequest {
                identifier: 1,
                sampling_rate,
                strategy: InferenceStrategy::SlidingWindow,
                signals: Vec::new(),
            },
            p_packet_template: probability_template(
                &channel.network,
                &channel.station,
                &format!("{prefix}P"),
                &location,
                config.output_sampling_rate,
                vec![channel.channel.clone()],
                "P",
                "UNetOneComponentP",
            ),
            channel,
            name,
            hash,
            config,
            interpolator,
            changes_sampling_rate,
            window: WaveformWindow::empty(sampling_rate, 1),
            state: State::Query,
            last_query_time_us: NEVER_QUERIED_US,
            last_probability_time_us: now_us,
            request_identifier: 0,
            inferenced_p: false,
            p_outgoing: None,
        })
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn channel(&self) -> &ChannelDescriptor {
        &self.channel
    }

    pub fn last_probability_time_us(&self) -> i64 {
        self.last_probability_time_us
    }

    pub fn reset_to_query(&mut self) {
        self.inferenced_p = false;
        self.p_outgoing = None;
        self.state = State::Query;
    }

    pub fn query_packet_cache(
        &mut self,
        now_us: i64,
        cache: &mut dyn CacheService,
    ) -> Result<()> {
        if self.state != State::Query {
            return Ok(());
        }
        if now_us - self.config.query_wait_interval_us() < self.last_query_time_us {
            return Ok(());
        }
        if now_us - self.config.maximum_signal_latency_us > self.last_probability_time_us {
            debug!(sensor = %self.name, "latency reset");
            self.last_probability_time_us = now_us;
        }
        if self.request_identifier > i64::MAX - 10 {
            self.request_identifier = 0;
        }
        let t0_us = self.last_probability_time_us
            - self.config.start_window_time_us()
            - self.config.prepad_query_us;
        let t1_us = now_us;
        self.data_request.identifier = self.request_identifier;
        self.request_identifier += 1;
        self.data_request.set_query_times(
            seis_types::micros_to_seconds(t0_us),
            seis_types::micros_to_seconds(t1_us),
        );
        let reply = match cache.request(&self.data_request) {
            Ok(reply) => {
                self.last_query_time_us = now_us;
                reply
            }
            Err(e) => {
                self.last_query_time_us = now_us;
                return Err(e);
            }
        };
        if reply.packets.is_empty() {
            return Ok(());
        }
        let window = self.interpolator.interpolate(&reply.packets, t0_us, t1_us)?;
        if window.is_empty() {
            return Ok(());
        }
        if window.duration_us() < self.config.detector_window_us {
            return Ok(());
        }
        let end_window_duration =
            self.config.detector_window_us - self.config.end_window_time_us();
        if window.end_time_us() < self.last_probability_time_us + end_window_duration {
            return Ok(());
        }
        self.window = window;
        self.state = State::Inference;
        Ok(())
    }

    pub fn run_inference(&mut self, detector: &mut dyn DetectorService) -> Result<()> {
        self.inferenced_p = false;
        self.p_outgoing = None;
        if self.state != State::Inference {
            return Ok(());
        }
        let signal_start = self.window.start_time_us;
        let signal_end = self.window.end_time_us();
        self.p_inference_request.signals = self.window.signals.clone();
        let outcome = detector.process(&self.p_inference_request);
        self.p_inference_request.signals = Vec::new();
        let trace = match outcome {
            Ok(response) => match response.probability_signal {
                Some(trace) => trace,
                None => {
                    self.state = State::Query;
                    return Err(Error::Algorithmic(format!(
                        "{}: no probability trace produced",
                        self.name
                    )));
                }
            },
            Err(e) => {
                self.state = State::Query;
                return Err(e);
            }
        };
        self.inferenced_p = true;
        let (i0, i1) = probability_slice_indices(
            &self.config,
            signal_start,
            signal_end,
            self.last_probability_time_us,
            trace.len(),
        );
        let dt = self.config.output_spacing_us();
        let data = extract_probability(&trace, i0, i1, &self.window, self.changes_sampling_rate);
        if !data.is_empty() {
            let mut packet = self.p_packet_template.clone();
            packet.start_time_us = signal_start + i0 as i64 * dt;
            packet.data = data;
            self.p_outgoing = Some(packet);
        }
        self.last_probability_time_us = signal_start + i1 as i64 * dt;
        debug!(
            sensor = %self.name,
            inferenced_p = self.inferenced_p,
            i0,
            i1,
            "inference step complete"
        );
        self.state = State::Publish;
        Ok(())
    }

    pub fn publish(&mut self, sink: &mut dyn ProbabilitySink) -> Result<()> {
        if self.state != State::Publish {
            return Ok(());
        }
        let mut error = None;
        if let Some(packet) = self.p_outgoing.take() {
            if let Err(e) = sink.send(&packet) {
                warn!(sensor = %self.name, "problems broadcasting P: {e}");
                error = Some(format!("problems broadcasting P: {e}"));
            }
        }
        self.state = State::Query;
        match error {
            None => Ok(()),
            Some(message) => Err(Error::Communication(message)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use seis_types::messages::{
        BulkDataResponse, CacheReturnCode, DataResponse, InferenceReturnCode, ProcessingResponse,
    };
    use seis_types::Packet;

    pub const DT: i64 = 10_000;
    pub const WINDOW_US: i64 = 10_080_000;

    // In-process doubles for the remote collaborators.

    pub struct ScriptedCache {
        pub packets_by_channel: Vec<(String, Vec<Packet>)>,
        pub failures_remaining: usize,
        pub calls: usize,
    }

    impl ScriptedCache {
        pub fn new() -> Self {
            Self {
                packets_by_channel: Vec::new(),
                failures_remaining: 0,
                calls: 0,
            }
        }

        pub fn with_channel(mut self, channel: &str, packets: Vec<Packet>) -> Self {
            self.packets_by_channel.push((channel.to_string(), packets));
            self
        }

        fn lookup(&self, channel: &str) -> Vec<Packet> {
            self.packets_by_channel
                .iter()
                .find(|(name, _)| name == channel)
                .map(|(_, packets)| packets.clone())
                .unwrap_or_default()
        }
    }

    impl CacheService for ScriptedCache {
        fn request(&mut self, request: &DataRequest) -> crate::Result<DataResponse> {
            self.calls += 1;
            if self.failures_remaining > 0 {
                self.failures_remaining -= 1;
                return Err(Error::Backend {
                    code: 5,
                    context: "scripted failure".to_string(),
                });
            }
            Ok(DataResponse {
                identifier: request.identifier,
                return_code: CacheReturnCode::Success,
                packets: self.lookup(&request.channel),
            })
        }

        fn bulk_request(&mut self, request: &BulkDataRequest) -> crate::Result<BulkDataResponse> {
            self.calls += 1;
            if self.failures_remaining > 0 {
                self.failures_remaining -= 1;
                return Err(Error::Backend {
                    code: 5,
                    context: "scripted failure".to_string(),
                });
            }
            Ok(BulkDataResponse {
                identifier: request.identifier,
                return_code: CacheReturnCode::Success,
                responses: request
                    .requests
                    .iter()
                    .map(|r| DataResponse {
                        identifier: r.identifier,
                        return_code: CacheReturnCode::Success,
                        packets: self.lookup(&r.channel),
                    })
                    .collect(),
            })
        }
    }

    pub struct ScriptedDetector {
        pub fill: f64,
        pub fail: bool,
    }

    impl ScriptedDetector {
        pub fn constant(fill: f64) -> Self {
            Self { fill, fail: false }
        }

        pub fn failing() -> Self {
            Self {
                fill: 0.0,
                fail: true,
            }
        }
    }

    impl DetectorService for ScriptedDetector {
        fn properties(&self) -> DetectorProperties {
            DetectorProperties::default()
        }

        fn process(&mut self, request: &ProcessingRequest) -> crate::Result<ProcessingResponse> {
            if self.fail {
                return Err(Error::TimedOut(Duration::from_millis(10)));
            }
            request.validate()?;
            Ok(ProcessingResponse {
                identifier: request.identifier,
                return_code: InferenceReturnCode::Success,
                sampling_rate: 100.0,
                probability_signal: Some(vec![self.fill; request.signals[0].len()]),
            })
        }
    }

    #[derive(Default)]
    pub struct CollectingSink {
        pub packets: Vec<ProbabilityPacket>,
        pub fail: bool,
    }

    impl ProbabilitySink for CollectingSink {
        fn send(&mut self, packet: &ProbabilityPacket) -> crate::Result<()> {
            if self.fail {
                return Err(Error::Communication("bus unreachable".to_string()));
            }
            self.packets.push(packet.clone());
            Ok(())
        }
    }

    pub fn descriptor(channel: &str) -> ChannelDescriptor {
        ChannelDescriptor {
            network: "UU".to_string(),
            station: "CVRU".to_string(),
            channel: channel.to_string(),
            location_code: "01".to_string(),
            sampling_rate: 100.0,
            latitude: 38.92,
            longitude: -111.17,
            elevation: 2125.0,
            dip: -90.0,
            azimuth: 0.0,
            on_date_us: 0,
            off_date_us: i64::MAX,
            load_date_us: 0,
        }
    }

    pub fn group() -> ThreeComponentGroup {
        ThreeComponentGroup::new(descriptor("HHZ"), descriptor("HHN"), descriptor("HHE")).unwrap()
    }

    pub fn packet(channel: &str, start_time_us: i64, count: usize) -> Packet {
        Packet {
            network: "UU".to_string(),
            station: "CVRU".to_string(),
            channel: channel.to_string(),
            location_code: "01".to_string(),
            sampling_rate: 100.0,
            start_time_us,
            data: vec![1.0; count],
        }
    }

    /// Packets for all three components covering [0, span_us] continuously.
    pub fn continuous_cache(span_us: i64) -> ScriptedCache {
        let count = (span_us / DT) as usize + 1;
        ScriptedCache::new()
            .with_channel("HHZ", vec![packet("HHZ", 0, count)])
            .with_channel("HHN", vec![packet("HHN", 0, count)])
            .with_channel("HHE", vec![packet("HHE", 0, count)])
    }

    fn sensor() -> ThreeComponentSensor {
        ThreeComponentSensor::new(group(), SensorConfig::default(), true, true, 0).unwrap()
    }

    fn drive_cycle(
        sensor: &mut ThreeComponentSensor,
        now_us: i64,
        cache: &mut ScriptedCache,
        p: &mut ScriptedDetector,
        s: &mut ScriptedDetector,
        sink: &mut CollectingSink,
    ) {
        sensor.query_packet_cache(now_us, cache).unwrap();
        sensor.run_inference(Some(p), Some(s)).unwrap();
        sensor.publish(sink).unwrap();
    }

    #[test]
    fn exact_window_emits_one_trusted_slice() {
        // S1: exactly one detector window of gapless data from t = 0.
        let mut sensor = sensor();
        let mut cache = continuous_cache(WINDOW_US);
        let mut p = ScriptedDetector::constant(0.7);
        let mut s = ScriptedDetector::constant(0.4);
        let mut sink = CollectingSink::default();
        drive_cycle(&mut sensor, WINDOW_US, &mut cache, &mut p, &mut s, &mut sink);

        assert_eq!(sink.packets.len(), 2);
        let p_packet = sink
            .packets
            .iter()
            .find(|packet| packet.positive_class == "P")
            .unwrap();
        assert_eq!(p_packet.channel, "HHP");
        assert_eq!(p_packet.start_time_us, 2_540_000);
        assert_eq!(p_packet.data.len(), 500);
        assert!(p_packet.data.iter().all(|&v| v == 0.7));
        assert_eq!(p_packet.original_channels, vec!["HHZ", "HHN", "HHE"]);
        assert_eq!(sensor.last_probability_time_us(), 7_540_000);
        assert_eq!(sensor.state(), State::Query);
    }

    #[test]
    fn one_sample_short_of_a_window_stays_in_query() {
        // S2: coverage one sample shy of the detector window.
        let mut sensor = sensor();
        let mut cache = continuous_cache(WINDOW_US - DT);
        sensor.query_packet_cache(WINDOW_US, &mut cache).unwrap();
        assert_eq!(sensor.state(), State::Query);
        assert_eq!(sensor.last_probability_time_us(), 0);
        // Inference and publish are no-ops outside their state.
        let mut p = ScriptedDetector::constant(1.0);
        let mut s = ScriptedDetector::constant(1.0);
        sensor
            .run_inference(Some(&mut p), Some(&mut s))
            .unwrap();
        assert_eq!(sensor.last_probability_time_us(), 0);
    }

    #[test]
    fn gap_samples_are_zeroed_in_the_emitted_packet() {
        // S3: two windows of data with a 6-sample gap at 100 Hz.
        let span = 2 * WINDOW_US;
        let head = 501usize; // samples before the gap, ending at 5.00 s
        let gap_samples = 6i64;
        let tail_start = head as i64 * DT + gap_samples * DT;
        let tail = ((span - tail_start) / DT) as usize + 1;
        let channel_packets = |channel: &str| {
            vec![
                packet(channel, 0, head),
                packet(channel, tail_start, tail),
            ]
        };
        let mut cache = ScriptedCache::new()
            .with_channel("HHZ", channel_packets("HHZ"))
            .with_channel("HHN", channel_packets("HHN"))
            .with_channel("HHE", channel_packets("HHE"));
        let mut sensor =
            ThreeComponentSensor::new(group(), SensorConfig::default(), true, false, 0).unwrap();
        let mut p = ScriptedDetector::constant(1.0);
        let mut sink = CollectingSink::default();
        sensor.query_packet_cache(span, &mut cache).unwrap();
        assert_eq!(sensor.state(), State::Inference);
        sensor.run_inference(Some(&mut p), None).unwrap();
        sensor.publish(&mut sink).unwrap();

        assert_eq!(sink.packets.len(), 1);
        let emitted = &sink.packets[0];
        let zeros = emitted.data.iter().filter(|&&v| v == 0.0).count();
        assert_eq!(zeros as i64, gap_samples);
        // The zeroed samples sit exactly over the gap.
        let first_zero = emitted
            .data
            .iter()
            .position(|&v| v == 0.0)
            .unwrap() as i64;
        assert_eq!(emitted.start_time_us + first_zero * DT, head as i64 * DT);
    }

    #[test]
    fn stale_stream_snaps_to_now() {
        // S4: the wall clock runs more than max_latency past the stream.
        let mut sensor = sensor();
        let mut cache = ScriptedCache::new(); // no data at all
        let now = 200_000_000;
        sensor.query_packet_cache(now, &mut cache).unwrap();
        assert_eq!(sensor.last_probability_time_us(), now);
        assert_eq!(sensor.state(), State::Query);
    }

    #[test]
    fn backend_failures_are_paced_and_stateless() {
        // S5: two BackendErrors in a row; the pacing interval must elapse
        // between the attempts and nothing else may change.
        let mut sensor = sensor();
        let mut cache = continuous_cache(WINDOW_US);
        cache.failures_remaining = 2;

        let first_now = WINDOW_US;
        assert!(sensor.query_packet_cache(first_now, &mut cache).is_err());
        sensor.reset_to_query();
        assert_eq!(cache.calls, 1);
        assert_eq!(sensor.last_probability_time_us(), 0);

        // Within the wait interval: the machine declines to query at all.
        let wait = SensorConfig::default().query_wait_interval_us();
        sensor
            .query_packet_cache(first_now + wait / 2, &mut cache)
            .unwrap();
        assert_eq!(cache.calls, 1);

        // Past the interval: the second scripted failure is consumed.
        let second_now = first_now + wait;
        assert!(sensor.query_packet_cache(second_now, &mut cache).is_err());
        sensor.reset_to_query();
        assert_eq!(cache.calls, 2);
        assert_eq!(sensor.last_probability_time_us(), 0);
        assert_eq!(sensor.state(), State::Query);

        // Once the backend recovers the sensor proceeds normally.
        let third_now = second_now + wait;
        sensor.query_packet_cache(third_now, &mut cache).unwrap();
        assert_eq!(sensor.state(), State::Inference);
    }

    #[test]
    fn surviving_phase_still_publishes_when_the_other_times_out() {
        // S7: P times out, S succeeds; the stream advances and S publishes.
        let mut sensor = sensor();
        let mut cache = continuous_cache(WINDOW_US);
        let mut p = ScriptedDetector::failing();
        let mut s = ScriptedDetector::constant(0.9);
        let mut sink = CollectingSink::default();
        sensor.query_packet_cache(WINDOW_US, &mut cache).unwrap();
        sensor
            .run_inference(Some(&mut p), Some(&mut s))
            .unwrap();
        sensor.publish(&mut sink).unwrap();

        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].positive_class, "S");
        assert_eq!(sink.packets[0].channel, "HHS");
        assert_eq!(sink.packets[0].start_time_us, 2_540_000);
        assert_eq!(sensor.last_probability_time_us(), 7_540_000);
        assert_eq!(sensor.state(), State::Query);
    }

    #[test]
    fn consecutive_packets_never_overlap() {
        // Invariant 1/2: packet k+1 starts at or after packet k ends.
        let mut sensor = sensor();
        let mut p = ScriptedDetector::constant(0.5);
        let mut s = ScriptedDetector::constant(0.5);
        let mut sink = CollectingSink::default();

        let mut cache = continuous_cache(WINDOW_US);
        drive_cycle(&mut sensor, WINDOW_US, &mut cache, &mut p, &mut s, &mut sink);

        let mut cache = continuous_cache(2 * WINDOW_US);
        drive_cycle(
            &mut sensor,
            2 * WINDOW_US,
            &mut cache,
            &mut p,
            &mut s,
            &mut sink,
        );

        let p_packets: Vec<_> = sink
            .packets
            .iter()
            .filter(|packet| packet.positive_class == "P")
            .collect();
        assert_eq!(p_packets.len(), 2);
        let first_end = p_packets[0].end_time_us() + DT; // one spacing past the last sample
        assert!(p_packets[1].start_time_us >= p_packets[0].end_time_us());
        assert_eq!(p_packets[1].start_time_us, first_end);
    }

    #[test]
    fn publish_failure_does_not_roll_the_stream_back() {
        let mut sensor = sensor();
        let mut cache = continuous_cache(WINDOW_US);
        let mut p = ScriptedDetector::constant(0.5);
        let mut s = ScriptedDetector::constant(0.5);
        let mut sink = CollectingSink {
            fail: true,
            ..Default::default()
        };
        sensor.query_packet_cache(WINDOW_US, &mut cache).unwrap();
        sensor
            .run_inference(Some(&mut p), Some(&mut s))
            .unwrap();
        let result = sensor.publish(&mut sink);
        assert!(result.is_err());
        assert_eq!(sensor.last_probability_time_us(), 7_540_000);
        assert_eq!(sensor.state(), State::Query);
    }

    #[test]
    fn mismatched_trace_lengths_fail_the_step() {
        struct ShortDetector;
        impl DetectorService for ShortDetector {
            fn properties(&self) -> DetectorProperties {
                DetectorProperties::default()
            }
            fn process(
                &mut self,
                request: &ProcessingRequest,
            ) -> crate::Result<ProcessingResponse> {
                Ok(ProcessingResponse {
                    identifier: request.identifier,
                    return_code: InferenceReturnCode::Success,
                    sampling_rate: 100.0,
                    probability_signal: Some(vec![0.5; request.signals[0].len() - 7]),
                })
            }
        }
        let mut sensor = sensor();
        let mut cache = continuous_cache(WINDOW_US);
        sensor.query_packet_cache(WINDOW_US, &mut cache).unwrap();
        let mut p = ScriptedDetector::constant(0.5);
        let mut short = ShortDetector;
        let before = sensor.last_probability_time_us();
        let result = sensor.run_inference(Some(&mut p), Some(&mut short));
        assert!(result.is_err());
        assert_eq!(sensor.state(), State::Query);
        assert_eq!(sensor.last_probability_time_us(), before);
    }

    #[test]
    fn one_component_sensor_runs_the_same_loop() {
        let count = (WINDOW_US / DT) as usize + 1;
        let mut cache =
            ScriptedCache::new().with_channel("EHZ", vec![packet("EHZ", 0, count)]);
        let mut sensor =
            OneComponentSensor::new(descriptor("EHZ"), SensorConfig::default(), 0).unwrap();
        let mut detector = ScriptedDetector::constant(0.3);
        let mut sink = CollectingSink::default();
        sensor.query_packet_cache(WINDOW_US, &mut cache).unwrap();
        assert_eq!(sensor.state(), State::Inference);
        sensor.run_inference(&mut detector).unwrap();
        sensor.publish(&mut sink).unwrap();

        assert_eq!(sink.packets.len(), 1);
        let emitted = &sink.packets[0];
        assert_eq!(emitted.channel, "EHP");
        assert_eq!(emitted.algorithm, "UNetOneComponentP");
        assert_eq!(emitted.original_channels, vec!["EHZ"]);
        assert_eq!(emitted.start_time_us, 2_540_000);
        assert_eq!(emitted.data.len(), 500);
        assert_eq!(sensor.last_probability_time_us(), 7_540_000);
    }

    #[test]
    fn one_component_inference_failure_keeps_the_stream_position() {
        let count = (WINDOW_US / DT) as usize + 1;
        let mut cache =
            ScriptedCache::new().with_channel("EHZ", vec![packet("EHZ", 0, count)]);
        let mut sensor =
            OneComponentSensor::new(descriptor("EHZ"), SensorConfig::default(), 0).unwrap();
        sensor.query_packet_cache(WINDOW_US, &mut cache).unwrap();
        let mut detector = ScriptedDetector::failing();
        let result = sensor.run_inference(&mut detector);
        assert!(result.is_err());
        assert_eq!(sensor.state(), State::Query);
        assert_eq!(sensor.last_probability_time_us(), 0);
    }

    #[test]
    fn slice_indices_cover_the_documented_cases() {
        let config = SensorConfig::default();
        // Cold start over [0, window]: the untrusted prefix is skipped.
        let (i0, i1) = probability_slice_indices(&config, 0, WINDOW_US, 0, 1009);
        assert_eq!((i0, i1), (254, 754));
        // Steady state: continue from the last emitted sample.
        let (i0, i1) =
            probability_slice_indices(&config, 4_500_000, 2 * WINDOW_US, 7_540_000, 1567);
        assert_eq!(i0, 304);
        assert_eq!(i1, 1312);
        // Degenerate: nothing new to say.
        let (i0, i1) = probability_slice_indices(&config, 0, WINDOW_US, WINDOW_US, 1009);
        assert_eq!(i0, i1);
    }
}
