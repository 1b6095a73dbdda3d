//! # inference
//!
//! Client for the remote ML detector services and the declared contract of
//! the shipped U-Net models: a fixed 10.08 s input window at 100 Hz whose
//! output is trusted only inside the [254, 754] center window. The sensor
//! state machine is responsible for presenting correctly sized inputs and
//! slicing correctly sized outputs; this client only moves signals.

use seis_types::messages::{
    InferenceReturnCode, ProcessingRequest, ProcessingResponse,
};
use seis_types::MICROSECONDS_PER_SECOND;

use crate::error::{Error, Result};
use crate::transport::{RequestSocket, SocketOptions};

// ── Detector contract ─────────────────────────────────────────────────────────

/// The input/output contract a detector service declares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorProperties {
    /// Fixed input window length in samples (1008 = 10.08 s at 100 Hz)
    pub input_samples: usize,
    /// Expected input sampling rate in Hz
    pub sampling_rate: f64,
    /// Output probability-trace sampling rate in Hz
    pub output_sampling_rate: f64,
    /// First trusted output sample of a window
    pub center_window_start: usize,
    /// One past the last trusted output sample of a window
    pub center_window_end: usize,
}

impl Default for DetectorProperties {
    fn default() -> Self {
        Self {
            input_samples: 1008,
            sampling_rate: 100.0,
            output_sampling_rate: 100.0,
            center_window_start: 254,
            center_window_end: 754,
        }
    }
}

impl DetectorProperties {
    /// Duration of the fixed input window in microseconds.
    pub fn window_duration_us(&self) -> i64 {
        (self.input_samples as f64 / self.sampling_rate * MICROSECONDS_PER_SECOND).round() as i64
    }

    /// Time from a window's start to its first trusted output sample.
    pub fn start_window_time_us(&self) -> i64 {
        (self.center_window_start as f64 / self.output_sampling_rate * MICROSECONDS_PER_SECOND)
            .round() as i64
    }

    /// Time from a window's start to the end of its trusted region.
    pub fn end_window_time_us(&self) -> i64 {
        (self.center_window_end as f64 / self.output_sampling_rate * MICROSECONDS_PER_SECOND)
            .round() as i64
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// The detector operations the pipeline depends on. Implemented by
/// [`DetectorClient`] over the wire and by in-process fakes in tests.
pub trait DetectorService: Send {
    fn properties(&self) -> DetectorProperties;
    fn process(&mut self, request: &ProcessingRequest) -> Result<ProcessingResponse>;
}

pub struct DetectorClient {
    socket: RequestSocket,
    properties: DetectorProperties,
    /// Algorithm tag stamped on packets built from this detector's output
    pub algorithm: String,
}

impl DetectorClient {
    pub fn new(options: SocketOptions, properties: DetectorProperties, algorithm: &str) -> Self {
        Self {
            socket: RequestSocket::new(options),
            properties,
            algorithm: algorithm.to_string(),
        }
    }
}

impl DetectorService for DetectorClient {
    fn properties(&self) -> DetectorProperties {
        self.properties
    }

    fn process(&mut self, request: &ProcessingRequest) -> Result<ProcessingResponse> {
        request.validate()?;
        let response: ProcessingResponse = self.socket.request(request)?;
        match response.return_code {
            InferenceReturnCode::Success => {}
            InferenceReturnCode::InvalidRequest => {
                return Err(Error::Backend {
                    code: u8::from(InferenceReturnCode::InvalidRequest) as i32,
                    context: format!("{} rejected the request as invalid", self.algorithm),
                })
            }
            InferenceReturnCode::AlgorithmicFailure => {
                return Err(Error::Algorithmic(format!(
                    "{} reported an internal failure",
                    self.algorithm
                )))
            }
        }
        if response.probability_signal.is_none() {
            return Err(Error::Algorithmic(format!(
                "{} returned success without a probability signal",
                self.algorithm
            )));
        }
        Ok(response)
    }
}
