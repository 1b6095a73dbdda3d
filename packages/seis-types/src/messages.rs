//! # messages
//!
//! Request/reply payloads for the scalable services: the waveform packet
//! cache, the ML detectors, the location service, and the identifier
//! incrementer, plus the generic transport-level failure reply.

use serde::{Deserialize, Serialize};

use crate::frame::{Message, WireError};
use crate::origin::Phase;
use crate::packet::Packet;

// ── Failure envelope ──────────────────────────────────────────────────────────

/// Generic failure reply a service may substitute for its normal response.
/// The transport converts it into a local error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub details: String,
}

impl Message for Failure {
    const MESSAGE_TYPE: &'static str = "Seismon::Failure";
}

// ── Packet cache ──────────────────────────────────────────────────────────────

/// Return codes shared by single and bulk cache responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CacheReturnCode {
    #[default]
    Success,
    /// The requested (net, sta, cha, loc) is not in the cache. Not an error
    /// from the pipeline's point of view; the reply simply has no packets.
    NoSensor,
    InvalidMessageType,
    InvalidMessage,
    InvalidTimeQuery,
    AlgorithmicFailure,
}

impl From<CacheReturnCode> for u8 {
    fn from(code: CacheReturnCode) -> u8 {
        match code {
            CacheReturnCode::Success => 0,
            CacheReturnCode::NoSensor => 1,
            CacheReturnCode::InvalidMessageType => 2,
            CacheReturnCode::InvalidMessage => 3,
            CacheReturnCode::InvalidTimeQuery => 4,
            CacheReturnCode::AlgorithmicFailure => 5,
        }
    }
}

impl TryFrom<u8> for CacheReturnCode {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(CacheReturnCode::Success),
            1 => Ok(CacheReturnCode::NoSensor),
            2 => Ok(CacheReturnCode::InvalidMessageType),
            3 => Ok(CacheReturnCode::InvalidMessage),
            4 => Ok(CacheReturnCode::InvalidTimeQuery),
            5 => Ok(CacheReturnCode::AlgorithmicFailure),
            other => Err(format!("unknown cache return code {other}")),
        }
    }
}

/// A single-channel half-open time range query, [start, end) in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Caller-chosen identifier echoed on the response; bulk replies are
    /// demultiplexed by it.
    pub identifier: i64,
    pub network: String,
    pub station: String,
    pub channel: String,
    pub location_code: String,
    pub start_time_s: f64,
    pub end_time_s: f64,
}

impl Message for DataRequest {
    const MESSAGE_TYPE: &'static str = "Seismon::PacketCache::DataRequest";
}

impl DataRequest {
    pub fn set_query_times(&mut self, start_time_s: f64, end_time_s: f64) {
        self.start_time_s = start_time_s;
        self.end_time_s = end_time_s;
    }

    pub fn name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.channel, self.location_code
        )
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.network.is_empty()
            || self.station.is_empty()
            || self.channel.is_empty()
            || self.location_code.is_empty()
        {
            return Err(WireError::Invalid("incomplete data request identity".to_string()));
        }
        if !(self.start_time_s < self.end_time_s) {
            return Err(WireError::Invalid(format!(
                "data request start {} is not before end {}",
                self.start_time_s, self.end_time_s
            )));
        }
        Ok(())
    }
}

/// The cache's answer to one [`DataRequest`]: packets ordered by start time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    pub identifier: i64,
    pub return_code: CacheReturnCode,
    #[serde(default)]
    pub packets: Vec<Packet>,
}

impl Message for DataResponse {
    const MESSAGE_TYPE: &'static str = "Seismon::PacketCache::DataResponse";
}

/// Several single-channel queries bundled into one round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkDataRequest {
    pub identifier: i64,
    pub requests: Vec<DataRequest>,
}

impl Message for BulkDataRequest {
    const MESSAGE_TYPE: &'static str = "Seismon::PacketCache::BulkDataRequest";
}

impl BulkDataRequest {
    pub fn validate(&self) -> Result<(), WireError> {
        if self.requests.is_empty() {
            return Err(WireError::Invalid("bulk request has no requests".to_string()));
        }
        for request in &self.requests {
            request.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkDataResponse {
    pub identifier: i64,
    pub return_code: CacheReturnCode,
    #[serde(default)]
    pub responses: Vec<DataResponse>,
}

impl Message for BulkDataResponse {
    const MESSAGE_TYPE: &'static str = "Seismon::PacketCache::BulkDataResponse";
}

impl BulkDataResponse {
    /// Finds the per-channel response answering the given request identifier.
    pub fn response_for(&self, identifier: i64) -> Option<&DataResponse> {
        self.responses.iter().find(|r| r.identifier == identifier)
    }
}

// ── Detector inference ────────────────────────────────────────────────────────

/// How a detector strides its fixed window over the input signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum InferenceStrategy {
    /// Stride the fixed window so the output trace is time-aligned with the
    /// full input.
    #[default]
    SlidingWindow,
    /// Evaluate exactly one window; the input must be exactly window-sized.
    SingleWindow,
}

impl From<InferenceStrategy> for u8 {
    fn from(strategy: InferenceStrategy) -> u8 {
        match strategy {
            InferenceStrategy::SlidingWindow => 0,
            InferenceStrategy::SingleWindow => 1,
        }
    }
}

impl TryFrom<u8> for InferenceStrategy {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(InferenceStrategy::SlidingWindow),
            1 => Ok(InferenceStrategy::SingleWindow),
            other => Err(format!("unknown inference strategy tag {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum InferenceReturnCode {
    #[default]
    Success,
    InvalidRequest,
    AlgorithmicFailure,
}

impl From<InferenceReturnCode> for u8 {
    fn from(code: InferenceReturnCode) -> u8 {
        match code {
            InferenceReturnCode::Success => 0,
            InferenceReturnCode::InvalidRequest => 1,
            InferenceReturnCode::AlgorithmicFailure => 2,
        }
    }
}

impl TryFrom<u8> for InferenceReturnCode {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(InferenceReturnCode::Success),
            1 => Ok(InferenceReturnCode::InvalidRequest),
            2 => Ok(InferenceReturnCode::AlgorithmicFailure),
            other => Err(format!("unknown inference return code {other}")),
        }
    }
}

/// One-component or three-component inference request. Three-component
/// requests carry the signals in (vertical, north, east) order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRequest {
    pub identifier: i64,
    /// Sampling rate of the input signals in Hz
    pub sampling_rate: f64,
    pub strategy: InferenceStrategy,
    /// One signal (1C) or three equal-length signals (3C)
    pub signals: Vec<Vec<f64>>,
}

impl Message for ProcessingRequest {
    const MESSAGE_TYPE: &'static str = "Seismon::Detectors::ProcessingRequest";
}

impl ProcessingRequest {
    pub fn validate(&self) -> Result<(), WireError> {
        if !(self.sampling_rate > 0.0) {
            return Err(WireError::Invalid(format!(
                "sampling rate {} is not positive",
                self.sampling_rate
            )));
        }
        match self.signals.len() {
            1 | 3 => {}
            n => {
                return Err(WireError::Invalid(format!(
                    "expected 1 or 3 signals, got {n}"
                )))
            }
        }
        let len = self.signals[0].len();
        if len == 0 {
            return Err(WireError::Invalid("empty signal".to_string()));
        }
        if self.signals.iter().any(|s| s.len() != len) {
            return Err(WireError::Invalid("signal lengths differ".to_string()));
        }
        Ok(())
    }
}

/// The detector's probability trace for a [`ProcessingRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResponse {
    pub identifier: i64,
    pub return_code: InferenceReturnCode,
    /// Output sampling rate in Hz (typically 100)
    pub sampling_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability_signal: Option<Vec<f64>>,
}

impl Message for ProcessingResponse {
    const MESSAGE_TYPE: &'static str = "Seismon::Detectors::ProcessingResponse";
}

// ── Location service ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LocationStrategy {
    /// Full (global + refined) optimization in free depth.
    #[default]
    General,
    /// Depth fixed to the free surface; used for quarry-blast candidates.
    FreeSurface,
}

impl From<LocationStrategy> for u8 {
    fn from(strategy: LocationStrategy) -> u8 {
        match strategy {
            LocationStrategy::General => 0,
            LocationStrategy::FreeSurface => 1,
        }
    }
}

impl TryFrom<u8> for LocationStrategy {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(LocationStrategy::General),
            1 => Ok(LocationStrategy::FreeSurface),
            other => Err(format!("unknown location strategy tag {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LocationReturnCode {
    #[default]
    Success,
    InvalidRequest,
    AlgorithmicFailure,
}

impl From<LocationReturnCode> for u8 {
    fn from(code: LocationReturnCode) -> u8 {
        match code {
            LocationReturnCode::Success => 0,
            LocationReturnCode::InvalidRequest => 1,
            LocationReturnCode::AlgorithmicFailure => 2,
        }
    }
}

impl TryFrom<u8> for LocationReturnCode {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(LocationReturnCode::Success),
            1 => Ok(LocationReturnCode::InvalidRequest),
            2 => Ok(LocationReturnCode::AlgorithmicFailure),
            other => Err(format!("unknown location return code {other}")),
        }
    }
}

/// The location service's arrival schema: leaner than the broadcast
/// [`Arrival`](crate::origin::Arrival), just what the optimizer needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationArrival {
    pub network: String,
    pub station: String,
    pub time_us: i64,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_error_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<i64>,
    /// Modeled travel time in seconds; present on response arrivals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel_time_s: Option<f64>,
}

/// A request to relocate one event from its arrivals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationRequest {
    pub identifier: i64,
    pub location_strategy: LocationStrategy,
    pub arrivals: Vec<LocationArrival>,
}

impl Message for LocationRequest {
    const MESSAGE_TYPE: &'static str = "Seismon::Locator::LocationRequest";
}

impl LocationRequest {
    /// Checks the arrival set makes sense: non-empty, no station carries a
    /// duplicate phase, and no station's S precedes its P.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.arrivals.is_empty() {
            return Err(WireError::Invalid("no arrivals".to_string()));
        }
        for arrival in &self.arrivals {
            if arrival.network.is_empty() || arrival.station.is_empty() {
                return Err(WireError::Invalid("incomplete arrival identity".to_string()));
            }
        }
        let n = self.arrivals.len();
        for i in 0..n {
            for j in (i + 1)..n {
                let a = &self.arrivals[i];
                let b = &self.arrivals[j];
                if a.network != b.network || a.station != b.station {
                    continue;
                }
                if a.phase == b.phase {
                    return Err(WireError::Invalid(format!(
                        "duplicate {} arrival for {}.{}",
                        a.phase, a.network, a.station
                    )));
                }
                let (p, s) = if a.phase == Phase::P { (a, b) } else { (b, a) };
                if s.time_us <= p.time_us {
                    return Err(WireError::Invalid(format!(
                        "S precedes P arrival for {}.{}",
                        a.network, a.station
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The refined hypocenter inside a successful [`LocationResponse`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationOrigin {
    pub latitude: f64,
    pub longitude: f64,
    /// Depth below the free surface in meters
    pub depth_m: f64,
    pub time_us: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<i64>,
    /// True when the optimizer pinned the depth to the free surface
    #[serde(default)]
    pub depth_fixed_to_free_surface: bool,
    #[serde(default)]
    pub arrivals: Vec<LocationArrival>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationResponse {
    pub identifier: i64,
    pub return_code: LocationReturnCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<LocationOrigin>,
}

impl Message for LocationResponse {
    const MESSAGE_TYPE: &'static str = "Seismon::Locator::LocationResponse";
}

// ── Identifier incrementer ────────────────────────────────────────────────────

/// Which monotone counter to bump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum IncrementItem {
    #[default]
    Origin,
    PhaseArrival,
    PhasePick,
    Event,
}

impl From<IncrementItem> for u8 {
    fn from(item: IncrementItem) -> u8 {
        match item {
            IncrementItem::Origin => 0,
            IncrementItem::PhaseArrival => 1,
            IncrementItem::PhasePick => 2,
            IncrementItem::Event => 3,
        }
    }
}

impl TryFrom<u8> for IncrementItem {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(IncrementItem::Origin),
            1 => Ok(IncrementItem::PhaseArrival),
            2 => Ok(IncrementItem::PhasePick),
            3 => Ok(IncrementItem::Event),
            other => Err(format!("unknown increment item tag {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum IncrementReturnCode {
    #[default]
    Success,
    InvalidItem,
    AlgorithmicFailure,
}

impl From<IncrementReturnCode> for u8 {
    fn from(code: IncrementReturnCode) -> u8 {
        match code {
            IncrementReturnCode::Success => 0,
            IncrementReturnCode::InvalidItem => 1,
            IncrementReturnCode::AlgorithmicFailure => 2,
        }
    }
}

impl TryFrom<u8> for IncrementReturnCode {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(IncrementReturnCode::Success),
            1 => Ok(IncrementReturnCode::InvalidItem),
            2 => Ok(IncrementReturnCode::AlgorithmicFailure),
            other => Err(format!("unknown increment return code {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncrementRequest {
    pub identifier: i64,
    pub item: IncrementItem,
}

impl Message for IncrementRequest {
    const MESSAGE_TYPE: &'static str = "Seismon::Incrementer::IncrementRequest";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncrementResponse {
    pub identifier: i64,
    pub return_code: IncrementReturnCode,
    /// The freshly allocated value
    pub value: i64,
}

impl Message for IncrementResponse {
    const MESSAGE_TYPE: &'static str = "Seismon::Incrementer::IncrementResponse";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::seconds_to_micros;

    fn location_arrival(
        network: &str,
        station: &str,
        phase: Phase,
        time_s: f64,
        identifier: i64,
    ) -> LocationArrival {
        LocationArrival {
            network: network.to_string(),
            station: station.to_string(),
            time_us: seconds_to_micros(time_s),
            phase,
            standard_error_s: Some(if phase == Phase::P { 0.05 } else { 0.1 }),
            identifier: Some(identifier),
            travel_time_s: None,
        }
    }

    /// The twelve-arrival UU event used to exercise the locator end to end.
    pub(crate) fn utah_event_request() -> LocationRequest {
        LocationRequest {
            identifier: 1,
            location_strategy: LocationStrategy::General,
            arrivals: vec![
                location_arrival("UU", "WPUT", Phase::P, 1729851505.246174, 1),
                location_arrival("UU", "CVRU", Phase::P, 1729851508.773843, 2),
                location_arrival("UU", "OWUT", Phase::P, 1729851509.607865, 3),
                location_arrival("UU", "SGU", Phase::P, 1729851509.895722, 4),
                location_arrival("UU", "TMU", Phase::P, 1729851511.046742, 5),
                location_arrival("UU", "CVRU", Phase::S, 1729851512.289533, 6),
                location_arrival("UU", "SRU", Phase::P, 1729851517.556067, 7),
                location_arrival("UU", "LIUT", Phase::P, 1729851522.321738, 8),
                location_arrival("UU", "BCE", Phase::P, 1729851522.847059, 9),
                location_arrival("UU", "ROA", Phase::P, 1729851523.973603, 10),
                location_arrival("UU", "BRPU", Phase::S, 1729851526.899263, 11),
                location_arrival("UU", "SRU", Phase::S, 1729851527.116703, 12),
            ],
        }
    }

    #[test]
    fn utah_request_is_valid() {
        assert!(utah_event_request().validate().is_ok());
    }

    #[test]
    fn location_request_cbor_round_trip_is_byte_equal() {
        let request = utah_event_request();
        let first = frame::encode(&request).unwrap();
        let envelope = frame::read_frame(&mut std::io::Cursor::new(first.clone())).unwrap();
        let decoded: LocationRequest = envelope.unpack().unwrap();
        assert_eq!(decoded, request);
        let second = frame::encode(&decoded).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn location_response_cbor_round_trip_is_byte_equal() {
        let response = LocationResponse {
            identifier: 1,
            return_code: LocationReturnCode::Success,
            origin: Some(LocationOrigin {
                latitude: 39.027048,
                longitude: -111.401232,
                depth_m: 1146.080597,
                time_us: seconds_to_micros(1729851504.634941),
                identifier: Some(80085261),
                depth_fixed_to_free_surface: false,
                arrivals: utah_event_request()
                    .arrivals
                    .into_iter()
                    .map(|mut a| {
                        a.travel_time_s = Some(2.0);
                        a
                    })
                    .collect(),
            }),
        };
        let first = frame::encode(&response).unwrap();
        let envelope = frame::read_frame(&mut std::io::Cursor::new(first.clone())).unwrap();
        let decoded: LocationResponse = envelope.unpack().unwrap();
        assert_eq!(decoded, response);
        assert_eq!(frame::encode(&decoded).unwrap(), first);
    }

    #[test]
    fn duplicate_phase_is_rejected() {
        let mut request = utah_event_request();
        let mut duplicate = request.arrivals[0].clone();
        duplicate.time_us += 1_000_000;
        request.arrivals.push(duplicate);
        assert!(request.validate().is_err());
    }

    #[test]
    fn s_before_p_is_rejected() {
        let mut request = utah_event_request();
        // Give CVRU an S arrival earlier than its P.
        let p_time = request.arrivals[1].time_us;
        let s = request
            .arrivals
            .iter_mut()
            .find(|a| a.station == "CVRU" && a.phase == Phase::S)
            .unwrap();
        s.time_us = p_time - 1;
        assert!(request.validate().is_err());
    }

    #[test]
    fn empty_request_is_rejected() {
        let request = LocationRequest::default();
        assert!(request.validate().is_err());
    }

    #[test]
    fn bulk_response_demultiplexes_by_identifier() {
        let response = BulkDataResponse {
            identifier: 42,
            return_code: CacheReturnCode::Success,
            responses: vec![
                DataResponse {
                    identifier: 2,
                    return_code: CacheReturnCode::Success,
                    packets: vec![],
                },
                DataResponse {
                    identifier: 0,
                    return_code: CacheReturnCode::Success,
                    packets: vec![],
                },
            ],
        };
        assert_eq!(response.response_for(0).unwrap().identifier, 0);
        assert!(response.response_for(1).is_none());
    }

    #[test]
    fn bulk_request_round_trip() {
        let request = BulkDataRequest {
            identifier: 7,
            requests: vec![DataRequest {
                identifier: 0,
                network: "UU".to_string(),
                station: "CVRU".to_string(),
                channel: "HHZ".to_string(),
                location_code: "01".to_string(),
                start_time_s: 1000.0,
                end_time_s: 1010.0,
            }],
        };
        assert!(request.validate().is_ok());
        let bytes = frame::encode(&request).unwrap();
        let envelope = frame::read_frame(&mut std::io::Cursor::new(bytes.clone())).unwrap();
        let decoded: BulkDataRequest = envelope.unpack().unwrap();
        assert_eq!(decoded, request);
        assert_eq!(frame::encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn processing_request_validates_signal_shape() {
        let mut request = ProcessingRequest {
            identifier: 1,
            sampling_rate: 100.0,
            strategy: InferenceStrategy::SlidingWindow,
            signals: vec![vec![0.0; 1008], vec![0.0; 1008], vec![0.0; 1008]],
        };
        assert!(request.validate().is_ok());
        request.signals[1].pop();
        assert!(request.validate().is_err());
        request.signals = vec![vec![0.0; 16], vec![0.0; 16]];
        assert!(request.validate().is_err());
    }

    #[test]
    fn inverted_time_query_is_rejected() {
        let mut request = DataRequest {
            identifier: 0,
            network: "UU".to_string(),
            station: "SGU".to_string(),
            channel: "HHZ".to_string(),
            location_code: "01".to_string(),
            start_time_s: 10.0,
            end_time_s: 10.0,
        };
        assert!(request.validate().is_err());
        request.end_time_s = 11.0;
        assert!(request.validate().is_ok());
    }

    #[test]
    fn increment_round_trip() {
        let request = IncrementRequest {
            identifier: 5,
            item: IncrementItem::PhaseArrival,
        };
        let bytes = frame::encode(&request).unwrap();
        let envelope = frame::read_frame(&mut std::io::Cursor::new(bytes)).unwrap();
        let decoded: IncrementRequest = envelope.unpack().unwrap();
        assert_eq!(decoded, request);
    }
}
