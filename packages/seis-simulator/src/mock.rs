//! # mock
//!
//! In-process stand-ins for every remote collaborator of the backend: the
//! packet cache, the detector services, the location service, the
//! identifier incrementer, a broadcast feed, and a capture bus. Each one is
//! a real TCP listener speaking the production framing, so the clients
//! under test exercise their full wire path.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use seis_types::frame::{self, Envelope};
use seis_types::messages::{
    BulkDataRequest, BulkDataResponse, CacheReturnCode, DataRequest, DataResponse, Failure,
    IncrementRequest, IncrementResponse, IncrementReturnCode, InferenceReturnCode,
    LocationOrigin, LocationRequest, LocationResponse, LocationReturnCode, ProcessingRequest,
    ProcessingResponse,
};
use seis_types::{micros_to_seconds, seconds_to_micros, Message, Origin, Packet, WireError};

// ── Service plumbing ──────────────────────────────────────────────────────────

/// A running mock service; dropping it stops the listener and its
/// connection threads.
pub struct ServiceHandle {
    pub address: String,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

type Handler = dyn FnMut(Envelope) -> Option<Vec<u8>> + Send;

/// Binds an ephemeral localhost port and answers each inbound frame with
/// whatever the handler returns. Every accepted connection gets its own
/// thread; the handler is shared behind a mutex.
fn serve(name: &'static str, handler: Box<Handler>) -> ServiceHandle {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock service");
    let address = listener.local_addr().expect("local addr").to_string();
    listener
        .set_nonblocking(true)
        .expect("nonblocking listener");
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler = Arc::new(Mutex::new(handler));
    let accept_shutdown = shutdown.clone();
    let accept_thread = std::thread::Builder::new()
        .name(format!("mock-{name}-accept"))
        .spawn(move || {
            let mut connections: Vec<JoinHandle<()>> = Vec::new();
            while !accept_shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!(service = name, %peer, "mock service accepted connection");
                        let handler = handler.clone();
                        let shutdown = accept_shutdown.clone();
                        let handle = std::thread::Builder::new()
                            .name(format!("mock-{name}-conn"))
                            .spawn(move || connection_loop(stream, handler, shutdown))
                            .expect("spawn connection thread");
                        connections.push(handle);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(e) => {
                        warn!(service = name, "mock accept failed: {e}");
                        break;
                    }
                }
            }
            for handle in connections {
                let _ = handle.join();
            }
        })
        .expect("spawn accept thread");
    ServiceHandle {
        address,
        shutdown,
        accept_thread: Some(accept_thread),
    }
}

fn connection_loop(
    mut stream: TcpStream,
    handler: Arc<Mutex<Box<Handler>>>,
    shutdown: Arc<AtomicBool>,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .expect("read timeout");
    while !shutdown.load(Ordering::SeqCst) {
        match frame::read_frame(&mut stream) {
            Ok(envelope) => {
                let reply = {
                    let mut handler = handler.lock().expect("handler mutex");
                    (*handler)(envelope)
                };
                if let Some(bytes) = reply {
                    if frame::write_frame(&mut stream, &bytes).is_err() {
                        break;
                    }
                }
            }
            Err(WireError::Io(e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => break,
        }
    }
}

fn failure_frame(details: &str) -> Vec<u8> {
    frame::encode(&Failure {
        details: details.to_string(),
    })
    .expect("encode failure")
}

// ── Packet cache ──────────────────────────────────────────────────────────────

/// Packets keyed by "NET.STA.CHA.LOC", shared with the producer side.
#[derive(Clone, Default)]
pub struct PacketStore {
    inner: Arc<Mutex<HashMap<String, Vec<Packet>>>>,
}

impl PacketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: Packet) {
        self.inner
            .lock()
            .expect("packet store mutex")
            .entry(packet.name())
            .or_default()
            .push(packet);
    }

    pub fn extend(&self, packets: impl IntoIterator<Item = Packet>) {
        for packet in packets {
            self.push(packet);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().expect("packet store mutex").len()
    }

    fn query(&self, request: &DataRequest) -> DataResponse {
        let start_us = seconds_to_micros(request.start_time_s);
        let end_us = seconds_to_micros(request.end_time_s);
        let store = self.inner.lock().expect("packet store mutex");
        match store.get(&request.name()) {
            None => DataResponse {
                identifier: request.identifier,
                return_code: CacheReturnCode::NoSensor,
                packets: Vec::new(),
            },
            Some(packets) => {
                let mut hits: Vec<Packet> = packets
                    .iter()
                    .filter(|p| p.end_time_us() >= start_us && p.start_time_us < end_us)
                    .cloned()
                    .collect();
                hits.sort_by_key(|p| p.start_time_us);
                DataResponse {
                    identifier: request.identifier,
                    return_code: CacheReturnCode::Success,
                    packets: hits,
                }
            }
        }
    }
}

/// Serves [`PacketStore`] contents over the cache request/reply contract.
pub fn spawn_packet_cache(store: PacketStore) -> ServiceHandle {
    serve(
        "packet-cache",
        Box::new(move |envelope| {
            if envelope.is::<DataRequest>() {
                let request: DataRequest = match envelope.unpack() {
                    Ok(request) => request,
                    Err(e) => return Some(failure_frame(&e.to_string())),
                };
                let response = store.query(&request);
                Some(frame::encode(&response).expect("encode data response"))
            } else if envelope.is::<BulkDataRequest>() {
                let request: BulkDataRequest = match envelope.unpack() {
                    Ok(request) => request,
                    Err(e) => return Some(failure_frame(&e.to_string())),
                };
                let response = BulkDataResponse {
                    identifier: request.identifier,
                    return_code: CacheReturnCode::Success,
                    responses: request.requests.iter().map(|r| store.query(r)).collect(),
                };
                Some(frame::encode(&response).expect("encode bulk response"))
            } else {
                Some(failure_frame(&format!(
                    "unsupported message type {}",
                    envelope.message_type
                )))
            }
        }),
    )
}

// ── Detector service ──────────────────────────────────────────────────────────

/// How the mock detector answers.
#[derive(Debug, Clone, Copy)]
pub enum DetectorBehavior {
    /// A flat trace of the given probability, same length as the input.
    Constant(f64),
    /// Reply with a transport-level failure envelope.
    Broken,
    /// Accept the request, then never answer (clients should time out).
    Silent,
}

pub fn spawn_detector(behavior: DetectorBehavior) -> ServiceHandle {
    serve(
        "detector",
        Box::new(move |envelope| {
            let request: ProcessingRequest = match envelope.unpack() {
                Ok(request) => request,
                Err(e) => return Some(failure_frame(&e.to_string())),
            };
            match behavior {
                DetectorBehavior::Silent => None,
                DetectorBehavior::Broken => Some(failure_frame("model worker crashed")),
                DetectorBehavior::Constant(fill) => {
                    if request.validate().is_err() {
                        let response = ProcessingResponse {
                            identifier: request.identifier,
                            return_code: InferenceReturnCode::InvalidRequest,
                            sampling_rate: 100.0,
                            probability_signal: None,
                        };
                        return Some(frame::encode(&response).expect("encode response"));
                    }
                    let response = ProcessingResponse {
                        identifier: request.identifier,
                        return_code: InferenceReturnCode::Success,
                        sampling_rate: 100.0,
                        probability_signal: Some(vec![fill; request.signals[0].len()]),
                    };
                    Some(frame::encode(&response).expect("encode response"))
                }
            }
        }),
    )
}

// ── Location service ──────────────────────────────────────────────────────────

/// Answers every location request with the given hypocenter, echoing the
/// request arrivals back with travel times consistent with a common
/// `residual_s` for every station.
pub struct LocatorBehavior {
    pub latitude: f64,
    pub longitude: f64,
    pub depth_m: f64,
    pub time_us: i64,
    pub residual_s: f64,
    pub fail: bool,
}

pub fn spawn_locator(behavior: LocatorBehavior) -> ServiceHandle {
    serve(
        "locator",
        Box::new(move |envelope| {
            let request: LocationRequest = match envelope.unpack() {
                Ok(request) => request,
                Err(e) => return Some(failure_frame(&e.to_string())),
            };
            if behavior.fail {
                let response = LocationResponse {
                    identifier: request.identifier,
                    return_code: LocationReturnCode::AlgorithmicFailure,
                    origin: None,
                };
                return Some(frame::encode(&response).expect("encode response"));
            }
            let origin_time_s = micros_to_seconds(behavior.time_us);
            let arrivals = request
                .arrivals
                .iter()
                .map(|a| {
                    let mut echoed = a.clone();
                    echoed.travel_time_s =
                        Some(micros_to_seconds(a.time_us) - origin_time_s - behavior.residual_s);
                    echoed
                })
                .collect();
            let response = LocationResponse {
                identifier: request.identifier,
                return_code: LocationReturnCode::Success,
                origin: Some(LocationOrigin {
                    latitude: behavior.latitude,
                    longitude: behavior.longitude,
                    depth_m: behavior.depth_m,
                    time_us: behavior.time_us,
                    identifier: None,
                    depth_fixed_to_free_surface: false,
                    arrivals,
                }),
            };
            Some(frame::encode(&response).expect("encode response"))
        }),
    )
}

// ── Incrementer ───────────────────────────────────────────────────────────────

/// Monotone counters per item kind, starting where the caller says.
pub fn spawn_incrementer(first_value: i64) -> ServiceHandle {
    let counters: Mutex<HashMap<u8, i64>> = Mutex::new(HashMap::new());
    serve(
        "incrementer",
        Box::new(move |envelope| {
            let request: IncrementRequest = match envelope.unpack() {
                Ok(request) => request,
                Err(e) => return Some(failure_frame(&e.to_string())),
            };
            let mut counters = counters.lock().expect("counter mutex");
            let value = counters
                .entry(u8::from(request.item))
                .and_modify(|v| *v += 1)
                .or_insert(first_value);
            let response = IncrementResponse {
                identifier: request.identifier,
                return_code: IncrementReturnCode::Success,
                value: *value,
            };
            Some(frame::encode(&response).expect("encode response"))
        }),
    )
}

// ── Broadcast endpoints ───────────────────────────────────────────────────────

/// A broadcast frontend that writes the scripted messages to every
/// subscriber as it connects.
pub fn spawn_broadcast_feed<M: Message + Clone + Send + 'static>(
    messages: Vec<M>,
) -> ServiceHandle {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind feed");
    let address = listener.local_addr().expect("local addr").to_string();
    listener.set_nonblocking(true).expect("nonblocking listener");
    let shutdown = Arc::new(AtomicBool::new(false));
    let accept_shutdown = shutdown.clone();
    let accept_thread = std::thread::Builder::new()
        .name("mock-feed-accept".to_string())
        .spawn(move || {
            while !accept_shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        for message in &messages {
                            let encoded = frame::encode(message).expect("encode feed message");
                            if frame::write_frame(&mut stream, &encoded).is_err() {
                                break;
                            }
                        }
                        // Hold the connection open so the subscriber idles
                        // rather than reconnecting in a loop.
                        while !accept_shutdown.load(Ordering::SeqCst) {
                            std::thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        })
        .expect("spawn feed thread");
    ServiceHandle {
        address,
        shutdown,
        accept_thread: Some(accept_thread),
    }
}

/// A broadcast backend that captures every frame publishers send.
#[derive(Clone, Default)]
pub struct CapturedFrames {
    inner: Arc<Mutex<Vec<Envelope>>>,
}

impl CapturedFrames {
    pub fn len(&self) -> usize {
        self.inner.lock().expect("capture mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes every captured frame of type `M`, in arrival order.
    pub fn typed<M: Message>(&self) -> Vec<M> {
        self.inner
            .lock()
            .expect("capture mutex")
            .iter()
            .filter(|e| e.is::<M>())
            .map(|e| e.unpack::<M>().expect("decode captured frame"))
            .collect()
    }
}

pub fn spawn_capture_bus() -> (ServiceHandle, CapturedFrames) {
    let captured = CapturedFrames::default();
    let sink = captured.clone();
    let handle = serve(
        "capture-bus",
        Box::new(move |envelope| {
            sink.inner.lock().expect("capture mutex").push(envelope);
            None
        }),
    );
    (handle, captured)
}

/// Convenience: a feed of preliminary origins for the locator daemon.
pub fn spawn_origin_feed(origins: Vec<Origin>) -> ServiceHandle {
    spawn_broadcast_feed(origins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use seis_types::messages::IncrementItem;

    fn read_reply<M: Message>(address: &str, request_frame: Vec<u8>) -> M {
        let mut stream = TcpStream::connect(address).unwrap();
        frame::write_frame(&mut stream, &request_frame).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        frame::read_frame(&mut stream).unwrap().unpack().unwrap()
    }

    #[test]
    fn packet_cache_serves_range_queries() {
        let store = PacketStore::new();
        store.push(Packet {
            network: "UU".into(),
            station: "CVRU".into(),
            channel: "HHZ".into(),
            location_code: "01".into(),
            sampling_rate: 100.0,
            start_time_us: 0,
            data: vec![1.0; 100],
        });
        let mut cache = spawn_packet_cache(store);
        let request = DataRequest {
            identifier: 9,
            network: "UU".into(),
            station: "CVRU".into(),
            channel: "HHZ".into(),
            location_code: "01".into(),
            start_time_s: 0.0,
            end_time_s: 10.0,
        };
        let response: DataResponse =
            read_reply(&cache.address, frame::encode(&request).unwrap());
        assert_eq!(response.identifier, 9);
        assert_eq!(response.packets.len(), 1);

        // Unknown sensors come back empty, not as errors.
        let request = DataRequest {
            station: "NOPE".into(),
            ..request
        };
        let response: DataResponse =
            read_reply(&cache.address, frame::encode(&request).unwrap());
        assert_eq!(response.return_code, CacheReturnCode::NoSensor);
        assert!(response.packets.is_empty());
        cache.stop();
    }

    #[test]
    fn incrementer_counts_per_item() {
        let mut service = spawn_incrementer(1000);
        let next = |item: IncrementItem, identifier: i64| -> IncrementResponse {
            read_reply(
                &service.address,
                frame::encode(&IncrementRequest { identifier, item }).unwrap(),
            )
        };
        assert_eq!(next(IncrementItem::Origin, 0).value, 1000);
        assert_eq!(next(IncrementItem::Origin, 1).value, 1001);
        assert_eq!(next(IncrementItem::PhaseArrival, 2).value, 1000);
        service.stop();
    }

    #[test]
    fn capture_bus_collects_typed_frames() {
        let (mut handle, captured) = spawn_capture_bus();
        let mut stream = TcpStream::connect(&handle.address).unwrap();
        let failure = Failure {
            details: "x".into(),
        };
        frame::write_frame(&mut stream, &frame::encode(&failure).unwrap()).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while captured.is_empty() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(captured.typed::<Failure>().len(), 1);
        handle.stop();
    }
}
