//! # locator
//!
//! The locator orchestrator: subscribes to preliminary origins, refines
//! them through the remote location service, re-stamps identifiers from the
//! incrementer, and republishes. Three dedicated threads (subscriber,
//! locator RPC, publisher) communicate over bounded queues with
//! wait-with-timeout semantics; a full queue drops its oldest entry because
//! downstream freshness matters more than completeness.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use seis_types::messages::{
    IncrementItem, IncrementRequest, IncrementResponse, IncrementReturnCode, LocationArrival,
    LocationOrigin, LocationRequest, LocationResponse, LocationReturnCode, LocationStrategy,
};
use seis_types::{micros_to_seconds, Arrival, EventType, MonitoringRegion, Origin, Phase};

use crate::broadcast::{OriginSink, OriginSource};
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use crate::transport::{RequestSocket, SocketOptions};

// ── Service clients ───────────────────────────────────────────────────────────

/// The remote location service. Implemented by [`LocatorClient`] over the
/// wire and by scripted fakes in tests.
pub trait LocatorService: Send {
    fn locate(&mut self, request: &LocationRequest) -> Result<LocationResponse>;
}

pub struct LocatorClient {
    socket: RequestSocket,
}

impl LocatorClient {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            socket: RequestSocket::new(options),
        }
    }
}

impl LocatorService for LocatorClient {
    fn locate(&mut self, request: &LocationRequest) -> Result<LocationResponse> {
        request.validate()?;
        self.socket.request(request)
    }
}

/// The identifier incrementer: a monotone counter per item kind.
pub trait IncrementerService: Send {
    fn next_value(&mut self, item: IncrementItem) -> Result<i64>;
}

pub struct IncrementerClient {
    socket: RequestSocket,
    next_identifier: AtomicI64,
}

impl IncrementerClient {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            socket: RequestSocket::new(options),
            next_identifier: AtomicI64::new(0),
        }
    }
}

impl IncrementerService for IncrementerClient {
    fn next_value(&mut self, item: IncrementItem) -> Result<i64> {
        let request = IncrementRequest {
            identifier: self.next_identifier.fetch_add(1, Ordering::Relaxed),
            item,
        };
        let response: IncrementResponse = self.socket.request(&request)?;
        if response.return_code != IncrementReturnCode::Success {
            return Err(Error::Backend {
                code: u8::from(response.return_code) as i32,
                context: "increment request rejected".to_string(),
            });
        }
        Ok(response.value)
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocatorOptions {
    /// Name appended to each refined origin's algorithm list
    pub module_name: String,
    /// The one region this instance serves
    pub region: MonitoringRegion,
    /// Capacity of the two internal queues
    pub queue_capacity: usize,
    /// Wait-with-timeout interval for queue pops
    pub poll_interval: Duration,
    /// Bounded wait on the origin subscription
    pub subscriber_poll: Duration,
}

impl Default for LocatorOptions {
    fn default() -> Self {
        Self {
            module_name: "locator".to_string(),
            region: MonitoringRegion::Unknown,
            queue_capacity: 64,
            poll_interval: Duration::from_millis(10),
            subscriber_poll: Duration::from_millis(100),
        }
    }
}

// ── Translation and merging ───────────────────────────────────────────────────

/// Default pick standard errors, applied when the upstream associator did
/// not supply one: 0.05 s for P, 0.10 s for S.
fn default_standard_error(phase: Phase) -> f64 {
    match phase {
        Phase::P => 0.05,
        Phase::S => 0.10,
    }
}

fn to_location_arrival(arrival: &Arrival) -> Result<LocationArrival> {
    arrival.validate().map_err(Error::from)?;
    Ok(LocationArrival {
        network: arrival.network.clone(),
        station: arrival.station.clone(),
        time_us: arrival.time_us,
        phase: arrival.phase,
        standard_error_s: arrival
            .standard_error_s
            .or_else(|| Some(default_standard_error(arrival.phase))),
        identifier: arrival.identifier,
        travel_time_s: None,
    })
}

/// Builds the location request for one origin: translated arrivals sorted
/// ascending by time, and the free-surface strategy for quarry-blast
/// candidates.
pub fn build_location_request(origin: &Origin, identifier: i64) -> Result<LocationRequest> {
    let mut arrivals = Vec::with_capacity(origin.arrivals.len());
    for arrival in &origin.arrivals {
        match to_location_arrival(arrival) {
            Ok(arrival) => arrivals.push(arrival),
            Err(e) => warn!("did not add arrival: {e}"),
        }
    }
    arrivals.sort_by_key(|a| a.time_us);
    let location_strategy = if origin.event_type == EventType::QuarryBlast {
        LocationStrategy::FreeSurface
    } else {
        LocationStrategy::General
    };
    let request = LocationRequest {
        identifier,
        location_strategy,
        arrivals,
    };
    request.validate().map_err(Error::from)?;
    Ok(request)
}

/// Merges the refined hypocenter back onto the original origin. Arrival
/// metadata from the original is preserved; residuals are computed as
/// observed − (origin time + travel time) where the locator supplied a
/// travel time. Arrivals the locator did not echo back are dropped.
pub fn merge_refined(initial: &Origin, refined: &LocationOrigin) -> Origin {
    let mut result = initial.clone();
    result.latitude = refined.latitude;
    result.longitude = refined.longitude;
    result.depth_m = refined.depth_m;
    result.time_us = refined.time_us;
    let origin_time_s = micros_to_seconds(refined.time_us);
    let mut arrivals = Vec::with_capacity(result.arrivals.len());
    for mut arrival in std::mem::take(&mut result.arrivals) {
        let matched = refined.arrivals.iter().find(|r| {
            r.network == arrival.network
                && r.station == arrival.station
                && r.phase == arrival.phase
        });
        match matched {
            Some(relocated) => {
                if let Some(travel_time) = relocated.travel_time_s {
                    arrival.travel_time_s = Some(travel_time);
                    arrival.residual_s = Some(
                        micros_to_seconds(arrival.time_us) - (origin_time_s + travel_time),
                    );
                }
                arrivals.push(arrival);
            }
            None => warn!(
                "no relocated match for arrival {}, dropping it",
                arrival.name()
            ),
        }
    }
    result.arrivals = arrivals;
    result
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Pushes into a bounded queue, evicting the oldest entry when full.
fn push_drop_oldest<T>(tx: &Sender<T>, rx: &Receiver<T>, value: T, what: &str) {
    match tx.try_send(value) {
        Ok(()) => {}
        Err(TrySendError::Full(value)) => {
            let _ = rx.try_recv();
            warn!("{what} queue full, dropped the oldest entry");
            if tx.try_send(value).is_err() {
                warn!("{what} queue rejected a fresh entry");
            }
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

pub struct LocatorOrchestrator {
    shutdown: Arc<Shutdown>,
    handles: Vec<JoinHandle<()>>,
}

impl LocatorOrchestrator {
    pub fn start(
        options: LocatorOptions,
        source: Box<dyn OriginSource>,
        locator: Box<dyn LocatorService>,
        incrementer: Box<dyn IncrementerService>,
        publisher: Box<dyn OriginSink>,
        shutdown: Arc<Shutdown>,
    ) -> Result<Self> {
        if options.queue_capacity == 0 {
            return Err(Error::InvalidArgument(
                "queue capacity must be positive".to_string(),
            ));
        }
        let (to_locator_tx, to_locator_rx) = bounded::<Origin>(options.queue_capacity);
        let (to_publisher_tx, to_publisher_rx) =
            bounded::<(Origin, bool)>(options.queue_capacity);

        let mut handles = Vec::new();
        {
            let options = options.clone();
            let shutdown = shutdown.clone();
            let drop_side = to_locator_rx.clone();
            let mut source = source;
            handles.push(
                std::thread::Builder::new()
                    .name("locator-subscriber".to_string())
                    .spawn(move || {
                        debug!("origin subscriber starting");
                        while !shutdown.is_triggered() {
                            match source.recv_timeout(options.subscriber_poll) {
                                Ok(Some(origin)) => {
                                    if origin.monitoring_region == options.region {
                                        debug!(identifier = origin.identifier, "queueing origin");
                                        push_drop_oldest(
                                            &to_locator_tx,
                                            &drop_side,
                                            origin,
                                            "locator",
                                        );
                                    } else {
                                        debug!(
                                            identifier = origin.identifier,
                                            "origin not in region, skipping"
                                        );
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!("origin subscription error: {e}");
                                    shutdown.wait_timeout(Duration::from_secs(1));
                                }
                            }
                        }
                        debug!("origin subscriber leaving");
                    })
                    .map_err(|e| Error::Communication(format!("spawn failed: {e}")))?,
            );
        }
        {
            let options = options.clone();
            let shutdown = shutdown.clone();
            let drop_side = to_publisher_rx.clone();
            let mut locator = locator;
            handles.push(
                std::thread::Builder::new()
                    .name("locator-rpc".to_string())
                    .spawn(move || {
                        debug!("locator thread starting");
                        let mut request_identifier: i64 = 0;
                        loop {
                            match to_locator_rx.recv_timeout(options.poll_interval) {
                                Ok(origin) => {
                                    request_identifier += 1;
                                    let outcome =
                                        Self::refine(&mut *locator, &origin, request_identifier);
                                    push_drop_oldest(
                                        &to_publisher_tx,
                                        &drop_side,
                                        outcome,
                                        "publisher",
                                    );
                                }
                                Err(RecvTimeoutError::Timeout) => {
                                    if shutdown.is_triggered() {
                                        break;
                                    }
                                }
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                        }
                        debug!("locator thread leaving");
                    })
                    .map_err(|e| Error::Communication(format!("spawn failed: {e}")))?,
            );
        }
        {
            let shutdown = shutdown.clone();
            let mut incrementer = incrementer;
            let mut publisher = publisher;
            let module_name = options.module_name.clone();
            let poll_interval = options.poll_interval;
            handles.push(
                std::thread::Builder::new()
                    .name("locator-publisher".to_string())
                    .spawn(move || {
                        debug!("origin publisher starting");
                        loop {
                            match to_publisher_rx.recv_timeout(poll_interval) {
                                Ok((origin, refined)) => {
                                    Self::finalize_and_publish(
                                        origin,
                                        refined,
                                        &module_name,
                                        &mut *incrementer,
                                        &mut *publisher,
                                    );
                                }
                                Err(RecvTimeoutError::Timeout) => {
                                    // Drain whatever is queued, then leave
                                    // within one poll interval of shutdown.
                                    if shutdown.is_triggered() {
                                        break;
                                    }
                                }
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                        }
                        debug!("origin publisher leaving");
                    })
                    .map_err(|e| Error::Communication(format!("spawn failed: {e}")))?,
            );
        }
        Ok(Self { shutdown, handles })
    }

    fn refine(
        locator: &mut dyn LocatorService,
        origin: &Origin,
        request_identifier: i64,
    ) -> (Origin, bool) {
        let request = match build_location_request(origin, request_identifier) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    identifier = origin.identifier,
                    "cannot build location request: {e}"
                );
                return (origin.clone(), false);
            }
        };
        match locator.locate(&request) {
            Ok(LocationResponse {
                return_code: LocationReturnCode::Success,
                origin: Some(refined),
                ..
            }) => (merge_refined(origin, &refined), true),
            Ok(response) => {
                warn!(
                    identifier = origin.identifier,
                    return_code = u8::from(response.return_code),
                    "location request failed, propagating unrefined origin"
                );
                (origin.clone(), false)
            }
            Err(e) => {
                warn!(
                    identifier = origin.identifier,
                    "failed to refine origin: {e}"
                );
                (origin.clone(), false)
            }
        }
    }

    fn finalize_and_publish(
        mut origin: Origin,
        refined: bool,
        module_name: &str,
        incrementer: &mut dyn IncrementerService,
        publisher: &mut dyn OriginSink,
    ) {
        if !refined {
            debug!("propagating unrefined origin");
        } else {
            let initial_identifier = origin.identifier;
            match incrementer.next_value(IncrementItem::Origin) {
                Ok(value) => {
                    origin.identifier = value;
                    origin.previous_identifiers.push(initial_identifier);
                    origin.algorithms.push(module_name.to_string());
                }
                Err(e) => warn!("failed to get new origin identifier: {e}"),
            }
            for arrival in &mut origin.arrivals {
                arrival.origin_identifier = Some(origin.identifier);
                match incrementer.next_value(IncrementItem::PhaseArrival) {
                    Ok(value) => arrival.identifier = Some(value),
                    Err(e) => warn!("failed to get arrival identifier: {e}"),
                }
            }
        }
        info!(
            identifier = origin.identifier,
            time_s = micros_to_seconds(origin.time_us),
            latitude = origin.latitude,
            longitude = origin.longitude,
            depth_m = origin.depth_m,
            arrivals = origin.arrivals.len(),
            refined,
            "publishing origin"
        );
        if let Err(e) = publisher.send(&origin) {
            error!("failed to send origin: {e}");
        }
    }

    /// Requests shutdown and joins the three threads. The publisher drains
    /// its queue before leaving.
    pub fn stop(self) {
        self.shutdown.trigger();
        for handle in self.handles {
            if let Err(e) = handle.join() {
                error!("locator thread panicked: {e:?}");
            }
        }
    }
}
