//! # broadcast
//!
//! Typed endpoints on the broadcast buses: the probability-packet publisher
//! fed by the pipeline, and the origin publisher/subscriber pair used by
//! the locator orchestrator.

use std::time::Duration;

use tracing::debug;

use seis_types::{Origin, ProbabilityPacket};

use crate::error::Result;
use crate::transport::{Publisher, SocketOptions, Subscriber};

// ── Probability bus ───────────────────────────────────────────────────────────

/// Where finished probability packets go. Implemented over the wire by
/// [`ProbabilityPublisher`] and by collecting fakes in tests.
pub trait ProbabilitySink: Send {
    fn send(&mut self, packet: &ProbabilityPacket) -> Result<()>;
}

pub struct ProbabilityPublisher {
    publisher: Publisher,
}

impl ProbabilityPublisher {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            publisher: Publisher::new(options),
        }
    }
}

impl ProbabilitySink for ProbabilityPublisher {
    fn send(&mut self, packet: &ProbabilityPacket) -> Result<()> {
        self.publisher.send(packet)
    }
}

// ── Origin buses ──────────────────────────────────────────────────────────────

/// Source of preliminary origins. Implemented over the wire by
/// [`OriginSubscriber`] and by scripted fakes in tests.
pub trait OriginSource: Send {
    /// Waits up to `timeout` for the next origin; `Ok(None)` when nothing
    /// arrived in time.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Origin>>;
}

/// Sink for refined origins.
pub trait OriginSink: Send {
    fn send(&mut self, origin: &Origin) -> Result<()>;
}

pub struct OriginSubscriber {
    subscriber: Subscriber,
}

impl OriginSubscriber {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            subscriber: Subscriber::new(options),
        }
    }
}

impl OriginSource for OriginSubscriber {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Origin>> {
        loop {
            let Some(envelope) = self.subscriber.recv_timeout(timeout)? else {
                return Ok(None);
            };
            if envelope.is::<Origin>() {
                return Ok(Some(envelope.unpack::<Origin>()?));
            }
            // The broadcast may interleave other message kinds; skip them.
            debug!(message_type = %envelope.message_type, "ignoring non-origin frame");
        }
    }
}

pub struct OriginPublisher {
    publisher: Publisher,
}

impl OriginPublisher {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            publisher: Publisher::new(options),
        }
    }
}

impl OriginSink for OriginPublisher {
    fn send(&mut self, origin: &Origin) -> Result<()> {
        self.publisher.send(origin)
    }
}
