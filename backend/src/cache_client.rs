//! # cache_client
//!
//! Client for the waveform packet-cache service: single-channel and bulk
//! half-open range queries. The client never retries; query pacing and
//! retry policy belong to the sensor state machine that owns it.

use std::sync::atomic::{AtomicI64, Ordering};

use seis_types::messages::{
    BulkDataRequest, BulkDataResponse, CacheReturnCode, DataRequest, DataResponse,
};

use crate::error::{Error, Result};
use crate::transport::{RequestSocket, SocketOptions};

/// The packet-cache operations the pipeline depends on. Implemented by
/// [`PacketCacheClient`] over the wire and by in-process fakes in tests.
pub trait CacheService: Send {
    /// One channel, one half-open time range.
    fn request(&mut self, request: &DataRequest) -> Result<DataResponse>;
    /// Several channels in one round trip, demultiplexed by request id.
    fn bulk_request(&mut self, request: &BulkDataRequest) -> Result<BulkDataResponse>;
}

pub struct PacketCacheClient {
    socket: RequestSocket,
    next_identifier: AtomicI64,
}

impl PacketCacheClient {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            socket: RequestSocket::new(options),
            next_identifier: AtomicI64::new(0),
        }
    }

    /// Hands out identifiers for callers that do not manage their own.
    pub fn next_identifier(&self) -> i64 {
        self.next_identifier.fetch_add(1, Ordering::Relaxed)
    }

    fn check_return_code(code: CacheReturnCode, context: &str) -> Result<()> {
        match code {
            // NoSensor is an empty result, not an error: the channel simply
            // has not produced data yet.
            CacheReturnCode::Success | CacheReturnCode::NoSensor => Ok(()),
            other => Err(Error::Backend {
                code: u8::from(other) as i32,
                context: context.to_string(),
            }),
        }
    }
}

impl CacheService for PacketCacheClient {
    fn request(&mut self, request: &DataRequest) -> Result<DataResponse> {
        request.validate()?;
        let response: DataResponse = self.socket.request(request)?;
        Self::check_return_code(response.return_code, &request.name())?;
        Ok(response)
    }

    fn bulk_request(&mut self, request: &BulkDataRequest) -> Result<BulkDataResponse> {
        request.validate()?;
        let response: BulkDataResponse = self.socket.request(request)?;
        Self::check_return_code(response.return_code, "bulk data request")?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_codes_map_to_errors() {
        assert!(PacketCacheClient::check_return_code(CacheReturnCode::Success, "x").is_ok());
        assert!(PacketCacheClient::check_return_code(CacheReturnCode::NoSensor, "x").is_ok());
        let err = PacketCacheClient::check_return_code(CacheReturnCode::InvalidTimeQuery, "x")
            .unwrap_err();
        match err {
            Error::Backend { code, .. } => assert_eq!(code, 4),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn identifiers_are_monotone() {
        let client = PacketCacheClient::new(SocketOptions::new("127.0.0.1:1"));
        let a = client.next_identifier();
        let b = client.next_identifier();
        assert!(b > a);
    }
}
