//! Random byte service (spec.md §4.C).
//!
//! The entropy source itself — "a simple service that reads from an OS
//! entropy device" — is an out-of-scope collaborator (spec.md §1); this
//! module is the in-scope request/response protocol and the core-owned
//! client used by the canonization service to mint new block ids.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{CoreError, CoreResult, ServiceTag};

pub const GET_RANDOM_BYTES: u32 = 0x0000_0001;
/// Payload size cap shared with the rest of the framing layer (spec.md
/// §4.C: "0 < count <= 10 MiB").
pub const MAX_RANDOM_BYTES: u32 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomRequest {
    pub method: u32,
    pub offset: u32,
    pub count: u32,
}

impl RandomRequest {
    pub fn new(offset: u32, count: u32) -> Self {
        Self {
            method: GET_RANDOM_BYTES,
            offset,
            count,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 12];
        BigEndian::write_u32(&mut out[0..4], self.method);
        BigEndian::write_u32(&mut out[4..8], self.offset);
        BigEndian::write_u32(&mut out[8..12], self.count);
        out
    }

    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < 12 {
            return Err(CoreError::from(crate::error::REQUEST_PACKET_INVALID_SIZE));
        }
        Ok(Self {
            method: BigEndian::read_u32(&buf[0..4]),
            offset: BigEndian::read_u32(&buf[4..8]),
            count: BigEndian::read_u32(&buf[8..12]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomResponse {
    pub method: u32,
    pub offset: u32,
    pub status: u32,
    pub payload: Vec<u8>,
}

impl RandomResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 12 + self.payload.len()];
        BigEndian::write_u32(&mut out[0..4], self.method);
        BigEndian::write_u32(&mut out[4..8], self.offset);
        BigEndian::write_u32(&mut out[8..12], self.status);
        out[12..].copy_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < 12 {
            return Err(CoreError::from(crate::error::RESPONSE_PACKET_INVALID_SIZE));
        }
        Ok(Self {
            method: BigEndian::read_u32(&buf[0..4]),
            offset: BigEndian::read_u32(&buf[4..8]),
            status: BigEndian::read_u32(&buf[8..12]),
            payload: buf[12..].to_vec(),
        })
    }
}

/// Server-side handler: reads `count` bytes from the entropy collaborator
/// and builds the response that echoes the request's `offset` (spec.md §8
/// end-to-end scenario 1).
///
/// `read_entropy` stands in for the out-of-scope OS-entropy-device
/// collaborator; production wiring passes a closure backed by a real
/// socket to that service, tests pass `getrandom::getrandom`.
pub fn handle_request(
    request: &RandomRequest,
    read_entropy: impl FnOnce(usize) -> std::io::Result<Vec<u8>>,
) -> RandomResponse {
    if request.count == 0 || request.count > MAX_RANDOM_BYTES {
        return RandomResponse {
            method: request.method,
            offset: request.offset,
            status: crate::error::ErrorCode::new(ServiceTag::Random, 0x0001).to_wire(),
            payload: Vec::new(),
        };
    }

    match read_entropy(request.count as usize) {
        Ok(payload) => RandomResponse {
            method: request.method,
            offset: request.offset,
            status: crate::error::ErrorCode::SUCCESS,
            payload,
        },
        Err(_) => RandomResponse {
            method: request.method,
            offset: request.offset,
            status: crate::error::ErrorCode::new(ServiceTag::Random, 0x0002).to_wire(),
            payload: Vec::new(),
        },
    }
}

/// Default entropy backend used outside of tests: the OS CSPRNG via
/// `getrandom`.
pub fn os_entropy(count: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; count];
    getrandom::getrandom(&mut buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = RandomRequest::new(17, 1);
        let bytes = req.encode();
        assert_eq!(RandomRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn scenario_one_random_byte_request() {
        // spec.md §8 end-to-end scenario 1.
        let req = RandomRequest::new(17, 1);
        let resp = handle_request(&req, |n| Ok(vec![0xAB; n]));
        assert_eq!(resp.method, GET_RANDOM_BYTES);
        assert_eq!(resp.offset, 17);
        assert_eq!(resp.status, crate::error::ErrorCode::SUCCESS);
        assert_eq!(resp.payload.len(), 1);
    }

    #[test]
    fn zero_count_is_invalid_size() {
        let req = RandomRequest::new(0, 0);
        let resp = handle_request(&req, |n| Ok(vec![0; n]));
        assert_ne!(resp.status, crate::error::ErrorCode::SUCCESS);
    }

    #[test]
    fn oversized_count_is_invalid_size() {
        let req = RandomRequest::new(0, MAX_RANDOM_BYTES + 1);
        let resp = handle_request(&req, |n| Ok(vec![0; n]));
        assert_ne!(resp.status, crate::error::ErrorCode::SUCCESS);
    }

    #[test]
    fn entropy_read_failure_is_read_failed() {
        let req = RandomRequest::new(0, 4);
        let resp = handle_request(&req, |_| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "device error"))
        });
        assert_ne!(resp.status, crate::error::ErrorCode::SUCCESS);
    }
}
