//! Request dispatcher (spec.md §4.E).
//!
//! Decodes a `DataPacket` payload into a method call against a
//! [`DataServiceEngine`], performs the capability check implicit in the
//! engine call itself, and encodes the result back into response bytes.
//! One dispatch call corresponds to exactly one storage transaction
//! (spec.md §5's "one request, one transaction").

use byteorder::{BigEndian, ByteOrder};

use crate::capability::CapabilitySet;
use crate::dataservice::engine::DataServiceEngine;
use crate::dataservice::records::Id;
use crate::error::{CoreError, CoreResult, ErrorCode};

/// Method codes carried in the first four bytes of a request payload
/// (spec.md §4.D's per-operation list, assigned in declaration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Method {
    RootContextReduceCaps = 0x0001,
    ChildContextCreate = 0x0002,
    ChildContextClose = 0x0003,
    GlobalSettingGet = 0x0004,
    GlobalSettingSet = 0x0005,
    TransactionSubmit = 0x0006,
    TransactionGetFirst = 0x0007,
    TransactionGet = 0x0008,
    TransactionDrop = 0x0009,
    TransactionPromote = 0x000A,
    BlockMake = 0x000B,
    BlockGet = 0x000C,
    BlockIdByHeightGet = 0x000D,
    LatestBlockIdGet = 0x000E,
    BlockTransactionGet = 0x000F,
    CanonizedTransactionGet = 0x0010,
    ArtifactGet = 0x0011,
}

impl Method {
    fn from_u32(v: u32) -> CoreResult<Self> {
        Ok(match v {
            0x0001 => Self::RootContextReduceCaps,
            0x0002 => Self::ChildContextCreate,
            0x0003 => Self::ChildContextClose,
            0x0004 => Self::GlobalSettingGet,
            0x0005 => Self::GlobalSettingSet,
            0x0006 => Self::TransactionSubmit,
            0x0007 => Self::TransactionGetFirst,
            0x0008 => Self::TransactionGet,
            0x0009 => Self::TransactionDrop,
            0x000A => Self::TransactionPromote,
            0x000B => Self::BlockMake,
            0x000C => Self::BlockGet,
            0x000D => Self::BlockIdByHeightGet,
            0x000E => Self::LatestBlockIdGet,
            0x000F => Self::BlockTransactionGet,
            0x0010 => Self::CanonizedTransactionGet,
            0x0011 => Self::ArtifactGet,
            _ => return Err(CoreError::from(crate::error::UNEXPECTED_METHOD_CODE)),
        })
    }
}

/// A decoded request: method code, originating child context index, and
/// the remaining method-specific payload.
pub struct Request {
    pub method: u32,
    pub child_idx: u32,
    pub body: Vec<u8>,
}

impl Request {
    /// Wire layout: `method:u32 | child_idx:u32 | body`
    /// (spec.md §4.E "Request header").
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < 8 {
            return Err(CoreError::from(crate::error::REQUEST_PACKET_INVALID_SIZE));
        }
        Ok(Self {
            method: BigEndian::read_u32(&buf[0..4]),
            child_idx: BigEndian::read_u32(&buf[4..8]),
            body: buf[8..].to_vec(),
        })
    }
}

fn read_id(buf: &[u8], pos: &mut usize) -> CoreResult<Id> {
    if buf.len() < *pos + 16 {
        return Err(CoreError::from(crate::error::REQUEST_PACKET_BAD));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&buf[*pos..*pos + 16]);
    *pos += 16;
    Ok(id)
}

fn read_u64(buf: &[u8], pos: &mut usize) -> CoreResult<u64> {
    if buf.len() < *pos + 8 {
        return Err(CoreError::from(crate::error::REQUEST_PACKET_BAD));
    }
    let v = BigEndian::read_u64(&buf[*pos..*pos + 8]);
    *pos += 8;
    Ok(v)
}

/// Builds a response payload: `method_id || offset || status || body`
/// (spec.md §4.E: "every response is a data packet whose first 12 bytes
/// are `method_id || offset || status`"). The data service dispatcher has
/// no offset concept of its own (only the random service's byte-range
/// requests do), so `offset` is always 0 here.
fn ok_response(method: u32, body: Vec<u8>) -> Vec<u8> {
    let mut out = vec![0u8; 12 + body.len()];
    BigEndian::write_u32(&mut out[0..4], method);
    BigEndian::write_u32(&mut out[4..8], 0);
    BigEndian::write_u32(&mut out[8..12], ErrorCode::SUCCESS);
    out[12..].copy_from_slice(&body);
    out
}

fn err_response(method: u32, err: &CoreError) -> Vec<u8> {
    let mut out = vec![0u8; 12];
    BigEndian::write_u32(&mut out[0..4], method);
    BigEndian::write_u32(&mut out[4..8], 0);
    BigEndian::write_u32(&mut out[8..12], err.to_wire());
    out
}

/// Executes one decoded request against `engine`, returning a fully
/// encoded response payload. Storage errors are caught and turned into an
/// error-status response rather than propagated, so a single bad request
/// never tears down the connection (spec.md §7: "Status codes ... travel
/// to the peer"); only `CoreError::Fatal` bypasses this and is re-raised
/// to the caller, which forces the owning reactor to exit (spec.md §5).
pub fn dispatch(engine: &mut DataServiceEngine, request: &Request) -> CoreResult<Vec<u8>> {
    match run(engine, request) {
        Ok(body) => Ok(ok_response(request.method, body)),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => Ok(err_response(request.method, &err)),
    }
}

fn run(engine: &mut DataServiceEngine, request: &Request) -> CoreResult<Vec<u8>> {
    let method = Method::from_u32(request.method)?;
    let body = &request.body;
    let child = request.child_idx;

    match method {
        Method::RootContextReduceCaps => {
            if body.len() < 4 {
                return Err(CoreError::from(crate::error::REQUEST_PACKET_BAD));
            }
            let num_words = body.len() / 4;
            let mut words = Vec::with_capacity(num_words);
            for i in 0..num_words {
                words.push(BigEndian::read_u32(&body[i * 4..i * 4 + 4]));
            }
            engine.reduce_root_caps(&CapabilitySet::from_words(&words))?;
            Ok(Vec::new())
        }
        Method::ChildContextCreate => {
            if body.is_empty() {
                return Err(CoreError::from(crate::error::REQUEST_PACKET_BAD));
            }
            let num_words = body.len() / 4;
            let mut words = Vec::with_capacity(num_words);
            for i in 0..num_words {
                words.push(BigEndian::read_u32(&body[i * 4..i * 4 + 4]));
            }
            let idx = engine.create_child(&CapabilitySet::from_words(&words))?;
            let mut out = vec![0u8; 4];
            BigEndian::write_u32(&mut out, idx);
            Ok(out)
        }
        Method::ChildContextClose => {
            engine.close_child(child)?;
            Ok(Vec::new())
        }
        Method::GlobalSettingGet => {
            let mut pos = 0usize;
            let key = read_u64(body, &mut pos)?;
            engine.global_setting_get(child, key)
        }
        Method::GlobalSettingSet => {
            let mut pos = 0usize;
            let key = read_u64(body, &mut pos)?;
            engine.global_setting_set(child, key, &body[pos..])?;
            Ok(Vec::new())
        }
        Method::TransactionSubmit => {
            let mut pos = 0usize;
            let txn_id = read_id(body, &mut pos)?;
            let artifact_id = read_id(body, &mut pos)?;
            engine.transaction_submit(child, txn_id, artifact_id, body[pos..].to_vec())?;
            Ok(Vec::new())
        }
        Method::TransactionGetFirst => {
            let node = engine.transaction_get_first(child)?;
            Ok(node.encode())
        }
        Method::TransactionGet => {
            let mut pos = 0usize;
            let txn_id = read_id(body, &mut pos)?;
            Ok(engine.transaction_get(child, txn_id)?.encode())
        }
        Method::TransactionDrop => {
            let mut pos = 0usize;
            let txn_id = read_id(body, &mut pos)?;
            engine.transaction_drop(child, txn_id)?;
            Ok(Vec::new())
        }
        Method::TransactionPromote => {
            let mut pos = 0usize;
            let txn_id = read_id(body, &mut pos)?;
            engine.transaction_promote(child, txn_id)?;
            Ok(Vec::new())
        }
        Method::BlockMake => {
            engine.block_make(child, body.clone())?;
            Ok(Vec::new())
        }
        Method::BlockGet => {
            let mut pos = 0usize;
            let block_id = read_id(body, &mut pos)?;
            Ok(engine.block_get(child, block_id)?.encode())
        }
        Method::BlockIdByHeightGet => {
            let mut pos = 0usize;
            let height = read_u64(body, &mut pos)?;
            Ok(engine.block_id_by_height_get(child, height)?.to_vec())
        }
        Method::LatestBlockIdGet => Ok(engine.latest_block_id_get(child)?.to_vec()),
        Method::BlockTransactionGet => {
            let mut pos = 0usize;
            let txn_id = read_id(body, &mut pos)?;
            Ok(engine.block_transaction_get(child, txn_id)?.encode())
        }
        Method::CanonizedTransactionGet => {
            let mut pos = 0usize;
            let txn_id = read_id(body, &mut pos)?;
            let (entry, node) = engine.canonized_transaction_get(child, txn_id)?;
            let mut out = entry.encode();
            out.extend_from_slice(&node.encode());
            Ok(out)
        }
        Method::ArtifactGet => {
            let mut pos = 0usize;
            let artifact_id = read_id(body, &mut pos)?;
            Ok(engine.artifact_get(child, artifact_id)?.encode())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySet;
    use tempfile::tempdir;

    fn new_engine() -> (DataServiceEngine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let engine = DataServiceEngine::open(&dir.path().join("store.redb")).unwrap();
        (engine, dir)
    }

    #[test]
    fn settings_round_trip_through_dispatch() {
        let (mut engine, _dir) = new_engine();
        let child = engine.create_child(&CapabilitySet::all()).unwrap();

        let mut set_body = vec![0u8; 8];
        BigEndian::write_u64(&mut set_body, 9);
        set_body.extend_from_slice(b"hi");
        let set_req = Request {
            method: Method::GlobalSettingSet as u32,
            child_idx: child,
            body: set_body,
        };
        let set_resp = dispatch(&mut engine, &set_req).unwrap();
        assert_eq!(BigEndian::read_u32(&set_resp[0..4]), Method::GlobalSettingSet as u32);
        assert_eq!(BigEndian::read_u32(&set_resp[8..12]), ErrorCode::SUCCESS);

        let mut get_body = vec![0u8; 8];
        BigEndian::write_u64(&mut get_body, 9);
        let get_req = Request {
            method: Method::GlobalSettingGet as u32,
            child_idx: child,
            body: get_body,
        };
        let get_resp = dispatch(&mut engine, &get_req).unwrap();
        assert_eq!(BigEndian::read_u32(&get_resp[0..4]), Method::GlobalSettingGet as u32);
        assert_eq!(BigEndian::read_u32(&get_resp[8..12]), ErrorCode::SUCCESS);
        assert_eq!(&get_resp[12..], b"hi");
    }

    #[test]
    fn unknown_method_is_rejected_without_killing_connection() {
        let (mut engine, _dir) = new_engine();
        let req = Request {
            method: 0xFFFF,
            child_idx: 0,
            body: Vec::new(),
        };
        let resp = dispatch(&mut engine, &req).unwrap();
        assert_ne!(BigEndian::read_u32(&resp[8..12]), ErrorCode::SUCCESS);
    }

    #[test]
    fn not_found_surfaces_as_status_not_fatal() {
        let (mut engine, _dir) = new_engine();
        let child = engine.create_child(&CapabilitySet::all()).unwrap();
        let mut body = vec![0u8; 8];
        BigEndian::write_u64(&mut body, 123);
        let req = Request {
            method: Method::GlobalSettingGet as u32,
            child_idx: child,
            body,
        };
        let resp = dispatch(&mut engine, &req).unwrap();
        assert_eq!(
            BigEndian::read_u32(&resp[8..12]),
            crate::error::NOT_FOUND.to_wire()
        );
    }
}
