//! On-disk record layouts for the data service (spec.md §3).
//!
//! Each record is a fixed-width header of big-endian integers and 128-bit
//! ids followed by a variable-length certificate blob, matching spec.md's
//! "All multi-byte integers on the wire and in stored records are
//! big-endian." Per spec.md §9's design note, these are plain owned structs
//! with explicit id-to-id references — no in-memory cyclic graph — so the
//! doubly linked queue and chain are reconstructed by walking ids through
//! `redb` lookups on demand.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{CoreError, CoreResult, ServiceTag};

pub type Id = [u8; 16];

pub const ZERO_ID: Id = [0u8; 16];
/// Reserved id for the process queue's sentinel node; never a valid
/// caller-supplied transaction id.
pub const QUEUE_SENTINEL_ID: Id = [0xFFu8; 16];

pub fn is_zero(id: &Id) -> bool {
    *id == ZERO_ID
}

fn read_id(buf: &[u8], pos: &mut usize) -> Id {
    let mut id = [0u8; 16];
    id.copy_from_slice(&buf[*pos..*pos + 16]);
    *pos += 16;
    id
}

fn read_u64(buf: &[u8], pos: &mut usize) -> u64 {
    let v = BigEndian::read_u64(&buf[*pos..*pos + 8]);
    *pos += 8;
    v
}

fn read_u32(buf: &[u8], pos: &mut usize) -> u32 {
    let v = BigEndian::read_u32(&buf[*pos..*pos + 4]);
    *pos += 4;
    v
}

/// Transaction states (spec.md §3, "Transaction node").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Unknown,
    Submitted,
    Attested,
    Canonized,
    Invalid,
}

impl TxnState {
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Submitted => 1,
            Self::Attested => 2,
            Self::Canonized => 3,
            Self::Invalid => 0xFFFF_FFFF,
        }
    }

    pub fn from_u32(v: u32) -> CoreResult<Self> {
        Ok(match v {
            0 => Self::Unknown,
            1 => Self::Submitted,
            2 => Self::Attested,
            3 => Self::Canonized,
            0xFFFF_FFFF => Self::Invalid,
            _ => return Err(CoreError::status(ServiceTag::DataService, 0x0010)),
        })
    }
}

/// A node in the process queue (spec.md §3, "Transaction node").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnNode {
    pub txn_id: Id,
    pub prev_id: Id,
    pub next_id: Id,
    pub artifact_id: Id,
    pub block_id: Id,
    pub state: u32,
    pub cert_bytes: Vec<u8>,
}

impl TxnNode {
    pub fn sentinel() -> Self {
        Self {
            txn_id: QUEUE_SENTINEL_ID,
            prev_id: QUEUE_SENTINEL_ID,
            next_id: QUEUE_SENTINEL_ID,
            artifact_id: ZERO_ID,
            block_id: ZERO_ID,
            state: TxnState::Unknown.to_u32(),
            cert_bytes: Vec::new(),
        }
    }

    /// A node with `block_id` still zeroed is in-queue; a non-zero
    /// `block_id` means it has been canonized (spec.md §3 queue
    /// invariants).
    pub fn is_queued(&self) -> bool {
        is_zero(&self.block_id)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(92 + self.cert_bytes.len());
        out.extend_from_slice(&self.txn_id);
        out.extend_from_slice(&self.prev_id);
        out.extend_from_slice(&self.next_id);
        out.extend_from_slice(&self.artifact_id);
        out.extend_from_slice(&self.block_id);
        let mut tail = [0u8; 12];
        BigEndian::write_u64(&mut tail[0..8], self.cert_bytes.len() as u64);
        BigEndian::write_u32(&mut tail[8..12], self.state);
        out.extend_from_slice(&tail);
        out.extend_from_slice(&self.cert_bytes);
        out
    }

    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < 92 {
            return Err(CoreError::from(crate::error::INVALID_STORED_TRANSACTION_NODE));
        }
        let mut pos = 0usize;
        let txn_id = read_id(buf, &mut pos);
        let prev_id = read_id(buf, &mut pos);
        let next_id = read_id(buf, &mut pos);
        let artifact_id = read_id(buf, &mut pos);
        let block_id = read_id(buf, &mut pos);
        let cert_size = read_u64(buf, &mut pos) as usize;
        let state = read_u32(buf, &mut pos);
        if buf.len() != pos + cert_size {
            return Err(CoreError::from(crate::error::INVALID_STORED_TRANSACTION_NODE));
        }
        let cert_bytes = buf[pos..].to_vec();
        Ok(Self {
            txn_id,
            prev_id,
            next_id,
            artifact_id,
            block_id,
            state,
            cert_bytes,
        })
    }
}

/// `{artifact_id, txn_first, txn_latest, height_first, height_latest,
/// state_latest}` (spec.md §3, "Artifact record").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub artifact_id: Id,
    pub txn_first: Id,
    pub txn_latest: Id,
    pub height_first: u64,
    pub height_latest: u64,
    pub state_latest: u32,
}

impl ArtifactRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(76);
        out.extend_from_slice(&self.artifact_id);
        out.extend_from_slice(&self.txn_first);
        out.extend_from_slice(&self.txn_latest);
        let mut tail = [0u8; 20];
        BigEndian::write_u64(&mut tail[0..8], self.height_first);
        BigEndian::write_u64(&mut tail[8..16], self.height_latest);
        BigEndian::write_u32(&mut tail[16..20], self.state_latest);
        out.extend_from_slice(&tail);
        out
    }

    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() != 76 {
            return Err(CoreError::status(ServiceTag::DataService, 0x0011));
        }
        let mut pos = 0usize;
        let artifact_id = read_id(buf, &mut pos);
        let txn_first = read_id(buf, &mut pos);
        let txn_latest = read_id(buf, &mut pos);
        let height_first = read_u64(buf, &mut pos);
        let height_latest = read_u64(buf, &mut pos);
        let state_latest = read_u32(buf, &mut pos);
        Ok(Self {
            artifact_id,
            txn_first,
            txn_latest,
            height_first,
            height_latest,
            state_latest,
        })
    }
}

/// `{block_id, prev_id, next_id, first_txn_id, height, cert_bytes}`
/// (spec.md §3, "Block node").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockNode {
    pub block_id: Id,
    pub prev_id: Id,
    pub next_id: Id,
    pub first_txn_id: Id,
    pub height: u64,
    pub cert_bytes: Vec<u8>,
}

impl BlockNode {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(72 + self.cert_bytes.len());
        out.extend_from_slice(&self.block_id);
        out.extend_from_slice(&self.prev_id);
        out.extend_from_slice(&self.next_id);
        out.extend_from_slice(&self.first_txn_id);
        let mut tail = [0u8; 16];
        BigEndian::write_u64(&mut tail[0..8], self.height);
        BigEndian::write_u64(&mut tail[8..16], self.cert_bytes.len() as u64);
        out.extend_from_slice(&tail);
        out.extend_from_slice(&self.cert_bytes);
        out
    }

    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < 80 {
            return Err(CoreError::status(ServiceTag::DataService, 0x0012));
        }
        let mut pos = 0usize;
        let block_id = read_id(buf, &mut pos);
        let prev_id = read_id(buf, &mut pos);
        let next_id = read_id(buf, &mut pos);
        let first_txn_id = read_id(buf, &mut pos);
        let height = read_u64(buf, &mut pos);
        let cert_size = read_u64(buf, &mut pos) as usize;
        if buf.len() != pos + cert_size {
            return Err(CoreError::status(ServiceTag::DataService, 0x0012));
        }
        let cert_bytes = buf[pos..].to_vec();
        Ok(Self {
            block_id,
            prev_id,
            next_id,
            first_txn_id,
            height,
            cert_bytes,
        })
    }
}

/// `txn_id -> (block_id, position)` (spec.md §3, "Canonized-transaction
/// index").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonizedIndexEntry {
    pub block_id: Id,
    pub position: u64,
}

impl CanonizedIndexEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 24];
        out[0..16].copy_from_slice(&self.block_id);
        BigEndian::write_u64(&mut out[16..24], self.position);
        out
    }

    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() != 24 {
            return Err(CoreError::status(ServiceTag::DataService, 0x0013));
        }
        let mut pos = 0usize;
        let block_id = read_id(buf, &mut pos);
        let position = read_u64(buf, &mut pos);
        Ok(Self { block_id, position })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_node_round_trips() {
        let node = TxnNode {
            txn_id: [1u8; 16],
            prev_id: [2u8; 16],
            next_id: [3u8; 16],
            artifact_id: [4u8; 16],
            block_id: ZERO_ID,
            state: TxnState::Submitted.to_u32(),
            cert_bytes: vec![9, 9, 9],
        };
        let bytes = node.encode();
        assert_eq!(TxnNode::decode(&bytes).unwrap(), node);
        assert!(node.is_queued());
    }

    #[test]
    fn block_node_round_trips() {
        let block = BlockNode {
            block_id: [5u8; 16],
            prev_id: [6u8; 16],
            next_id: ZERO_ID,
            first_txn_id: [7u8; 16],
            height: 42,
            cert_bytes: vec![1, 2, 3, 4],
        };
        let bytes = block.encode();
        assert_eq!(BlockNode::decode(&bytes).unwrap(), block);
    }

    #[test]
    fn artifact_record_round_trips() {
        let artifact = ArtifactRecord {
            artifact_id: [8u8; 16],
            txn_first: [1u8; 16],
            txn_latest: [2u8; 16],
            height_first: 1,
            height_latest: 5,
            state_latest: TxnState::Canonized.to_u32(),
        };
        let bytes = artifact.encode();
        assert_eq!(ArtifactRecord::decode(&bytes).unwrap(), artifact);
    }

    #[test]
    fn canonized_index_entry_round_trips() {
        let entry = CanonizedIndexEntry {
            block_id: [9u8; 16],
            position: 3,
        };
        let bytes = entry.encode();
        assert_eq!(CanonizedIndexEntry::decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn truncated_txn_node_is_rejected() {
        assert!(TxnNode::decode(&[0u8; 10]).is_err());
    }
}
