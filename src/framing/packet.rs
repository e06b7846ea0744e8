//! Plain `DataPacket` framing: `type(1B) || size(4B BE) || payload[size]`
//! (spec.md §4.A).
//!
//! Modeled on the teacher's `events::codec::MessagesCodec`
//! (`Decoder`/`Encoder` pair driving a `tokio_util::codec::Framed` stream),
//! generalized from one fixed Noise-wrapped message type to the full typed
//! packet set the spec calls out.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CoreError, CoreResult, ServiceTag};
use crate::framing::MAX_PACKET_SIZE;

/// Recognized packet type tags (spec.md §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Bom = 0x00,
    Uint8 = 0x01,
    Uint32 = 0x03,
    Uint64 = 0x04,
    Int8 = 0x09,
    Int32 = 0x0A,
    Int64 = 0x0B,
    String = 0x10,
    Data = 0x20,
    Authed = 0x30,
    Eom = 0xFF,
}

impl DataType {
    fn from_u8(v: u8) -> CoreResult<Self> {
        Ok(match v {
            0x00 => Self::Bom,
            0x01 => Self::Uint8,
            0x03 => Self::Uint32,
            0x04 => Self::Uint64,
            0x09 => Self::Int8,
            0x0A => Self::Int32,
            0x0B => Self::Int64,
            0x10 => Self::String,
            0x20 => Self::Data,
            0x30 => Self::Authed,
            0xFF => Self::Eom,
            _ => return Err(CoreError::status(ServiceTag::Ipc, 0x0004)),
        })
    }

    /// Fixed payload length for fixed-size types, or `None` for
    /// variable-length types (`STRING`, `DATA`, `AUTHED`, `BOM`, `EOM`).
    fn fixed_len(self) -> Option<usize> {
        match self {
            Self::Uint8 | Self::Int8 => Some(1),
            Self::Uint32 | Self::Int32 => Some(4),
            Self::Uint64 | Self::Int64 => Some(8),
            Self::Bom | Self::Eom => Some(0),
            Self::String | Self::Data | Self::Authed => None,
        }
    }
}

/// A decoded plain data packet: its type tag plus raw payload bytes.
///
/// Fixed-width integer types are still carried as payload bytes here; call
/// sites that need the typed value decode the payload themselves (e.g. via
/// `byteorder`), mirroring the teacher's practice of keeping the codec
/// ignorant of message semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub kind: DataType,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn new(kind: DataType, payload: Vec<u8>) -> CoreResult<Self> {
        if let Some(expected) = kind.fixed_len() {
            if payload.len() != expected {
                return Err(CoreError::status(ServiceTag::Ipc, 0x0005));
            }
        }
        Ok(Self { kind, payload })
    }

    pub fn uint32(v: u32) -> Self {
        let mut payload = vec![0u8; 4];
        BigEndian::write_u32(&mut payload, v);
        Self {
            kind: DataType::Uint32,
            payload,
        }
    }

    pub fn uint64(v: u64) -> Self {
        let mut payload = vec![0u8; 8];
        BigEndian::write_u64(&mut payload, v);
        Self {
            kind: DataType::Uint64,
            payload,
        }
    }

    pub fn string(s: &str) -> Self {
        Self {
            kind: DataType::String,
            payload: s.as_bytes().to_vec(),
        }
    }

    pub fn data(bytes: Vec<u8>) -> Self {
        Self {
            kind: DataType::Data,
            payload: bytes,
        }
    }

    pub fn eom() -> Self {
        Self {
            kind: DataType::Eom,
            payload: Vec::new(),
        }
    }

    pub fn as_u32(&self) -> CoreResult<u32> {
        if self.kind != DataType::Uint32 {
            return Err(CoreError::status(ServiceTag::Ipc, 0x0004));
        }
        Ok(BigEndian::read_u32(&self.payload))
    }

    pub fn as_u64(&self) -> CoreResult<u64> {
        if self.kind != DataType::Uint64 {
            return Err(CoreError::status(ServiceTag::Ipc, 0x0004));
        }
        Ok(BigEndian::read_u64(&self.payload))
    }
}

/// `tokio_util::codec::{Decoder, Encoder}` implementation for the plain
/// packet stream. Returns `Ok(None)` ("would block") when fewer bytes than
/// a full packet are buffered, exactly matching spec.md §4.B's "parsing
/// functions return WOULD_BLOCK ... and leave the buffer position
/// unchanged" by relying on `Decoder`'s own no-consume-on-`None` contract.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = DataPacket;
    type Error = CoreError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let type_byte = buf[0];
        let size = BigEndian::read_u32(&buf[1..5]) as usize;
        if size > MAX_PACKET_SIZE {
            return Err(CoreError::status(ServiceTag::Ipc, 0x0005));
        }
        if buf.len() < 5 + size {
            return Ok(None);
        }

        let kind = DataType::from_u8(type_byte)?;
        buf.advance(5);
        let payload = buf.split_to(size).to_vec();
        Ok(Some(DataPacket::new(kind, payload)?))
    }
}

impl Encoder<DataPacket> for PacketCodec {
    type Error = CoreError;

    fn encode(&mut self, packet: DataPacket, buf: &mut BytesMut) -> Result<(), Self::Error> {
        if packet.payload.len() > MAX_PACKET_SIZE {
            return Err(CoreError::status(ServiceTag::Ipc, 0x0005));
        }
        buf.reserve(5 + packet.payload.len());
        buf.put_u8(packet.kind as u8);
        buf.put_u32(packet.payload.len() as u32);
        buf.put_slice(&packet.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: DataPacket) {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec.encode(packet.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trips_every_fixed_type() {
        round_trip(DataPacket::uint32(17));
        round_trip(DataPacket::uint64(0x8000_0000_0000_0001));
        round_trip(DataPacket::new(DataType::Int8, vec![0xFF]).unwrap());
        round_trip(DataPacket::eom());
    }

    #[test]
    fn round_trips_variable_types() {
        round_trip(DataPacket::string("hello"));
        round_trip(DataPacket::data(vec![1, 2, 3, 4, 5]));
        round_trip(DataPacket::data(vec![]));
    }

    #[test]
    fn partial_packet_returns_would_block() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec.encode(DataPacket::string("hello"), &mut buf).unwrap();
        let mut truncated = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut truncated).unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(DataType::Data as u8);
        buf.put_u32((MAX_PACKET_SIZE + 1) as u32);
        let mut codec = PacketCodec;
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn unrecognized_type_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x42);
        buf.put_u32(0);
        let mut codec = PacketCodec;
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn wrong_fixed_size_is_rejected() {
        let err = DataPacket::new(DataType::Uint32, vec![0u8; 3]);
        assert!(err.is_err());
    }
}
