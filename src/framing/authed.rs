//! Authenticated-packet framing (spec.md §4.A).
//!
//! `type(=0x30) || size(4B BE) || mac[mac_len] || ciphertext[size]`, with the
//! 5-byte header itself stream-cipher encrypted under the receiver-expected
//! IV and the MAC covering `(encrypted header) || ciphertext`.
//!
//! Grounded on the teacher's `events::noise` wrapper
//! (`NoiseWrapper`/`TransportWrapper` in `events/noise/mod.rs`): same shape
//! (a per-connection keyed session wrapping a codec), but the spec's own
//! simpler stream-cipher-plus-MAC discipline replaces the Noise handshake.
//! `sodiumoxide` supplies the primitives, mirroring the teacher's own
//! (feature-gated) `exonum_sodiumoxide` dependency.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use sodiumoxide::crypto::{auth, stream::chacha20};
use subtle::ConstantTimeEq;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CoreError, CoreResult, ServiceTag};
use crate::framing::MAX_PACKET_SIZE;

const HEADER_LEN: usize = 5;
const MAC_LEN: usize = auth::TAGBYTES;
const AUTHED_TYPE: u8 = 0x30;

/// Which side of a connection a [`SessionKeys`] IV counter belongs to.
/// Client streams start odd (`1`); server streams start with the high bit
/// set (`0x8000_0000_0000_0001`), per spec.md §4.A's "Direction discipline".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirection {
    Client,
    Server,
}

impl SessionDirection {
    pub fn initial_iv(self) -> u64 {
        match self {
            Self::Client => 1,
            Self::Server => 0x8000_0000_0000_0001,
        }
    }
}

/// Derived per-session key material plus the two independent, strictly
/// monotonically increasing IV counters (spec.md §8, invariant 4).
#[derive(Debug, Clone)]
pub struct SessionKeys {
    stream_key: chacha20::Key,
    mac_key: auth::Key,
    send_iv: u64,
    recv_iv: u64,
}

impl SessionKeys {
    /// Derive stream-cipher and MAC keys from a shared secret established
    /// during the handshake (spec.md §3, "Authed session state").
    /// `local` is this side's direction; its IV starts accordingly, and the
    /// peer's expected IV starts at the other direction's initial value.
    pub fn derive(shared_secret: &[u8; 32], local: SessionDirection) -> Self {
        let stream_key = chacha20::Key::from_slice(shared_secret)
            .expect("chacha20 key is 32 bytes, matching the shared secret width");

        let mut mac_seed = Vec::with_capacity(shared_secret.len() + 8);
        mac_seed.extend_from_slice(shared_secret);
        mac_seed.extend_from_slice(b"agentd-mac-key");
        let mac_digest = sodiumoxide::crypto::hash::sha256::hash(&mac_seed);
        let mac_key = auth::Key::from_slice(mac_digest.as_ref())
            .expect("sha256 digest is 32 bytes, matching the auth key width");

        let (send_iv, recv_iv) = match local {
            SessionDirection::Client => (
                SessionDirection::Client.initial_iv(),
                SessionDirection::Server.initial_iv(),
            ),
            SessionDirection::Server => (
                SessionDirection::Server.initial_iv(),
                SessionDirection::Client.initial_iv(),
            ),
        };

        Self {
            stream_key,
            mac_key,
            send_iv,
            recv_iv,
        }
    }

    fn nonce_for(iv: u64) -> chacha20::Nonce {
        let mut bytes = [0u8; 8];
        BigEndian::write_u64(&mut bytes, iv);
        chacha20::Nonce::from_slice(&bytes).expect("chacha20 nonce is 8 bytes, matching the IV width")
    }

    fn keystream(&self, iv: u64, len: usize) -> Vec<u8> {
        chacha20::stream(len, &Self::nonce_for(iv), &self.stream_key)
    }

    pub fn send_iv(&self) -> u64 {
        self.send_iv
    }

    pub fn recv_iv(&self) -> u64 {
        self.recv_iv
    }

    /// The derived MAC key, exposed so the handshake can verify the
    /// `HANDSHAKE_ACK` short-MAC with the same key this session's authed
    /// framing uses (spec.md §4.G row 2).
    pub fn mac_key(&self) -> &auth::Key {
        &self.mac_key
    }
}

fn xor_in_place(data: &mut [u8], keystream: &[u8]) {
    for (b, k) in data.iter_mut().zip(keystream.iter()) {
        *b ^= k;
    }
}

/// `tokio_util::codec::{Decoder, Encoder}` implementation for authed
/// packets. Holds the session's live IV counters, incrementing each on
/// every successful read or write (spec.md §4.A step 7, §8 invariant 4).
#[derive(Debug)]
pub struct AuthedCodec {
    pub keys: SessionKeys,
}

impl AuthedCodec {
    pub fn new(keys: SessionKeys) -> Self {
        Self { keys }
    }
}

impl Decoder for AuthedCodec {
    type Item = Vec<u8>;
    type Error = CoreError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HEADER_LEN + MAC_LEN {
            return Ok(None);
        }

        let iv = self.keys.recv_iv;
        let header_ks = self.keys.keystream(iv, HEADER_LEN);
        let mut header = buf[..HEADER_LEN].to_vec();
        xor_in_place(&mut header, &header_ks);

        if header[0] != AUTHED_TYPE {
            return Err(CoreError::from(crate::error::UNAUTHORIZED_PACKET));
        }
        let size = BigEndian::read_u32(&header[1..5]) as usize;
        if size > MAX_PACKET_SIZE {
            return Err(CoreError::from(crate::error::UNAUTHORIZED_PACKET));
        }

        let total = HEADER_LEN + MAC_LEN + size;
        if buf.len() < total {
            return Ok(None);
        }

        let received_mac = &buf[HEADER_LEN..HEADER_LEN + MAC_LEN];
        let ciphertext = buf[HEADER_LEN + MAC_LEN..total].to_vec();

        let enc_header = &buf[..HEADER_LEN];
        let mut mac_input = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        mac_input.extend_from_slice(enc_header);
        mac_input.extend_from_slice(&ciphertext);
        let expected_tag = auth::authenticate(&mac_input, &self.keys.mac_key);

        // Constant-time comparison: any single-bit flip in the ciphertext or
        // MAC must fail identically (spec.md §8, "Authed framing").
        let matches: bool = expected_tag.as_ref().ct_eq(received_mac).into();
        if !matches {
            return Err(CoreError::from(crate::error::UNAUTHORIZED_PACKET));
        }

        let full_ks = self.keys.keystream(iv, HEADER_LEN + size);
        let mut plaintext = ciphertext;
        xor_in_place(&mut plaintext, &full_ks[HEADER_LEN..]);

        buf.advance(total);
        self.keys.recv_iv = self
            .keys
            .recv_iv
            .checked_add(1)
            .ok_or_else(|| CoreError::from(crate::error::UNAUTHORIZED_PACKET))?;
        Ok(Some(plaintext))
    }
}

impl Encoder<Vec<u8>> for AuthedCodec {
    type Error = CoreError;

    fn encode(&mut self, payload: Vec<u8>, buf: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > MAX_PACKET_SIZE {
            return Err(CoreError::from(crate::error::UNAUTHORIZED_PACKET));
        }
        let iv = self.keys.send_iv;

        let mut header = [0u8; HEADER_LEN];
        header[0] = AUTHED_TYPE;
        BigEndian::write_u32(&mut header[1..5], payload.len() as u32);

        let ks = self.keys.keystream(iv, HEADER_LEN + payload.len());
        let mut enc_header = header.to_vec();
        xor_in_place(&mut enc_header, &ks[..HEADER_LEN]);
        let mut ciphertext = payload;
        xor_in_place(&mut ciphertext, &ks[HEADER_LEN..]);

        let mut mac_input = Vec::with_capacity(enc_header.len() + ciphertext.len());
        mac_input.extend_from_slice(&enc_header);
        mac_input.extend_from_slice(&ciphertext);
        let tag = auth::authenticate(&mac_input, &self.keys.mac_key);

        buf.reserve(enc_header.len() + MAC_LEN + ciphertext.len());
        buf.put_slice(&enc_header);
        buf.put_slice(tag.as_ref());
        buf.put_slice(&ciphertext);

        self.keys.send_iv = self
            .keys
            .send_iv
            .checked_add(1)
            .ok_or_else(|| CoreError::status(ServiceTag::Ipc, 0x0006))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_codecs() -> (AuthedCodec, AuthedCodec) {
        let secret = [7u8; 32];
        let client_keys = SessionKeys::derive(&secret, SessionDirection::Client);
        let server_keys = SessionKeys::derive(&secret, SessionDirection::Server);
        (AuthedCodec::new(client_keys), AuthedCodec::new(server_keys))
    }

    #[test]
    fn round_trips_plaintext() {
        let (mut client, mut server) = paired_codecs();
        let mut buf = BytesMut::new();
        client.encode(b"hello server".to_vec(), &mut buf).unwrap();
        let decoded = server.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, b"hello server".to_vec());
    }

    #[test]
    fn ivs_increase_monotonically() {
        let (mut client, mut server) = paired_codecs();
        let mut buf = BytesMut::new();
        client.encode(b"one".to_vec(), &mut buf).unwrap();
        server.decode(&mut buf).unwrap().unwrap();
        client.encode(b"two".to_vec(), &mut buf).unwrap();
        server.decode(&mut buf).unwrap().unwrap();
        assert!(client.keys.send_iv > SessionDirection::Client.initial_iv());
        assert_eq!(server.keys.recv_iv, client.keys.send_iv);
    }

    #[test]
    fn bit_flip_in_ciphertext_is_rejected() {
        let (mut client, mut server) = paired_codecs();
        let mut buf = BytesMut::new();
        client.encode(b"hello server".to_vec(), &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        let err = server.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CoreError::Status(code) if code == crate::error::UNAUTHORIZED_PACKET));
    }

    #[test]
    fn bit_flip_in_mac_is_rejected() {
        let (mut client, mut server) = paired_codecs();
        let mut buf = BytesMut::new();
        client.encode(b"hello server".to_vec(), &mut buf).unwrap();
        buf[HEADER_LEN] ^= 0x01;
        assert!(server.decode(&mut buf).is_err());
    }

    #[test]
    fn partial_packet_returns_would_block() {
        let (mut client, mut server) = paired_codecs();
        let mut buf = BytesMut::new();
        client.encode(b"hello server".to_vec(), &mut buf).unwrap();
        let mut truncated = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(server.decode(&mut truncated).unwrap().is_none());
    }
}
