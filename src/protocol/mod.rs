//! Protocol/listener façade (spec.md §4.G).
//!
//! The listener half (accept-and-hand-off over an `SCM_RIGHTS`-style
//! control channel) is a thin supervisor/reactor wiring concern covered
//! by [`crate::supervisor`]; this module is the protocol service's own
//! handshake state machine and authed request dispatch, one instance per
//! client connection.

use byteorder::{BigEndian, ByteOrder};
use sodiumoxide::crypto::{auth, box_, hash::sha256};
use subtle::ConstantTimeEq;

use crate::capability::{Capability, CapabilitySet};
use crate::dataservice::Engine;
#[cfg(test)]
use crate::dataservice::DataServiceEngine;
use crate::error::{CoreError, CoreResult};
use crate::framing::{SessionDirection, SessionKeys};

const NONCE_LEN: usize = 32;

/// spec.md §6, "Client protocol over TCP": method ids carried in an
/// authed request's first 4 bytes once the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientMethod {
    HandshakeInitiate = 0x0000_0000,
    HandshakeAcknowledge = 0x0000_0001,
    LatestBlockGet = 0x0000_0002,
    TransactionSubmit = 0x0000_0003,
    BlockByIdGet = 0x0000_0004,
    BlockIdGetNext = 0x0000_0005,
    Close = 0x0000_FFFF,
}

impl ClientMethod {
    fn from_u32(v: u32) -> CoreResult<Self> {
        Ok(match v {
            0x0000_0000 => Self::HandshakeInitiate,
            0x0000_0001 => Self::HandshakeAcknowledge,
            0x0000_0002 => Self::LatestBlockGet,
            0x0000_0003 => Self::TransactionSubmit,
            0x0000_0004 => Self::BlockByIdGet,
            0x0000_0005 => Self::BlockIdGetNext,
            0x0000_FFFF => Self::Close,
            _ => return Err(CoreError::from(crate::error::UNEXPECTED_METHOD_CODE)),
        })
    }
}

/// `HANDSHAKE_INITIATE{proto, suite, entity_id, client_key_nonce(32),
/// client_challenge_nonce(32)}` (spec.md §4.G state table).
#[derive(Debug, Clone)]
pub struct HandshakeInitiate {
    pub proto: u8,
    pub suite: u8,
    pub entity_id: Vec<u8>,
    pub client_public_key: [u8; 32],
    pub client_challenge_nonce: [u8; 32],
}

impl HandshakeInitiate {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 4 + self.entity_id.len() + 64);
        out.push(self.proto);
        out.push(self.suite);
        let mut len_buf = [0u8; 4];
        BigEndian::write_u32(&mut len_buf, self.entity_id.len() as u32);
        out.extend_from_slice(&len_buf);
        out.extend_from_slice(&self.entity_id);
        out.extend_from_slice(&self.client_public_key);
        out.extend_from_slice(&self.client_challenge_nonce);
        out
    }

    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < 2 + 4 {
            return Err(CoreError::from(crate::error::REQUEST_PACKET_INVALID_SIZE));
        }
        let proto = buf[0];
        let suite = buf[1];
        let entity_len = BigEndian::read_u32(&buf[2..6]) as usize;
        let mut pos = 6usize;
        if buf.len() < pos + entity_len + NONCE_LEN * 2 {
            return Err(CoreError::from(crate::error::REQUEST_PACKET_INVALID_SIZE));
        }
        let entity_id = buf[pos..pos + entity_len].to_vec();
        pos += entity_len;
        let mut client_public_key = [0u8; 32];
        client_public_key.copy_from_slice(&buf[pos..pos + NONCE_LEN]);
        pos += NONCE_LEN;
        let mut client_challenge_nonce = [0u8; 32];
        client_challenge_nonce.copy_from_slice(&buf[pos..pos + NONCE_LEN]);
        Ok(Self {
            proto,
            suite,
            entity_id,
            client_public_key,
            client_challenge_nonce,
        })
    }
}

/// Unauthenticated handshake response: `server_id, server_public_key,
/// server_challenge_nonce[32], offset=0, status=0`.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub server_id: Vec<u8>,
    pub server_public_key: [u8; 32],
    pub server_challenge_nonce: [u8; 32],
    pub status: u32,
}

impl HandshakeResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.server_id.len() + 64 + 8);
        let mut len_buf = [0u8; 4];
        BigEndian::write_u32(&mut len_buf, self.server_id.len() as u32);
        out.extend_from_slice(&len_buf);
        out.extend_from_slice(&self.server_id);
        out.extend_from_slice(&self.server_public_key);
        out.extend_from_slice(&self.server_challenge_nonce);
        let mut tail = [0u8; 8];
        BigEndian::write_u32(&mut tail[0..4], 0); // offset, always 0 per spec.md §4.G
        BigEndian::write_u32(&mut tail[4..8], self.status);
        out.extend_from_slice(&tail);
        out
    }

    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < 4 {
            return Err(CoreError::from(crate::error::RESPONSE_PACKET_INVALID_SIZE));
        }
        let id_len = BigEndian::read_u32(&buf[0..4]) as usize;
        let mut pos = 4usize;
        if buf.len() < pos + id_len + NONCE_LEN * 2 + 8 {
            return Err(CoreError::from(crate::error::RESPONSE_PACKET_INVALID_SIZE));
        }
        let server_id = buf[pos..pos + id_len].to_vec();
        pos += id_len;
        let mut server_public_key = [0u8; 32];
        server_public_key.copy_from_slice(&buf[pos..pos + NONCE_LEN]);
        pos += NONCE_LEN;
        let mut server_challenge_nonce = [0u8; 32];
        server_challenge_nonce.copy_from_slice(&buf[pos..pos + NONCE_LEN]);
        pos += NONCE_LEN;
        let status = BigEndian::read_u32(&buf[pos + 4..pos + 8]);
        Ok(Self {
            server_id,
            server_public_key,
            server_challenge_nonce,
            status,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Init,
    KeyExchanged,
    Acked,
    Closed,
}

/// Caps granted to a connection's child context once it reaches `ACKED`
/// (spec.md §4.G row 3: dispatch authed requests "via its own child
/// context"). Deliberately narrower than the canonization service's mask:
/// a TCP client may read the chain and submit transactions, never make
/// blocks or touch settings.
pub fn client_request_caps() -> CapabilitySet {
    CapabilitySet::from_bits(&{
        let mut bits = vec![false; crate::capability::CAPABILITY_BITS];
        for cap in [
            Capability::LatestBlockIdRead,
            Capability::BlockRead,
            Capability::BlockIdByHeightRead,
            Capability::TransactionSubmit,
            Capability::TransactionGet,
        ] {
            bits[cap as usize] = true;
        }
        bits
    })
}

/// Per-connection handshake + authed dispatch state (spec.md §4.G).
pub struct ProtocolConnection {
    state: HandshakeState,
    session: Option<SessionKeys>,
    server_challenge_nonce: Option<[u8; 32]>,
    child_idx: Option<u32>,
}

impl ProtocolConnection {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Init,
            session: None,
            server_challenge_nonce: None,
            child_idx: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == HandshakeState::Closed
    }

    /// INIT → KEY_EXCHANGED: derives the shared secret from an ephemeral
    /// X25519 keypair and the client's public key, mirroring the teacher's
    /// own `exonum_sodiumoxide`-backed noise handshake but replacing the
    /// Noise pattern with the spec's own challenge/MAC discipline.
    pub fn handle_initiate(
        &mut self,
        request: &HandshakeInitiate,
        server_id: &[u8],
    ) -> CoreResult<HandshakeResponse> {
        if self.state != HandshakeState::Init {
            return Err(CoreError::from(crate::error::UNEXPECTED_METHOD_CODE));
        }
        if request.proto != 1 {
            return Err(CoreError::from(crate::error::MALFORMED_PAYLOAD_DATA));
        }

        let (server_pk, server_sk) = box_::gen_keypair();
        let client_pk = box_::PublicKey::from_slice(&request.client_public_key)
            .ok_or_else(|| CoreError::from(crate::error::MALFORMED_PAYLOAD_DATA))?;

        let shared_secret = derive_shared_secret(&server_sk, &client_pk);
        self.session = Some(SessionKeys::derive(&shared_secret, SessionDirection::Server));

        let mut server_challenge_nonce = [0u8; 32];
        let random_bytes = crate::random::os_entropy(32)
            .map_err(|e| CoreError::Fatal(anyhow::anyhow!(e)))?;
        server_challenge_nonce.copy_from_slice(&random_bytes);
        self.server_challenge_nonce = Some(server_challenge_nonce);
        self.state = HandshakeState::KeyExchanged;

        Ok(HandshakeResponse {
            server_id: server_id.to_vec(),
            server_public_key: server_pk.0,
            server_challenge_nonce,
            status: crate::error::ErrorCode::SUCCESS,
        })
    }

    /// KEY_EXCHANGED → ACKED: verifies the client's authed `HANDSHAKE_ACK`
    /// MAC over the server challenge nonce (spec.md §4.G row 2).
    pub fn handle_ack(&mut self, mac_bytes: &[u8]) -> CoreResult<()> {
        if self.state != HandshakeState::KeyExchanged {
            return Err(CoreError::from(crate::error::UNEXPECTED_METHOD_CODE));
        }
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| CoreError::from(crate::error::AUTHENTICATION_FAILURE))?;
        let challenge = self
            .server_challenge_nonce
            .ok_or_else(|| CoreError::from(crate::error::AUTHENTICATION_FAILURE))?;

        let expected = auth::authenticate(&challenge, session.mac_key());
        let matches: bool = expected.as_ref().ct_eq(mac_bytes).into();
        if !matches {
            return Err(CoreError::from(crate::error::AUTHENTICATION_FAILURE));
        }
        self.state = HandshakeState::Acked;
        Ok(())
    }

    pub fn session(&self) -> Option<&SessionKeys> {
        self.session.as_ref()
    }

    /// ACKED: dispatches one decoded authed request to the data service,
    /// lazily creating this connection's child context on first use. Generic
    /// over [`Engine`] so a protocol process can hold either an in-process
    /// engine or a [`crate::dataservice::RemoteEngineClient`] talking to a
    /// sibling data-service process (spec.md §2's privilege separation).
    ///
    /// Mirrors `dispatcher::dispatch`'s fatal/non-fatal split: a Protocol or
    /// Authorization error (spec.md §7) is reported back as an in-band
    /// status and the connection stays open for the peer to decide what to
    /// do next; only `CoreError::Fatal` and the Authentication category
    /// (`UNAUTHORIZED_PACKET`, `AUTHENTICATION_FAILURE`) propagate and force
    /// the caller to tear the connection down.
    pub fn dispatch<E: Engine>(&mut self, engine: &mut E, payload: &[u8]) -> CoreResult<Vec<u8>> {
        match self.run_dispatch(engine, payload) {
            Ok(response) => Ok(response),
            Err(err) if err.is_fatal() || err.is_connection_terminal() => Err(err),
            Err(err) => {
                let raw_method = if payload.len() >= 4 {
                    BigEndian::read_u32(&payload[0..4])
                } else {
                    0
                };
                Ok(response_header(raw_method, err.to_wire()))
            }
        }
    }

    fn run_dispatch<E: Engine>(&mut self, engine: &mut E, payload: &[u8]) -> CoreResult<Vec<u8>> {
        if self.state != HandshakeState::Acked {
            return Err(CoreError::from(crate::error::UNEXPECTED_METHOD_CODE));
        }
        if payload.len() < 4 {
            return Err(CoreError::from(crate::error::REQUEST_PACKET_INVALID_SIZE));
        }
        let method = ClientMethod::from_u32(BigEndian::read_u32(&payload[0..4]))?;
        if method == ClientMethod::Close {
            self.state = HandshakeState::Closed;
            return Ok(response_header(method as u32, crate::error::ErrorCode::SUCCESS));
        }

        let child = match self.child_idx {
            Some(idx) => idx,
            None => {
                let idx = engine.create_child(&client_request_caps())?;
                self.child_idx = Some(idx);
                idx
            }
        };

        let body = &payload[4..];
        match method {
            ClientMethod::LatestBlockGet => {
                let id = engine.latest_block_id_get(child)?;
                Ok(response_with_body(method as u32, &id))
            }
            ClientMethod::TransactionSubmit => {
                if body.len() < 32 {
                    return Err(CoreError::from(crate::error::REQUEST_PACKET_BAD));
                }
                let mut txn_id = [0u8; 16];
                txn_id.copy_from_slice(&body[0..16]);
                let mut artifact_id = [0u8; 16];
                artifact_id.copy_from_slice(&body[16..32]);
                engine.transaction_submit(child, txn_id, artifact_id, body[32..].to_vec())?;
                Ok(response_header(method as u32, crate::error::ErrorCode::SUCCESS))
            }
            ClientMethod::BlockByIdGet => {
                if body.len() < 16 {
                    return Err(CoreError::from(crate::error::REQUEST_PACKET_BAD));
                }
                let mut block_id = [0u8; 16];
                block_id.copy_from_slice(&body[0..16]);
                let block = engine.block_get(child, block_id)?;
                Ok(response_with_body(method as u32, &block.encode()))
            }
            ClientMethod::BlockIdGetNext => {
                if body.len() < 8 {
                    return Err(CoreError::from(crate::error::REQUEST_PACKET_BAD));
                }
                let height = BigEndian::read_u64(&body[0..8]);
                let id = engine.block_id_by_height_get(child, height + 1)?;
                Ok(response_with_body(method as u32, &id))
            }
            ClientMethod::HandshakeInitiate
            | ClientMethod::HandshakeAcknowledge
            | ClientMethod::Close => Err(CoreError::from(crate::error::UNEXPECTED_METHOD_CODE)),
        }
    }
}

impl Default for ProtocolConnection {
    fn default() -> Self {
        Self::new()
    }
}

fn derive_shared_secret(server_sk: &box_::SecretKey, client_pk: &box_::PublicKey) -> [u8; 32] {
    // `box_`'s keypairs are raw X25519 scalars/points; scalar-multiplying
    // them directly gives the same Diffie-Hellman shared point `box_`
    // itself uses internally, hashed here since the raw point is not
    // uniformly random.
    use sodiumoxide::crypto::scalarmult::curve25519::{scalarmult, GroupElement, Scalar};
    let scalar = Scalar::from_slice(server_sk.as_ref())
        .expect("box_ secret key is 32 bytes, matching a curve25519 scalar");
    let point = GroupElement::from_slice(client_pk.as_ref())
        .expect("box_ public key is 32 bytes, matching a curve25519 group element");
    let shared_point = scalarmult(&scalar, &point).expect("curve25519 scalarmult of valid points");
    let digest = sha256::hash(shared_point.as_ref());
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// `method_id || offset || status` (spec.md §4.E), no body. Client requests
/// carry no byte-range of their own, so `offset` is always 0 here, same as
/// `dataservice::dispatcher`'s responses.
fn response_header(method: u32, status: u32) -> Vec<u8> {
    let mut out = vec![0u8; 12];
    BigEndian::write_u32(&mut out[0..4], method);
    BigEndian::write_u32(&mut out[4..8], 0);
    BigEndian::write_u32(&mut out[8..12], status);
    out
}

fn response_with_body(method: u32, body: &[u8]) -> Vec<u8> {
    let mut out = response_header(method, crate::error::ErrorCode::SUCCESS);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::authed::AuthedCodec;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    fn client_keypair() -> (box_::PublicKey, box_::SecretKey) {
        box_::gen_keypair()
    }

    #[test]
    fn handshake_scenario_five_completes() {
        // spec.md §8 end-to-end scenario 5.
        let mut conn = ProtocolConnection::new();
        let (client_pk, client_sk) = client_keypair();
        let initiate = HandshakeInitiate {
            proto: 1,
            suite: 1,
            entity_id: b"client-1".to_vec(),
            client_public_key: client_pk.0,
            client_challenge_nonce: [0u8; 32],
        };
        let response = conn.handle_initiate(&initiate, b"server-1").unwrap();
        assert_eq!(response.status, crate::error::ErrorCode::SUCCESS);

        let server_pk = box_::PublicKey::from_slice(&response.server_public_key).unwrap();
        let shared = derive_shared_secret(&client_sk, &server_pk);
        let client_session = SessionKeys::derive(&shared, SessionDirection::Client);
        let mac = auth::authenticate(&response.server_challenge_nonce, client_session.mac_key());

        conn.handle_ack(mac.as_ref()).unwrap();
        assert!(matches!(conn.state, HandshakeState::Acked));
    }

    #[test]
    fn tampered_ack_mac_is_rejected() {
        // spec.md §8 end-to-end scenario 6, applied to the handshake ack.
        let mut conn = ProtocolConnection::new();
        let (client_pk, _client_sk) = client_keypair();
        let initiate = HandshakeInitiate {
            proto: 1,
            suite: 1,
            entity_id: b"client-1".to_vec(),
            client_public_key: client_pk.0,
            client_challenge_nonce: [0u8; 32],
        };
        conn.handle_initiate(&initiate, b"server-1").unwrap();
        let bad_mac = vec![0u8; auth::TAGBYTES];
        assert!(conn.handle_ack(&bad_mac).is_err());
    }

    #[test]
    fn handshake_request_round_trips() {
        let req = HandshakeInitiate {
            proto: 1,
            suite: 2,
            entity_id: b"abc".to_vec(),
            client_public_key: [9u8; 32],
            client_challenge_nonce: [8u8; 32],
        };
        let bytes = req.encode();
        let decoded = HandshakeInitiate::decode(&bytes).unwrap();
        assert_eq!(decoded.entity_id, req.entity_id);
        assert_eq!(decoded.client_public_key, req.client_public_key);
    }

    #[test]
    fn client_request_after_ack_uses_authed_framing() {
        let mut conn = ProtocolConnection::new();
        let (client_pk, client_sk) = client_keypair();
        let initiate = HandshakeInitiate {
            proto: 1,
            suite: 1,
            entity_id: b"client-1".to_vec(),
            client_public_key: client_pk.0,
            client_challenge_nonce: [0u8; 32],
        };
        let response = conn.handle_initiate(&initiate, b"server-1").unwrap();
        let server_pk = box_::PublicKey::from_slice(&response.server_public_key).unwrap();
        let shared = derive_shared_secret(&client_sk, &server_pk);
        let client_session = SessionKeys::derive(&shared, SessionDirection::Client);
        let mac = auth::authenticate(&response.server_challenge_nonce, client_session.mac_key());
        conn.handle_ack(mac.as_ref()).unwrap();

        let mut client_codec = AuthedCodec::new(client_session);
        let mut buf = BytesMut::new();
        let mut request_body = vec![0u8; 4];
        BigEndian::write_u32(&mut request_body, ClientMethod::LatestBlockGet as u32);
        client_codec.encode(request_body, &mut buf).unwrap();

        let mut server_codec = AuthedCodec::new(conn.session().unwrap().clone());
        let decrypted = server_codec.decode(&mut buf).unwrap().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut engine = DataServiceEngine::open(&dir.path().join("store.redb")).unwrap();
        let resp = conn.dispatch(&mut engine, &decrypted).unwrap();
        assert_eq!(BigEndian::read_u32(&resp[8..12]), crate::error::ErrorCode::SUCCESS);
    }
}
