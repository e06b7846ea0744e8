//! Blocking IPC stand-in for a [`crate::dataservice::engine::DataServiceEngine`],
//! used by processes that reach the storage engine only across a fork
//! boundary (spec.md §2: the canonization service and its data-service
//! instance are separate privilege domains, joined only by the request
//! dispatcher, component E).
//!
//! Speaks the same plain `DataPacket` framing every other control channel
//! uses (spec.md §4.A), carrying [`crate::dataservice::dispatcher::Request`]
//! bytes as its payload. A blocking `std::os::unix::net::UnixStream` is
//! used rather than the async reactor because one canonization wakeup's
//! worth of calls is a short, bounded request/response sequence against a
//! peer on the same host.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use byteorder::{BigEndian, ByteOrder};

use crate::capability::CapabilitySet;
use crate::dataservice::dispatcher::Method;
use crate::dataservice::engine::Engine;
use crate::dataservice::records::{BlockNode, Id, TxnNode};
use crate::error::{CoreError, CoreResult, ErrorCode};

const DATA_PACKET_TYPE: u8 = 0x20;

fn io_err(context: &str, e: std::io::Error) -> CoreError {
    CoreError::Fatal(anyhow::anyhow!("{context}: {e}"))
}

fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> CoreResult<()> {
    let mut header = [0u8; 5];
    header[0] = DATA_PACKET_TYPE;
    BigEndian::write_u32(&mut header[1..5], payload.len() as u32);
    stream.write_all(&header).map_err(|e| io_err("write frame header", e))?;
    stream.write_all(payload).map_err(|e| io_err("write frame body", e))?;
    Ok(())
}

fn read_frame(stream: &mut UnixStream) -> CoreResult<Vec<u8>> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).map_err(|e| io_err("read frame header", e))?;
    let size = BigEndian::read_u32(&header[1..5]) as usize;
    let mut payload = vec![0u8; size];
    stream.read_exact(&mut payload).map_err(|e| io_err("read frame body", e))?;
    Ok(payload)
}

/// A connection to a data-service process's control channel, speaking the
/// request dispatcher's wire protocol (spec.md §4.E).
pub struct RemoteEngineClient {
    stream: UnixStream,
}

impl RemoteEngineClient {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    fn call(&mut self, method: Method, child_idx: u32, body: &[u8]) -> CoreResult<Vec<u8>> {
        let mut request = vec![0u8; 8 + body.len()];
        BigEndian::write_u32(&mut request[0..4], method as u32);
        BigEndian::write_u32(&mut request[4..8], child_idx);
        request[8..].copy_from_slice(body);
        write_frame(&mut self.stream, &request)?;

        let response = read_frame(&mut self.stream)?;
        // `method_id || offset || status || body` (spec.md §4.E).
        if response.len() < 12 {
            return Err(CoreError::from(crate::error::RESPONSE_PACKET_INVALID_SIZE));
        }
        let status = BigEndian::read_u32(&response[8..12]);
        if status != ErrorCode::SUCCESS {
            return Err(ErrorCode::from_wire(status)
                .map(CoreError::from)
                .unwrap_or_else(|| CoreError::Fatal(anyhow::anyhow!("unrecognized status {status:#x}"))));
        }
        Ok(response[12..].to_vec())
    }
}

impl Engine for RemoteEngineClient {
    fn create_child(&mut self, mask: &CapabilitySet) -> CoreResult<u32> {
        let words = mask.to_words();
        let mut body = vec![0u8; words.len() * 4];
        for (i, w) in words.iter().enumerate() {
            BigEndian::write_u32(&mut body[i * 4..i * 4 + 4], *w);
        }
        let resp = self.call(Method::ChildContextCreate, 0, &body)?;
        if resp.len() < 4 {
            return Err(CoreError::from(crate::error::RESPONSE_PACKET_INVALID_SIZE));
        }
        Ok(BigEndian::read_u32(&resp[0..4]))
    }

    fn close_child(&mut self, index: u32) -> CoreResult<()> {
        self.call(Method::ChildContextClose, index, &[])?;
        Ok(())
    }

    fn transaction_walk(&mut self, child_idx: u32, limit: usize) -> CoreResult<Vec<TxnNode>> {
        // Mirrors `DataServiceEngine::transaction_walk`'s head-to-tail
        // traversal (spec.md §4.F step 2), but over the wire: one
        // `TRANSACTION_GET_FIRST` to find the head, then one `TRANSACTION_GET`
        // per subsequent node, stopping at the sentinel id rather than
        // fetching it (the sentinel isn't a real queued transaction).
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }

        let first = match self.call(Method::TransactionGetFirst, child_idx, &[]) {
            Ok(bytes) => TxnNode::decode(&bytes)?,
            Err(CoreError::Status(code)) if code == crate::error::NOT_FOUND => return Ok(out),
            Err(e) => return Err(e),
        };
        let mut cursor = first.next_id;
        out.push(first);

        while cursor != crate::dataservice::records::QUEUE_SENTINEL_ID && out.len() < limit {
            let resp = self.call(Method::TransactionGet, child_idx, &cursor)?;
            let node = TxnNode::decode(&resp)?;
            cursor = node.next_id;
            out.push(node);
        }
        Ok(out)
    }

    fn latest_block_id_get(&mut self, child_idx: u32) -> CoreResult<Id> {
        let resp = self.call(Method::LatestBlockIdGet, child_idx, &[])?;
        if resp.len() != 16 {
            return Err(CoreError::from(crate::error::RESPONSE_PACKET_INVALID_SIZE));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&resp);
        Ok(id)
    }

    fn block_get(&mut self, child_idx: u32, block_id: Id) -> CoreResult<BlockNode> {
        let resp = self.call(Method::BlockGet, child_idx, &block_id)?;
        BlockNode::decode(&resp)
    }

    fn block_make(&mut self, child_idx: u32, cert_bytes: Vec<u8>) -> CoreResult<()> {
        self.call(Method::BlockMake, child_idx, &cert_bytes)?;
        Ok(())
    }

    fn transaction_submit(
        &mut self,
        child_idx: u32,
        txn_id: Id,
        artifact_id: Id,
        cert_bytes: Vec<u8>,
    ) -> CoreResult<()> {
        let mut body = Vec::with_capacity(32 + cert_bytes.len());
        body.extend_from_slice(&txn_id);
        body.extend_from_slice(&artifact_id);
        body.extend_from_slice(&cert_bytes);
        self.call(Method::TransactionSubmit, child_idx, &body)?;
        Ok(())
    }

    fn block_id_by_height_get(&mut self, child_idx: u32, height: u64) -> CoreResult<Id> {
        let mut body = [0u8; 8];
        BigEndian::write_u64(&mut body, height);
        let resp = self.call(Method::BlockIdByHeightGet, child_idx, &body)?;
        if resp.len() != 16 {
            return Err(CoreError::from(crate::error::RESPONSE_PACKET_INVALID_SIZE));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&resp);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::dataservice::dispatcher;
    use crate::dataservice::engine::DataServiceEngine;

    fn spawn_dataservice(mut engine: DataServiceEngine, mut server: UnixStream) {
        std::thread::spawn(move || loop {
            let request_bytes = match read_frame(&mut server) {
                Ok(bytes) => bytes,
                Err(_) => return,
            };
            let request = match dispatcher::Request::decode(&request_bytes) {
                Ok(r) => r,
                Err(_) => return,
            };
            let response = match dispatcher::dispatch(&mut engine, &request) {
                Ok(bytes) => bytes,
                Err(_) => return,
            };
            if write_frame(&mut server, &response).is_err() {
                return;
            }
        });
    }

    #[test]
    fn remote_client_walks_a_queued_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = DataServiceEngine::open(&dir.path().join("store.redb")).unwrap();
        let setup_child = engine.create_child(&CapabilitySet::all()).unwrap();
        let txn_id = [11u8; 16];
        let artifact_id = [12u8; 16];
        engine
            .transaction_submit(setup_child, txn_id, artifact_id, vec![9, 9])
            .unwrap();
        engine.close_child(setup_child).unwrap();

        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        spawn_dataservice(engine, server_sock);

        let mut client = RemoteEngineClient::new(client_sock);
        let mask = crate::canonization::canonization_caps();
        let child = client.create_child(&mask).unwrap();
        let queued = client.transaction_walk(child, 10).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].txn_id, txn_id);
        client.close_child(child).unwrap();
    }
}
