//! Per-connection socket context (spec.md §3, "IPC socket context").
//!
//! Wraps a `tokio_util::codec::Framed` stream — itself backed by an
//! internal read buffer and write buffer — so that ownership and teardown
//! are explicit, per spec.md §9's "Manual lifetime discipline on IPC
//! contexts": a socket context is uniquely owned by its reactor and callers
//! only ever hold a handle, never the raw stream.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::CoreResult;
use crate::reactor::ExitFlag;

/// Owns one connection's framed stream. `dispose` drops the underlying
/// transport, discarding any half-written bytes still in the write buffer
/// (spec.md §4.B "Cancellation": half-sent writes are discarded on
/// disposal).
pub struct SocketContext<T, C> {
    framed: Option<Framed<T, C>>,
    exit: ExitFlag,
}

impl<T, C> SocketContext<T, C>
where
    T: AsyncRead + AsyncWrite + Unpin,
    C: Decoder + Unpin,
    C::Error: Into<crate::error::CoreError>,
{
    pub fn new(transport: T, codec: C, exit: ExitFlag) -> Self {
        Self {
            framed: Some(Framed::new(transport, codec)),
            exit,
        }
    }

    /// Reads one frame. Returns `Ok(None)` on clean EOF, which callers treat
    /// as an `ERROR`/EOF event and respond with orderly teardown (spec.md
    /// §4.B).
    pub async fn read_frame(&mut self) -> CoreResult<Option<C::Item>>
    where
        C::Item: Sized,
    {
        use futures::StreamExt;
        if self.exit.is_set() {
            return Ok(None);
        }
        let framed = self.framed.as_mut().expect("socket context already disposed");
        match framed.next().await {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Writes one frame. Only ever called when the write buffer has
    /// capacity; `Framed::send` arms the underlying `WRITE` readiness
    /// itself and disarms once flushed, matching spec.md §4.B's `WRITE`
    /// event description.
    pub async fn write_frame<Item>(&mut self, item: Item) -> CoreResult<()>
    where
        C: Encoder<Item>,
        <C as Encoder<Item>>::Error: Into<crate::error::CoreError>,
    {
        use futures::SinkExt;
        if self.exit.is_set() {
            return Ok(());
        }
        let framed = self.framed.as_mut().expect("socket context already disposed");
        framed.send(item).await.map_err(Into::into)
    }

    /// Tears the context down: drops the framed transport, discarding
    /// anything left unsent.
    pub fn dispose(&mut self) {
        self.framed = None;
    }

    pub fn is_disposed(&self) -> bool {
        self.framed.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{DataPacket, PacketCodec};
    use tokio::io::duplex;

    #[tokio::test]
    async fn read_write_round_trip_over_duplex_pipe() {
        let (a, b) = duplex(4096);
        let exit = ExitFlag::new();
        let mut writer = SocketContext::new(a, PacketCodec, exit.clone());
        let mut reader = SocketContext::new(b, PacketCodec, exit);

        writer.write_frame(DataPacket::uint32(42)).await.unwrap();
        let got = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(got, DataPacket::uint32(42));
    }

    #[tokio::test]
    async fn dispose_prevents_further_reads() {
        let (a, _b) = duplex(4096);
        let exit = ExitFlag::new();
        let mut ctx = SocketContext::new(a, PacketCodec, exit);
        ctx.dispose();
        assert!(ctx.is_disposed());
    }

    #[tokio::test]
    async fn exit_flag_short_circuits_reads() {
        let (a, b) = duplex(4096);
        let exit = ExitFlag::new();
        let mut writer = SocketContext::new(a, PacketCodec, exit.clone());
        writer.write_frame(DataPacket::uint32(1)).await.unwrap();
        let mut reader = SocketContext::new(b, PacketCodec, exit.clone());
        exit.set();
        assert!(reader.read_frame().await.unwrap().is_none());
    }
}
