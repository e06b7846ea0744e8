//! TCP accept fan-out and peer-fd hand-off to the protocol service
//! (spec.md §4.G: "For each `accept()` it immediately hands the peer fd to
//! the protocol service over a `SOCK_DGRAM` Unix control channel
//! (SCM_RIGHTS-style fd passing). The listener does not own connection
//! state.").
//!
//! Grounded on the teacher's own raw-socket plumbing in
//! `network/src/lib.rs`'s `NetworkPart` accept loop, generalized from a
//! single in-process peer table to an out-of-process hand-off since here
//! the listener and the protocol service are separate privilege domains.

use std::net::TcpListener as StdTcpListener;
use std::os::unix::io::RawFd;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoVec;
use tokio::net::TcpListener;

use crate::error::{CoreError, CoreResult, ServiceTag};

/// Sends one open descriptor to `control_sock` as ancillary data, with a
/// single placeholder byte as the regular payload (`SCM_RIGHTS` requires at
/// least one byte of ordinary data to ride along).
pub fn send_fd(control_sock: RawFd, fd: RawFd) -> CoreResult<()> {
    let payload = [0u8];
    let iov = [IoVec::from_slice(&payload)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg(control_sock, &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("sendmsg(SCM_RIGHTS): {e}")))?;
    Ok(())
}

/// Receives one descriptor from `control_sock`, blocking until the listener
/// hands one over or the channel closes.
pub fn recv_fd(control_sock: RawFd) -> CoreResult<RawFd> {
    let mut payload = [0u8; 1];
    let iov = [IoVec::from_mut_slice(&mut payload)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg(control_sock, &iov, Some(&mut cmsg_space), MsgFlags::empty())
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("recvmsg(SCM_RIGHTS): {e}")))?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.into_iter().next() {
                return Ok(fd);
            }
        }
    }
    Err(CoreError::status(ServiceTag::Protocol, 0x0010))
}

/// Owns the accept sockets inherited from the supervisor (already bound as
/// root, before privileges were dropped) and the control channel used to
/// pass accepted peer fds to the protocol service.
pub struct ListenerService {
    listeners: Vec<TcpListener>,
    control_sock: RawFd,
}

impl ListenerService {
    /// Wraps inherited raw TCP listener fds (already `bind`+`listen`ed by
    /// the supervisor) as tokio listeners, plus the control socket fd used
    /// to forward accepted connections.
    pub fn from_inherited(listen_fds: &[RawFd], control_sock: RawFd) -> CoreResult<Self> {
        use std::os::unix::io::FromRawFd;

        let mut listeners = Vec::with_capacity(listen_fds.len());
        for &fd in listen_fds {
            let std_listener = unsafe { StdTcpListener::from_raw_fd(fd) };
            std_listener
                .set_nonblocking(true)
                .map_err(|e| CoreError::Fatal(anyhow::anyhow!("set_nonblocking: {e}")))?;
            let listener = TcpListener::from_std(std_listener)
                .map_err(|e| CoreError::Fatal(anyhow::anyhow!("TcpListener::from_std: {e}")))?;
            listeners.push(listener);
        }
        Ok(Self {
            listeners,
            control_sock,
        })
    }

    /// Accepts on whichever inherited socket becomes ready first and hands
    /// the peer's fd to the protocol service, repeating until the exit flag
    /// trips. Does not itself read or write any connection bytes (spec.md
    /// §4.G, "The listener does not own connection state").
    pub async fn run(&mut self, exit: crate::reactor::ExitFlag) -> CoreResult<()> {
        use std::os::unix::io::IntoRawFd;

        loop {
            if exit.is_set() {
                return Ok(());
            }
            let accepted = {
                let mut futures = Vec::with_capacity(self.listeners.len());
                for listener in &self.listeners {
                    futures.push(listener.accept());
                }
                let (result, _index, _rest) = futures::future::select_all(futures).await;
                result
            };
            match accepted {
                Ok((stream, _peer_addr)) => {
                    let std_stream = stream
                        .into_std()
                        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("into_std: {e}")))?;
                    let fd = std_stream.into_raw_fd();
                    send_fd(self.control_sock, fd)?;
                    // The receiving side now owns `fd`; the listener's local
                    // handle to it (`std_stream`) has already been consumed
                    // by `into_raw_fd`, so nothing here closes it twice.
                }
                Err(e) => {
                    log::warn!("listener: accept failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn fd_round_trips_over_control_socket() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .unwrap();

        let dummy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dummy_fd = dummy.as_raw_fd();

        send_fd(a, dummy_fd).unwrap();
        let received = recv_fd(b).unwrap();
        assert!(received >= 0);

        let _ = nix::unistd::close(a);
        let _ = nix::unistd::close(b);
        let _ = nix::unistd::close(received);
    }
}
