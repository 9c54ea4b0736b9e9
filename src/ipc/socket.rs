//! # Socketpair transport between real processes.
//!
//! ```text
//! supervisor                                  child (fd 3)
//!   Outbound ── sendmsg(json [, SCM_RIGHTS]) ──► reader task ──► inbox
//!   inbox ◄── reader task ◄── sendmsg(json) ──── Outbound
//! ```
//!
//! ## Rules
//! - `SOCK_SEQPACKET` keeps message boundaries: one datagram is one JSON message.
//! - A message larger than [`MAX_DATAGRAM`] is rejected at the sender.
//! - A connection handle is duplicated into the peer by the kernel; the sender's
//!   copy is closed once `sendmsg` returns.
//! - End of stream (zero-length read) or a socket error ends the inbox.
//! - Dropping a whole [`Endpoint`] closes its socket, so the peer sees end of stream.
//! - Undecodable datagrams are logged and skipped; any handles they carried are closed.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use async_trait::async_trait;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Endpoint, Envelope, INBOX_CAPACITY, Message, Outbound};
use crate::error::IpcError;

/// Largest encoded message accepted on the wire.
pub const MAX_DATAGRAM: usize = 64 * 1024;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

/// Creates a connected pair; both ends are close-on-exec and non-blocking.
pub fn pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )?;
    for fd in [&a, &b] {
        set_cloexec(fd.as_raw_fd(), true)?;
        set_nonblocking(fd.as_raw_fd())?;
    }
    Ok((a, b))
}

/// Wraps one end of a pair into an [`Endpoint`]. Must run inside a tokio runtime.
pub fn endpoint(fd: OwnedFd) -> io::Result<Endpoint> {
    set_cloexec(fd.as_raw_fd(), true)?;
    set_nonblocking(fd.as_raw_fd())?;
    let fd = Arc::new(AsyncFd::new(fd)?);

    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    tokio::spawn(read_loop(fd.clone(), inbox_tx));

    Ok(Endpoint {
        tx: Arc::new(SocketOutbound { fd }),
        rx: inbox_rx,
    })
}

pub(crate) fn set_cloexec(fd: RawFd, on: bool) -> nix::Result<()> {
    let mut flags = FdFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, on);
    fcntl(fd, FcntlArg::F_SETFD(flags)).map(drop)
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let mut flags = OFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFL)?);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map(drop)
}

struct SocketOutbound {
    fd: Arc<AsyncFd<OwnedFd>>,
}

#[async_trait]
impl Outbound for SocketOutbound {
    async fn send(&self, envelope: Envelope) -> Result<(), IpcError> {
        let bytes = serde_json::to_vec(&envelope.message)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(IpcError::Oversized(bytes.len()));
        }
        let handle: Option<OwnedFd> = envelope.connection.map(OwnedFd::from);
        let rights: Vec<RawFd> = handle.iter().map(AsRawFd::as_raw_fd).collect();
        let scm = [ControlMessage::ScmRights(&rights)];
        let cmsgs: &[ControlMessage<'_>] = if rights.is_empty() { &[] } else { &scm };

        loop {
            let mut guard = self.fd.writable().await?;
            let sent = guard.try_io(|inner| {
                let iov = [IoSlice::new(&bytes)];
                sendmsg::<()>(inner.as_raw_fd(), &iov, cmsgs, SEND_FLAGS, None)
                    .map_err(io::Error::from)
            });
            match sent {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => return Err(IpcError::Closed),
                Ok(Err(e)) => return Err(IpcError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// One received datagram: payload length plus any handles it carried.
type Datagram = (usize, Vec<OwnedFd>);

async fn read_loop(fd: Arc<AsyncFd<OwnedFd>>, inbox: mpsc::Sender<Envelope>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = inbox.closed() => {
                debug!("inbox dropped, closing the channel");
                break;
            }
            ready = fd.readable() => match ready {
                Ok(mut guard) => match guard.try_io(|inner| recv_one(inner.as_raw_fd(), &mut buf)) {
                    Ok(res) => res,
                    Err(_would_block) => continue,
                },
                Err(e) => Err(e),
            },
        };

        let (len, mut handles) = match received {
            Ok(Some(datagram)) => datagram,
            Ok(None) => {
                debug!("peer closed the channel");
                break;
            }
            Err(e) => {
                warn!(error = %e, "channel read failed, treating as closed");
                break;
            }
        };

        let message = match serde_json::from_slice::<Message>(&buf[..len]) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, handles = handles.len(), "dropping undecodable message");
                continue;
            }
        };
        let connection = if handles.is_empty() {
            None
        } else {
            Some(TcpStream::from(handles.swap_remove(0)))
        };
        if inbox.send(Envelope { message, connection }).await.is_err() {
            break;
        }
    }
}

fn recv_one(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<Datagram>> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut space = nix::cmsg_space!([RawFd; 4]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut space), RECV_FLAGS)?;
    if msg.bytes == 0 {
        return Ok(None);
    }

    let mut handles = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            for raw in raw {
                // SAFETY: the kernel installed `raw` into this process for us alone.
                let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                set_cloexec(owned.as_raw_fd(), true)?;
                handles.push(owned);
            }
        }
    }
    Ok(Some((msg.bytes, handles)))
}
