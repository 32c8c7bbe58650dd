//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Frame`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::packet::{Frame, PacketError, BUFFER_SIZE};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    Io(std::io::Error),
    /// The received datagram could not be decoded as a frame.
    Packet(PacketError),
}

impl SocketError {
    /// `true` if the next receive may well succeed: a malformed datagram, or
    /// an ICMP error some platforms report on unconnected UDP sockets.
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Self::Packet(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::Interrupted
            ),
        }
    }
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "socket I/O error: {e}"),
            Self::Packet(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<std::io::Error> for SocketError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<PacketError> for SocketError {
    fn from(e: PacketError) -> Self {
        Self::Packet(e)
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, frame-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared (behind an `Arc`)
/// between the session loop and its heartbeat task.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        Self::from_tokio(inner)
    }

    /// Wrap an already bound socket.
    pub fn from_tokio(inner: UdpSocket) -> Result<Self, SocketError> {
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Encode `frame` and send it as a single datagram to `dest`.
    pub async fn send_to(&self, frame: &Frame, dest: SocketAddr) -> Result<(), SocketError> {
        self.send_raw(&frame.encode(), dest).await
    }

    /// Send already-encoded bytes (used to repeat an exact transmission).
    pub async fn send_raw(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        self.inner.send_to(bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Frame`].
    ///
    /// Returns `(frame, sender_address)`.  Datagrams that fail to decode are
    /// returned as `Err(SocketError::Packet)` and the caller decides whether to
    /// keep reading.  Cancel-safe: dropping the future loses no datagram.
    pub async fn recv_from(&self) -> Result<(Frame, SocketAddr), SocketError> {
        let mut buf = [0u8; BUFFER_SIZE];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let frame = Frame::decode(&buf[..n])?;
        Ok((frame, addr))
    }
}
