//! Sans-IO abstractions over the datagram socket and the clock, so
//! [`Transport`](super::Transport) can be driven deterministically in tests
//! without touching a real network or the wall clock.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    time::Instant,
};

/// Minimal non-blocking datagram socket interface.
///
/// A call that would block must return `Err` with
/// [`io::ErrorKind::WouldBlock`], matching [`std::net::UdpSocket`]'s own
/// contract when put in non-blocking mode - this lets [`Transport::poll`]
/// drain all currently-available datagrams without an async runtime.
pub trait DatagramSocket {
    /// Sends `buf` to `addr`.
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Reads one datagram into `buf`, returning its length and sender.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Local address this socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Source of monotonic time, injected so tests can advance time under their
/// own control instead of sleeping in real time.
pub trait Clock {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by the real OS monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
