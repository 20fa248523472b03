//! `swarmlink` is a reliable, ordered, flow- and congestion-controlled
//! packet transport over an unreliable datagram substrate, plus a
//! best-effort unreliable mode on the same wire format.
//!
//! The core is sans-IO: [`conn::Connection`] and [`frag::Reassembler`] never
//! touch a socket directly. [`transport::Transport`] binds them to a
//! caller-supplied [`transport::socket::DatagramSocket`] and
//! [`transport::socket::Clock`], which makes the whole stack runnable
//! against a real [`std::net::UdpSocket`] or a channel-backed fake in tests
//! without an async runtime.
//!
//! ```no_run
//! use std::net::UdpSocket;
//! use bytes::Bytes;
//! use swarmlink::{Transport, TransportConfig};
//!
//! # fn main() -> std::io::Result<()> {
//! let socket = UdpSocket::bind("0.0.0.0:0")?;
//! socket.set_nonblocking(true)?;
//! let mut transport = Transport::new(socket, swarmlink::transport::socket::SystemClock, TransportConfig::default());
//! transport.start();
//!
//! let peer = "127.0.0.1:9001".parse().unwrap();
//! transport.send_reliable(peer, Bytes::from_static(b"hello"), std::time::Duration::from_secs(5)).ok();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conn;
pub mod error;
pub mod flow;
pub mod frag;
pub mod packet;
pub mod stats;
pub mod tcp;
pub mod transport;

pub use config::TransportConfig;
pub use error::{ConnectionError, FragmentError, PacketError, SendError};
pub use stats::{ConnectionStats, Stats};
pub use transport::Transport;
