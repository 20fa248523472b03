//! End-to-end scenarios run over a `flume`-backed mock socket instead of a
//! real UDP socket, following the same channel-as-transport pattern the
//! teacher's in-memory backend uses. Each side runs its own `Transport` on
//! its own thread so `send_reliable`'s blocking poll loop has someone to
//! actually exchange packets with.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use swarmlink::transport::socket::{Clock, DatagramSocket, SystemClock};
use swarmlink::{Transport, TransportConfig};

struct MockSocket {
    local: SocketAddr,
    tx: flume::Sender<(SocketAddr, Vec<u8>)>,
    rx: flume::Receiver<(SocketAddr, Vec<u8>)>,
}

impl DatagramSocket for MockSocket {
    fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<usize> {
        self.tx
            .send((self.local, buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))?;
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.rx.try_recv() {
            Ok((from, data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), from))
            }
            Err(flume::TryRecvError::Empty | flume::TryRecvError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "no datagram ready"))
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

fn mock_pair(client: SocketAddr, server: SocketAddr) -> (MockSocket, MockSocket) {
    let (c2s_tx, c2s_rx) = flume::unbounded();
    let (s2c_tx, s2c_rx) = flume::unbounded();
    (
        MockSocket {
            local: client,
            tx: c2s_tx,
            rx: s2c_rx,
        },
        MockSocket {
            local: server,
            tx: s2c_tx,
            rx: c2s_rx,
        },
    )
}

fn addrs() -> (SocketAddr, SocketAddr) {
    (
        "10.0.0.1:4000".parse().unwrap(),
        "10.0.0.2:4000".parse().unwrap(),
    )
}

/// Runs `transport.poll()` in a loop on a background thread until `stop` is
/// signalled, standing in for a long-lived event loop driving a real peer.
fn spawn_poll_loop(
    mut transport: Transport<MockSocket, SystemClock>,
    stop: Arc<Mutex<bool>>,
) -> thread::JoinHandle<Transport<MockSocket, SystemClock>> {
    thread::spawn(move || {
        while !*stop.lock().unwrap() {
            transport.poll();
            thread::sleep(Duration::from_millis(1));
        }
        transport
    })
}

#[test]
fn small_reliable_send_is_delivered_once() {
    let (client_addr, server_addr) = addrs();
    let (client_sock, server_sock) = mock_pair(client_addr, server_addr);

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_in_handler = received.clone();

    let mut server = Transport::new(server_sock, SystemClock, TransportConfig::default());
    server.register_receive_handler(move |from, bytes| {
        received_in_handler.lock().unwrap().push((from, bytes));
    });
    server.start();

    let stop = Arc::new(Mutex::new(false));
    let server_handle = spawn_poll_loop(server, stop.clone());

    let mut client = Transport::new(client_sock, SystemClock, TransportConfig::default());
    client.start();
    client
        .send_reliable(server_addr, Bytes::from_static(b"hello swarmlink"), Duration::from_secs(5))
        .expect("reliable send should be acknowledged");

    *stop.lock().unwrap() = true;
    server_handle.join().unwrap();

    let received = received.lock().unwrap();
    assert_eq!(1, received.len());
    assert_eq!(client_addr, received[0].0);
    assert_eq!(b"hello swarmlink".as_slice(), &received[0].1[..]);
}

#[test]
fn fragmented_reliable_send_is_reassembled_in_order() {
    let (client_addr, server_addr) = addrs();
    let (client_sock, server_sock) = mock_pair(client_addr, server_addr);

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_in_handler = received.clone();

    let mut config = TransportConfig::default();
    config.mtu = 64; // force fragmentation of anything bigger than a few dozen bytes

    let mut server = Transport::new(server_sock, SystemClock, config.clone());
    server.register_receive_handler(move |_from, bytes| {
        received_in_handler.lock().unwrap().push(bytes);
    });
    server.start();

    let stop = Arc::new(Mutex::new(false));
    let server_handle = spawn_poll_loop(server, stop.clone());

    let mut client = Transport::new(client_sock, SystemClock, config);
    client.start();
    let big_message = Bytes::from(vec![0xABu8; 2000]);
    client
        .send_reliable(server_addr, big_message.clone(), Duration::from_secs(5))
        .expect("large reliable send should complete via fragmentation");

    *stop.lock().unwrap() = true;
    server_handle.join().unwrap();

    let received = received.lock().unwrap();
    assert_eq!(1, received.len());
    assert_eq!(big_message, received[0]);
}

#[test]
fn unreliable_send_requires_no_handshake() {
    let (client_addr, server_addr) = addrs();
    let (client_sock, server_sock) = mock_pair(client_addr, server_addr);

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_in_handler = received.clone();

    let mut server = Transport::new(server_sock, SystemClock, TransportConfig::default());
    server.register_receive_handler(move |_from, bytes| {
        received_in_handler.lock().unwrap().push(bytes);
    });
    server.start();

    let mut client = Transport::new(client_sock, SystemClock, TransportConfig::default());
    client.start();
    client
        .send_unreliable(server_addr, Bytes::from_static(b"fire and forget"))
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while received.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
        server.poll();
        thread::sleep(Duration::from_millis(1));
    }

    let received = received.lock().unwrap();
    assert_eq!(1, received.len());
    assert_eq!(b"fire and forget".as_slice(), &received[0][..]);
}

#[test]
fn reliable_send_to_unreachable_peer_times_out() {
    let (client_addr, server_addr) = addrs();
    let (client_sock, _server_sock) = mock_pair(client_addr, server_addr);
    // server_sock is dropped: nothing will ever answer the handshake.

    let mut client = Transport::new(client_sock, SystemClock, TransportConfig::default());
    client.start();
    let result = client.send_reliable(
        server_addr,
        Bytes::from_static(b"hello"),
        Duration::from_millis(200),
    );
    assert!(result.is_err(), "send to an unreachable peer must not hang forever");
}

#[test]
fn system_clock_advances_with_wall_time() {
    let clock = SystemClock;
    let first = clock.now();
    thread::sleep(Duration::from_millis(5));
    assert!(clock.now() > first);
}
