//! Shared harness for the end-to-end tests: a real proxy instance wired
//! to a scripted mock upstream over loopback sockets.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::op::{Message as DnsMessage, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use dnsmux_engine::{Config, Endpoint, IdSource, Listener, Service};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Id source that replays a fixed script, then falls back to a counter
pub struct ScriptedIds {
    script: std::vec::IntoIter<u16>,
    fallback: u16,
}

impl ScriptedIds {
    pub fn new(script: Vec<u16>) -> Self {
        Self {
            script: script.into_iter(),
            fallback: 0x4000,
        }
    }
}

impl IdSource for ScriptedIds {
    fn next_id(&mut self) -> u16 {
        match self.script.next() {
            Some(id) => id,
            None => {
                self.fallback = self.fallback.wrapping_add(1);
                self.fallback
            }
        }
    }
}

/// A proxy under test plus the mock upstream it forwards to
pub struct Harness {
    pub proxy_addr: SocketAddr,
    pub upstream: TcpListener,
}

impl Harness {
    /// Start a proxy with default timing and random ids
    pub async fn start() -> Self {
        Self::start_with(None, Duration::from_secs(60)).await
    }

    /// Start a proxy with a scripted id sequence
    pub async fn start_with_ids(ids: Vec<u16>) -> Self {
        Self::start_with(Some(ids), Duration::from_secs(60)).await
    }

    /// Start a proxy with a scripted id sequence and a short request TTL
    pub async fn start_with(ids: Option<Vec<u16>>, time_to_live: Duration) -> Self {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let config = Config {
            bind_udp: Vec::new(),
            connect_tcp: vec![Endpoint::new(
                upstream_addr.ip().to_string(),
                Some(upstream_addr.port()),
            )],
            time_to_live,
            max_deferred: 1024,
        };
        let service = match ids {
            Some(ids) => Service::with_id_source(config, Box::new(ScriptedIds::new(ids))),
            None => Service::new(config),
        };

        let listener = Listener::bind(&Endpoint::new("127.0.0.1", Some(0)))
            .await
            .unwrap();
        let proxy_addr = listener.local_addr();
        tokio::spawn(listener.run(service));

        Self {
            proxy_addr,
            upstream,
        }
    }

    /// Wait for the proxy to open its upstream connection
    pub async fn accept(&self) -> TcpStream {
        let (stream, _) = timeout(TIMEOUT, self.upstream.accept())
            .await
            .expect("proxy never connected upstream")
            .unwrap();
        stream
    }
}

/// A downstream client socket bound to loopback
pub async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

/// Build a well-formed DNS query with the given transaction id
pub fn dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut message = DnsMessage::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    message.to_vec().unwrap()
}

/// Turn a forwarded request frame into a reply frame: same id, QR bit set
pub fn dns_reply_for(request: &[u8]) -> Vec<u8> {
    let mut reply = request.to_vec();
    reply[2] |= 0x80;
    reply
}

/// Read one length-prefixed DNS message from the stream
pub async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut len_buf = [0u8; 2];
    timeout(TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .expect("timed out reading frame length")
        .unwrap();
    let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    timeout(TIMEOUT, stream.read_exact(&mut body))
        .await
        .expect("timed out reading frame body")
        .unwrap();
    body
}

/// Write one length-prefixed DNS message to the stream
pub async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();
}

/// Receive one datagram, failing the test after the shared timeout
pub async fn recv_udp(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 4096];
    let (n, _) = timeout(TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    buf[..n].to_vec()
}

/// Assert that no datagram arrives within the given window
pub async fn expect_no_datagram(socket: &UdpSocket, window: Duration) {
    let mut buf = [0u8; 4096];
    assert!(
        timeout(window, socket.recv_from(&mut buf)).await.is_err(),
        "unexpected datagram received"
    );
}

/// The id on the wire in the first two bytes of a DNS message
pub fn wire_id(message: &[u8]) -> u16 {
    u16::from_be_bytes([message[0], message[1]])
}
