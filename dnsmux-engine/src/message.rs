//! The in-flight request record
//!
//! A [`Message`] is created by a listener when a query arrives and moves,
//! by value, through the service's deferred queue into the connector's
//! pending table. The raw query bytes travel with it; the first two bytes
//! of the buffer always hold the transaction id that is correct for the
//! channel the buffer is about to cross.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::listener::Listener;

/// One DNS query in flight through the proxy
pub struct Message {
    buffer: Vec<u8>,
    server_id: u16,
    client_id: u16,
    source: SocketAddr,
    origin: Arc<Listener>,
    timestamp: Instant,
}

impl Message {
    /// Wrap a received datagram. The buffer must already be truncated to
    /// the datagram length and hold at least a DNS header.
    pub fn new(buffer: Vec<u8>, source: SocketAddr, origin: Arc<Listener>) -> Box<Self> {
        debug_assert!(buffer.len() >= crate::MIN_MESSAGE_SIZE);
        let server_id = u16::from_be_bytes([buffer[0], buffer[1]]);
        Box::new(Self {
            buffer,
            server_id,
            client_id: 0,
            source,
            origin,
            timestamp: Instant::now(),
        })
    }

    /// The transaction id chosen by the downstream client
    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    /// The transaction id this proxy chose toward upstream
    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    /// Assign the upstream id and rewrite the wire bytes to match
    pub fn set_client_id(&mut self, id: u16) {
        self.client_id = id;
        self.buffer[0..2].copy_from_slice(&id.to_be_bytes());
    }

    /// The DNS payload as it should appear on the wire right now
    pub fn payload(&self) -> &[u8] {
        &self.buffer
    }

    /// Address the query came from, for the reply
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// The listener that received the query
    pub fn origin(&self) -> &Arc<Listener> {
        &self.origin
    }

    /// When the query was dispatched upstream
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Stamp the dispatch time, called once the upstream write completes
    pub fn mark_sent(&mut self) {
        self.timestamp = Instant::now();
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("server_id", &self.server_id)
            .field("client_id", &self.client_id)
            .field("source", &self.source)
            .field("len", &self.buffer.len())
            .finish()
    }
}
