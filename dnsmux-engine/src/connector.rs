//! Upstream TCP connector
//!
//! Owns the single TCP connection to the upstream resolver and the
//! request/response multiplexing state: a pending table keyed by the
//! rewritten transaction id and a FIFO expiry queue. Requests are
//! serialized onto the stream with the RFC 1035 two-byte length prefix;
//! replies are matched back by id in whatever order they arrive.
//!
//! The connector never reconnects. Any upstream I/O failure tears it
//! down and unregisters it from the service; the next query spawns a
//! fresh connector.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::message::Message;
use crate::service::Service;
use crate::MIN_MESSAGE_SIZE;

/// Upper bound on requests awaiting a reply; keeps the id-sampling loop
/// far away from exhausting the 16-bit id space
const MAX_PENDING: usize = 1024;

/// Requests sent upstream and awaiting a reply.
///
/// A message is in the id map iff its id is in the expiry queue; the only
/// mutators are [`insert`], [`remove`] and [`expire`], so call sites
/// cannot get the two collections out of step.
///
/// [`insert`]: PendingTable::insert
/// [`remove`]: PendingTable::remove
/// [`expire`]: PendingTable::expire
#[derive(Default)]
struct PendingTable {
    by_client_id: HashMap<u16, Box<Message>>,
    expiry: VecDeque<u16>,
}

impl PendingTable {
    fn len(&self) -> usize {
        self.by_client_id.len()
    }

    fn contains(&self, id: u16) -> bool {
        self.by_client_id.contains_key(&id)
    }

    fn insert(&mut self, msg: Box<Message>) {
        let id = msg.client_id();
        debug_assert!(!self.contains(id));
        self.expiry.push_back(id);
        self.by_client_id.insert(id, msg);
    }

    fn remove(&mut self, id: u16) -> Option<Box<Message>> {
        let msg = self.by_client_id.remove(&id)?;
        self.expiry.retain(|&queued| queued != id);
        Some(msg)
    }

    /// Drop every request dispatched at or before the cutoff. The expiry
    /// queue is in send order, so this only ever pops from the front.
    fn expire(&mut self, cutoff: Instant) -> usize {
        let mut dropped = 0;
        while let Some(&front) = self.expiry.front() {
            let stale = self
                .by_client_id
                .get(&front)
                .is_some_and(|msg| msg.timestamp() <= cutoff);
            if !stale {
                break;
            }
            self.expiry.pop_front();
            self.by_client_id.remove(&front);
            dropped += 1;
        }
        dropped
    }
}

/// The upstream-facing half of the proxy
pub struct Connector {
    service: Arc<Service>,
    /// Capacity-one slot: the request currently being serialized, or the
    /// one accepted while the previous write was still in flight
    slot: mpsc::Sender<Box<Message>>,
    pending: Mutex<PendingTable>,
    shutdown: broadcast::Sender<()>,
}

impl Connector {
    /// Create a connector and start its connect/send/receive tasks.
    /// Every task holds a strong reference, so the connector stays alive
    /// until all of its outstanding I/O has drained.
    pub(crate) fn spawn(service: Arc<Service>) -> Arc<Self> {
        let (slot, slot_rx) = mpsc::channel(1);
        let (shutdown, _) = broadcast::channel(1);
        let connector = Arc::new(Self {
            service,
            slot,
            pending: Mutex::new(PendingTable::default()),
            shutdown,
        });
        tokio::spawn(connector.clone().run(slot_rx));
        connector
    }

    /// Offer a request. Fails, handing the message back, when the send
    /// slot is occupied or the connector has already shut down.
    pub(crate) fn add_request(&self, msg: Box<Message>) -> Result<(), Box<Message>> {
        use mpsc::error::TrySendError;
        self.slot.try_send(msg).map_err(|e| match e {
            TrySendError::Full(m) | TrySendError::Closed(m) => m,
        })
    }

    async fn run(self: Arc<Self>, slot_rx: mpsc::Receiver<Box<Message>>) {
        let Some(endpoint) = self.service.config().upstream().cloned() else {
            error!("no upstream endpoint configured");
            self.reset().await;
            return;
        };
        let addr = match endpoint.resolve().await {
            Ok(addr) => addr,
            Err(e) => {
                error!("{}", e);
                self.reset().await;
                return;
            }
        };
        debug!("connecting to {}", addr);
        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("could not connect to {}: {}", addr, e);
                self.reset().await;
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            error!("could not configure upstream socket: {}", e);
            self.reset().await;
            return;
        }
        debug!("connected to {}", addr);

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(self.clone().read_loop(read_half));
        self.write_loop(write_half, slot_rx).await;
    }

    /// Send path: pull the next request, age out stale pending entries,
    /// pick a fresh upstream id, write one length-prefixed frame.
    async fn write_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut slot_rx: mpsc::Receiver<Box<Message>>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let ttl = self.service.config().time_to_live;
        loop {
            // the slot first, then the service's deferred queue, oldest first
            let mut msg = match slot_rx.try_recv() {
                Ok(msg) => msg,
                Err(_) => match self.service.unqueue().await {
                    Some(msg) => msg,
                    None => tokio::select! {
                        _ = shutdown.recv() => return,
                        received = slot_rx.recv() => match received {
                            Some(msg) => msg,
                            None => return,
                        },
                    },
                },
            };

            if let Some(cutoff) = Instant::now().checked_sub(ttl) {
                self.expire(cutoff).await;
            }

            let Some(client_id) = self.fresh_client_id().await else {
                warn!("pending table full, dropping request from {}", msg.source());
                continue;
            };
            msg.set_client_id(client_id);

            let written = tokio::select! {
                _ = shutdown.recv() => return,
                result = write_frame(&mut write_half, msg.payload()) => result,
            };
            match written {
                Err(e) => {
                    warn!("forwarding request failed: {}", e);
                    self.reset().await;
                    return;
                }
                Ok(()) => {
                    debug!("request forwarded with id {:#06x}", client_id);
                    msg.mark_sent();
                    self.pending.lock().await.insert(msg);
                }
            }
        }
    }

    /// Receive path: exactly one read outstanding. Two stages per frame,
    /// the length prefix and then the body. Framing errors tear the
    /// connection down; runt frames and unknown ids are logged and the
    /// reader stays armed.
    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let mut len_buf = [0u8; 2];
            let read = tokio::select! {
                _ = shutdown.recv() => return,
                result = read_half.read_exact(&mut len_buf) => result,
            };
            if let Err(e) = read {
                debug!("upstream connection closed: {}", e);
                self.reset().await;
                return;
            }

            let frame_len = u16::from_be_bytes(len_buf) as usize;
            let mut reply = vec![0u8; frame_len];
            let read = tokio::select! {
                _ = shutdown.recv() => return,
                result = read_half.read_exact(&mut reply) => result,
            };
            if let Err(e) = read {
                warn!("reply reception failed: {}", e);
                self.reset().await;
                return;
            }

            if frame_len < MIN_MESSAGE_SIZE {
                warn!("reply too small ({} bytes), ignoring", frame_len);
                continue;
            }

            let client_id = u16::from_be_bytes([reply[0], reply[1]]);
            let Some(msg) = self.pending.lock().await.remove(client_id) else {
                warn!("reply for unknown id {:#06x}, ignoring", client_id);
                continue;
            };
            debug!("reply received for id {:#06x}", client_id);
            reply[0..2].copy_from_slice(&msg.server_id().to_be_bytes());
            msg.origin().send_response(reply, msg.source());
        }
    }

    async fn expire(&self, cutoff: Instant) {
        let mut pending = self.pending.lock().await;
        let dropped = pending.expire(cutoff);
        if dropped > 0 {
            debug!("{} stale requests dropped, {} remaining", dropped, pending.len());
        }
    }

    /// Rejection-sample an id not currently pending, or `None` when the
    /// table is at capacity
    async fn fresh_client_id(&self) -> Option<u16> {
        if self.pending.lock().await.len() >= MAX_PENDING {
            return None;
        }
        loop {
            let id = self.service.random_id().await;
            if !self.pending.lock().await.contains(id) {
                return Some(id);
            }
        }
    }

    /// Tear down: stop both I/O loops (dropping their socket halves closes
    /// the connection) and detach from the service. Pending requests are
    /// dropped, never retried.
    async fn reset(self: &Arc<Self>) {
        let _ = self.shutdown.send(());
        self.service.unregister(self).await;
    }
}

async fn write_frame(stream: &mut OwnedWriteHalf, payload: &[u8]) -> std::io::Result<()> {
    let length = payload.len() as u16;
    stream.write_all(&length.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}
