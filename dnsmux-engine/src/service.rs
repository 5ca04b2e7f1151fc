//! Composition root
//!
//! The service owns the configuration, the deferred request queue, the
//! at-most-one upstream connector and the transaction-id generator. It is
//! the hand-off point between listeners and the connector: a request the
//! connector cannot take right now waits here, in FIFO order, until the
//! connector pulls it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::connector::Connector;
use crate::message::Message;

/// Source of upstream transaction ids.
///
/// The production source is a PRNG; tests substitute a scripted sequence
/// to pin down the ids the connector puts on the wire.
pub trait IdSource: Send {
    /// Produce the next candidate id
    fn next_id(&mut self) -> u16;
}

/// PRNG-backed id source, seeded from wall-clock time at startup
pub struct RandomIdSource(SmallRng);

impl RandomIdSource {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self(SmallRng::seed_from_u64(seed))
    }
}

impl Default for RandomIdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for RandomIdSource {
    fn next_id(&mut self) -> u16 {
        self.0.random()
    }
}

struct State {
    connector: Option<Arc<Connector>>,
    deferred: VecDeque<Box<Message>>,
    ids: Box<dyn IdSource>,
}

/// The proxy service: configuration, deferred queue, connector lifecycle
pub struct Service {
    config: Config,
    state: Mutex<State>,
}

impl Service {
    /// Create a service with the default, randomly seeded id source
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_id_source(config, Box::new(RandomIdSource::new()))
    }

    /// Create a service with an explicit id source
    pub fn with_id_source(config: Config, ids: Box<dyn IdSource>) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State {
                connector: None,
                deferred: VecDeque::new(),
                ids,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Accept a request from a listener. Spawns a connector if none is
    /// registered, then offers the request to it; a refused request joins
    /// the deferred queue (dropping the oldest entry when full).
    pub async fn add_request(self: &Arc<Self>, msg: Box<Message>) {
        let mut state = self.state.lock().await;
        let connector = if let Some(connector) = state.connector.as_ref() {
            connector.clone()
        } else {
            let connector = Connector::spawn(self.clone());
            state.connector = Some(connector.clone());
            connector
        };
        // offering ahead of an existing backlog would reorder requests
        let msg = if state.deferred.is_empty() {
            match connector.add_request(msg) {
                Ok(()) => return,
                Err(msg) => msg,
            }
        } else {
            msg
        };
        if state.deferred.len() >= self.config.max_deferred {
            warn!("deferred queue full, dropping oldest request");
            state.deferred.pop_front();
        }
        debug!("request deferred ({} queued)", state.deferred.len() + 1);
        state.deferred.push_back(msg);
    }

    /// Pop the oldest deferred request, if any. Called by the connector
    /// when its send slot frees up.
    pub(crate) async fn unqueue(&self) -> Option<Box<Message>> {
        self.state.lock().await.deferred.pop_front()
    }

    /// Detach a connector that is shutting down. A later request will
    /// spawn a fresh one; anything deferred stays queued for it.
    pub(crate) async fn unregister(&self, connector: &Arc<Connector>) {
        let mut state = self.state.lock().await;
        if state
            .connector
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, connector))
        {
            debug!("upstream connector unregistered");
            state.connector = None;
        }
    }

    /// The next candidate transaction id
    pub(crate) async fn random_id(&self) -> u16 {
        self.state.lock().await.ids.next_id()
    }
}
