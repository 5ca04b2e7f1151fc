//! dnsmux-engine - DNS forwarding proxy machinery
//!
//! Accepts DNS queries over UDP and forwards them to an upstream resolver
//! over a single persistent TCP connection (RFC 1035 length-prefixed
//! framing), multiplexing concurrent queries by rewriting the 16-bit
//! transaction id in each direction.
//!
//! The moving parts:
//! - [`Listener`]: downstream UDP endpoint, one per bind address
//! - [`Service`]: composition root, deferred queueing, connector lifecycle
//! - the connector (internal): the single upstream TCP connection with its
//!   pending-request table, expiry queue and framing
//!
//! # Example
//!
//! ```no_run
//! use dnsmux_engine::{Config, Endpoint, Listener, Service};
//!
//! # async fn example() -> dnsmux_engine::Result<()> {
//! let mut config = Config::default();
//! config.connect_tcp.push("10.0.0.1:53".parse()?);
//!
//! let service = Service::new(config);
//! let listener = Listener::bind(&Endpoint::new("127.0.0.1", Some(53))).await?;
//! tokio::spawn(listener.run(service));
//! # Ok(())
//! # }
//! ```

mod connector;
mod listener;
mod message;
mod service;

pub mod config;
pub mod error;
pub mod socket;

pub use config::{Config, Endpoint};
pub use error::{Error, Result};
pub use listener::Listener;
pub use message::Message;
pub use service::{IdSource, RandomIdSource, Service};

/// Smallest valid DNS message: the 12-byte header
pub const MIN_MESSAGE_SIZE: usize = 12;
