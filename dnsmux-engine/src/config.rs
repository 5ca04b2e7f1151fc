//! Endpoint and proxy configuration
//!
//! Parses endpoint specifications in the forms accepted on the command
//! line:
//! - `host` or `host:port`
//! - `[ipv6]` or `[ipv6]:port`
//!
//! The port may be numeric or the literal service name `domain` (53).
//! When omitted it defaults to 53 on both the listen and upstream side.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::lookup_host;

use crate::error::{Error, Result};

/// Default DNS port used when an endpoint omits one
pub const DNS_PORT: u16 = 53;

/// Default maximum age of an unanswered upstream request
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_secs(60);

/// Default bound on requests queued while no upstream connection is ready
pub const DEFAULT_MAX_DEFERRED: usize = 1024;

/// A host/port pair as written on the command line, before resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP literal (brackets already stripped for IPv6)
    pub host: String,
    /// Explicit port, if one was given
    pub port: Option<u16>,
}

impl Endpoint {
    /// Create an endpoint from parts
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The port to use, falling back to the DNS default
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DNS_PORT)
    }

    /// Resolve to the first matching socket address
    pub async fn resolve(&self) -> Result<SocketAddr> {
        lookup_host((self.host.as_str(), self.port_or_default()))
            .await
            .map_err(|e| Error::Resolve(format!("{}: {}", self, e)))?
            .next()
            .ok_or_else(|| Error::Resolve(format!("{}: no addresses found", self)))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let host: &str = &self.host;
        let bracketed = host.contains(':');
        match (bracketed, self.port) {
            (true, Some(port)) => write!(f, "[{}]:{}", host, port),
            (true, None) => write!(f, "[{}]", host),
            (false, Some(port)) => write!(f, "{}:{}", host, port),
            (false, None) => write!(f, "{}", host),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        // Bracketed IPv6: [addr] or [addr]:port
        if let Some(rest) = s.strip_prefix('[') {
            let Some((host, after)) = rest.split_once(']') else {
                return Err(Error::Config(format!(
                    "invalid endpoint '{}': unterminated '['",
                    s
                )));
            };
            if host.is_empty() {
                return Err(Error::Config(format!("invalid endpoint '{}': empty host", s)));
            }
            let port = match after {
                "" => None,
                _ => match after.strip_prefix(':') {
                    Some(p) => Some(parse_port(s, p)?),
                    None => {
                        return Err(Error::Config(format!(
                            "invalid endpoint '{}': unexpected '{}' after ']'",
                            s, after
                        )))
                    }
                },
            };
            return Ok(Endpoint::new(host, port));
        }

        // host or host:port; a second colon means an unbracketed IPv6 literal
        match s.split_once(':') {
            None => {
                if s.is_empty() {
                    return Err(Error::Config("invalid endpoint: empty host".into()));
                }
                Ok(Endpoint::new(s, None))
            }
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(Error::Config(format!("invalid endpoint '{}': empty host", s)));
                }
                if port.contains(':') {
                    return Err(Error::Config(format!(
                        "invalid endpoint '{}': IPv6 addresses must be bracketed",
                        s
                    )));
                }
                Ok(Endpoint::new(host, Some(parse_port(s, port)?)))
            }
        }
    }
}

/// Parse a port field, accepting the `domain` service name
fn parse_port(endpoint: &str, port: &str) -> Result<u16> {
    if port.is_empty() || port == "domain" {
        return Ok(DNS_PORT);
    }
    port.parse::<u16>().map_err(|_| {
        Error::Config(format!(
            "invalid endpoint '{}': bad port '{}'",
            endpoint, port
        ))
    })
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP endpoints to accept queries on
    pub bind_udp: Vec<Endpoint>,
    /// Upstream TCP endpoints; only the first entry is used
    pub connect_tcp: Vec<Endpoint>,
    /// Maximum age of an unanswered upstream request before it is dropped
    pub time_to_live: Duration,
    /// Bound on requests queued while no upstream connection is ready
    pub max_deferred: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_udp: Vec::new(),
            connect_tcp: Vec::new(),
            time_to_live: DEFAULT_TIME_TO_LIVE,
            max_deferred: DEFAULT_MAX_DEFERRED,
        }
    }
}

impl Config {
    /// The upstream endpoint used by the connector
    pub fn upstream(&self) -> Option<&Endpoint> {
        self.connect_tcp.first()
    }
}
