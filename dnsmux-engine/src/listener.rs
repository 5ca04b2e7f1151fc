//! UDP listener
//!
//! Receives DNS queries from downstream clients and hands them to the
//! service; later sends fully formed reply datagrams back. The listener
//! never inspects the payload beyond the minimum-header check and never
//! correlates queries with replies.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

use crate::config::Endpoint;
use crate::error::Result;
use crate::message::Message;
use crate::service::Service;
use crate::MIN_MESSAGE_SIZE;

/// Receive buffer size; larger EDNS queries are truncated by the socket
const MAX_UDP_MESSAGE_SIZE: usize = 4096;

/// A downstream-facing UDP endpoint
pub struct Listener {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind a new listener on the given endpoint
    pub async fn bind(endpoint: &Endpoint) -> Result<Arc<Self>> {
        let addr = endpoint.resolve().await?;
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket)
    }

    /// Wrap an already bound datagram socket, e.g. one inherited from a
    /// service manager. The socket must be in non-blocking mode.
    pub fn adopt(socket: std::net::UdpSocket) -> Result<Arc<Self>> {
        Self::from_socket(UdpSocket::from_std(socket)?)
    }

    fn from_socket(socket: UdpSocket) -> Result<Arc<Self>> {
        let local_addr = socket.local_addr()?;
        Ok(Arc::new(Self { socket, local_addr }))
    }

    /// The address this listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive loop. Each accepted query is moved into a fresh [`Message`]
    /// and handed to the service; errors and runt datagrams are logged and
    /// skipped without stopping the loop.
    pub async fn run(self: Arc<Self>, service: Arc<Service>) {
        loop {
            let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
            match self.socket.recv_from(&mut buf).await {
                Err(e) => {
                    error!("receive error on {}: {}", self.local_addr, e);
                }
                Ok((len, src)) if len < MIN_MESSAGE_SIZE => {
                    debug!("request too small ({} bytes) from {}", len, src);
                }
                Ok((len, src)) => {
                    debug!("request received from {} ({} bytes)", src, len);
                    buf.truncate(len);
                    let msg = Message::new(buf, src, self.clone());
                    service.add_request(msg).await;
                }
            }
        }
    }

    /// Schedule a reply datagram. Send failures are logged and the reply
    /// is dropped; DNS clients retry end-to-end.
    pub(crate) fn send_response(self: &Arc<Self>, response: Vec<u8>, dst: SocketAddr) {
        let listener = self.clone();
        tokio::spawn(async move {
            match listener.socket.send_to(&response, dst).await {
                Ok(n) if n == response.len() => {
                    debug!("response sent to {} ({} bytes)", dst, n);
                }
                Ok(n) => {
                    warn!("partial response to {}: {} of {} bytes", dst, n, response.len());
                }
                Err(e) => {
                    warn!("failed to send response to {}: {}", dst, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let listener = Listener::bind(&Endpoint::new("127.0.0.1", Some(0)))
            .await
            .unwrap();
        assert_eq!(listener.local_addr().ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_adopt_std_socket() {
        let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_socket.set_nonblocking(true).unwrap();
        let expected = std_socket.local_addr().unwrap();
        let listener = Listener::adopt(std_socket).unwrap();
        assert_eq!(listener.local_addr(), expected);
    }

    #[tokio::test]
    async fn test_send_response_reaches_client() {
        let listener = Listener::bind(&Endpoint::new("127.0.0.1", Some(0)))
            .await
            .unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = client.local_addr().unwrap();

        listener.send_response(vec![0xAB, 0xCD, 0x01], dst);

        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            client.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..n], &[0xAB, 0xCD, 0x01]);
        assert_eq!(from, listener.local_addr());
    }
}
