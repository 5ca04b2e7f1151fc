//! Adoption of sockets inherited from a service manager
//!
//! Under socket activation the manager binds the UDP sockets itself and
//! passes them to the daemon starting at fd 3, advertising the count in
//! `LISTEN_FDS` (honored only when `LISTEN_PID` names this process).
//! Without a manager environment a single inherited socket is assumed.

use std::net::UdpSocket;

use crate::error::{Error, Result};

/// First file descriptor used for passed sockets
#[cfg(unix)]
const LISTEN_FDS_START: std::os::fd::RawFd = 3;

/// Take ownership of the inherited datagram sockets.
///
/// Each adopted socket is verified to be `SOCK_DGRAM` and switched to
/// non-blocking mode so it can be driven by the async runtime.
#[cfg(unix)]
pub fn inherited_udp_sockets() -> Result<Vec<UdpSocket>> {
    use std::os::fd::FromRawFd;

    use socket2::{Socket, Type};

    let count = manager_fd_count(
        std::env::var("LISTEN_PID").ok().as_deref(),
        std::env::var("LISTEN_FDS").ok().as_deref(),
        std::process::id(),
    )
    .unwrap_or(1);
    if count == 0 {
        return Err(Error::Config("service manager passed no sockets".into()));
    }

    let mut sockets = Vec::with_capacity(count);
    for fd in LISTEN_FDS_START..LISTEN_FDS_START + count as std::os::fd::RawFd {
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let socket_type = socket
            .r#type()
            .map_err(|e| Error::Config(format!("inherited fd {} is not a socket: {}", fd, e)))?;
        if socket_type != Type::DGRAM {
            return Err(Error::Config(format!(
                "inherited fd {} is not a datagram socket",
                fd
            )));
        }
        socket.set_nonblocking(true)?;
        sockets.push(socket.into());
    }
    Ok(sockets)
}

#[cfg(not(unix))]
pub fn inherited_udp_sockets() -> Result<Vec<UdpSocket>> {
    Err(Error::Config(
        "socket inheritance is only supported on unix".into(),
    ))
}

/// Number of sockets the manager passed, per the `LISTEN_FDS` protocol.
/// `None` when the environment does not address this process.
#[cfg(unix)]
fn manager_fd_count(listen_pid: Option<&str>, listen_fds: Option<&str>, my_pid: u32) -> Option<usize> {
    let pid: u32 = listen_pid?.parse().ok()?;
    if pid != my_pid {
        return None;
    }
    listen_fds?.parse().ok()
}
