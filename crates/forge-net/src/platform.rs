//! Cross-platform TCP socket configuration.
//!
//! [`SocketConfig`] gathers the socket options applied to every connection
//! (TCP_NODELAY, keepalive, SO_REUSEADDR, dual-stack IPv6); the helpers here
//! apply them the same way on Linux, Windows and macOS.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

/// Socket options applied to every accepted or connected stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm for lower latency. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe, in seconds. Default: 60.
    pub keepalive_idle_secs: u64,
    /// Interval between keepalive probes, in seconds. Default: 10.
    pub keepalive_interval_secs: u64,
    /// Probes before the connection is declared dead. Default: 3.
    pub keepalive_retries: u32,
    /// Enable `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Listen backlog. Default: 128.
    pub backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle_secs: 60,
            keepalive_interval_secs: 10,
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 128,
        }
    }
}

/// Apply socket configuration to a connected [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(config.keepalive_idle_secs))
            .with_interval(Duration::from_secs(config.keepalive_interval_secs));

        // Retries are supported on Linux and Windows but not macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Create a listening socket with the configured options.
///
/// IPv6 listeners are dual-stack: they also accept IPv4 clients.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Wildcard bind address for the requested family.
pub fn wildcard_address(port: u16, ipv6: bool) -> SocketAddr {
    if ipv6 {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }
}

/// Resolve `address:port`, preferring the requested address family.
///
/// An empty address or `*` means the wildcard address. Host names are
/// resolved through the system resolver; when no address of the requested
/// family exists the first result of the other family is used.
pub fn resolve_address(address: &str, port: u16, ipv6: bool) -> io::Result<SocketAddr> {
    let trimmed = address.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return Ok(wildcard_address(port, ipv6));
    }

    let host = trimmed.trim_start_matches('[').trim_end_matches(']');
    let candidates: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    candidates
        .iter()
        .find(|addr| addr.is_ipv6() == ipv6)
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address found for {trimmed}:{port}"),
            )
        })
}
