//! Listening socket setup shared by both engines.

use crate::error::{Error, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Pending-connection queue length handed to `listen`.
pub const LISTEN_BACKLOG: i32 = 1;

/// Create a TCP listener bound to `addr` with address reuse enabled.
///
/// The completion engine wants a blocking socket and lets the kernel park
/// the accept. The readiness engine wants a non-blocking one.
pub fn create_listener(addr: SocketAddr, nonblocking: bool) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(nonblocking)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket)
}

/// Convert a socket address returned by the OS to a std address.
pub fn to_socket_addr(addr: &SockAddr) -> Result<SocketAddr> {
    addr.as_socket()
        .ok_or_else(|| Error::from_code(libc::EAFNOSUPPORT))
}

/// Whether a failed accept leaves the listener usable.
///
/// The peer went away or the call was interrupted. Anything else, running
/// out of descriptors included, means the acceptor cannot make progress.
pub fn is_transient_accept_error(error: &Error) -> bool {
    matches!(
        error.code(),
        Some(libc::ECONNABORTED | libc::EINTR | libc::EAGAIN | libc::EPROTO)
    )
}

/// IPv6 loopback, falling back to IPv4 where IPv6 is disabled.
///
/// Only a missing IPv6 stack or address triggers the fallback. A port that
/// is busy on `::1` stays an IPv6 address so the caller's bind reports it.
pub fn loopback(port: u16) -> SocketAddr {
    let v6 = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), port);
    match Socket::new(Domain::IPV6, Type::STREAM, None).and_then(|s| s.bind(&v6.into())) {
        Err(e) if ipv6_unavailable(&e) => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port),
        _ => v6,
    }
}

fn ipv6_unavailable(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EADDRNOTAVAIL | libc::EAFNOSUPPORT)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_binds_ephemeral_port() {
        let socket = create_listener(loopback(0), true).unwrap();
        let addr = to_socket_addr(&socket.local_addr().unwrap()).unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_listener_accepts_connection() {
        let socket = create_listener(loopback(0), false).unwrap();
        let addr = to_socket_addr(&socket.local_addr().unwrap()).unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let (_, peer) = socket.accept().unwrap();
        assert!(to_socket_addr(&peer).unwrap().ip().is_loopback());
    }

    #[test]
    fn test_address_in_use() {
        let first = create_listener(loopback(0), true).unwrap();
        let addr = to_socket_addr(&first.local_addr().unwrap()).unwrap();

        // Reuse does not allow two active listeners on one port
        assert!(create_listener(addr, true).is_err());
    }

    #[test]
    fn test_loopback_keeps_busy_ipv6_port() {
        let first = create_listener(loopback(0), true).unwrap();
        let addr = to_socket_addr(&first.local_addr().unwrap()).unwrap();
        if addr.is_ipv4() {
            // No IPv6 loopback on this host
            return;
        }

        assert_eq!(loopback(addr.port()), addr);
        assert!(create_listener(loopback(addr.port()), true).is_err());
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&Error::from_code(libc::ECONNABORTED)));
        assert!(is_transient_accept_error(&Error::from_code(libc::EINTR)));
        assert!(!is_transient_accept_error(&Error::from_code(libc::EMFILE)));
        assert!(!is_transient_accept_error(&Error::from_code(libc::ENFILE)));
        assert!(!is_transient_accept_error(&Error::NotBound));
    }
}
