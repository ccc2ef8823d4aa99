/*!
 * TCP Dialing
 *
 * Outbound sockets for both the replication source and the destination
 * stores. Sockets are built with socket2 so keepalive, nodelay and the
 * connect deadline can be set before the stream is handed to std.
 */

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default deadline for connect, read and write
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket options applied by [`dial`]
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// TCP keepalive idle time, `None` leaves the OS default
    pub keepalive: Option<Duration>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: Some(DEFAULT_TIMEOUT),
            write_timeout: Some(DEFAULT_TIMEOUT),
            keepalive: Some(DEFAULT_TIMEOUT),
        }
    }
}

/// Resolve `addr` and connect to the first address that answers
///
/// # Arguments
/// * `addr` - `host:port`
/// * `opts` - Deadlines and keepalive
///
/// # Returns
/// * A blocking `TcpStream` with read/write deadlines installed
pub fn dial(addr: &str, opts: &DialOptions) -> io::Result<TcpStream> {
    let mut last_err = None;
    for sa in addr.to_socket_addrs()? {
        match dial_one(sa, opts) {
            Ok(s) => return Ok(s),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} did not resolve to any address", addr),
        )
    }))
}

fn dial_one(addr: SocketAddr, opts: &DialOptions) -> io::Result<TcpStream> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if let Some(idle) = opts.keepalive {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    socket.set_nodelay(true)?;
    socket.connect_timeout(&SockAddr::from(addr), opts.connect_timeout)?;
    socket.set_read_timeout(opts.read_timeout)?;
    socket.set_write_timeout(opts.write_timeout)?;

    Ok(socket.into())
}

/// Normalise the two error kinds a socket deadline may surface as
pub fn timed_out(e: io::Error) -> io::Error {
    if e.kind() == io::ErrorKind::WouldBlock {
        io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
    } else {
        e
    }
}
