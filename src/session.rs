/*!
 * Source Stream Session
 *
 * Captures a snapshot from a live server the way a replica does: connect,
 * optionally authenticate, send `SYNC`, then read the `$<n>` header that
 * announces the size of the RDB payload. The payload itself is exposed as a
 * [`BoundedReader`] that never reads past the announced byte count, so the
 * replication stream that follows the snapshot is left untouched.
 */

use crate::error::{Error, Result};
use crate::net::{self, DialOptions};
use crate::protocol;
use bytes::BytesMut;
use log::{debug, info};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

/// Longest handshake reply line accepted before giving up
const MAX_LINE: usize = 1024;

/// Connection settings for the snapshot source
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `host:port`
    pub addr: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Deadline for every read and write, handshake included
    pub read_timeout: Duration,
    /// TCP keepalive idle time
    pub keepalive: Duration,
    /// Wrap the TCP stream in TLS (webpki roots)
    pub tls: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            addr: crate::DEFAULT_ADDR.into(),
            user: None,
            password: None,
            read_timeout: net::DEFAULT_TIMEOUT,
            keepalive: net::DEFAULT_TIMEOUT,
            tls: false,
        }
    }
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

/// An established replication session positioned at the start of the RDB
/// payload
pub struct SourceSession {
    transport: Transport,
    payload_len: u64,
}

impl SourceSession {
    /// Connect, authenticate and request a full resync
    ///
    /// # Returns
    /// * The session, with [`SourceSession::payload_len`] set from the
    ///   `$<n>` header
    /// * `Error::Protocol` when authentication fails or the header is not a
    ///   positive bulk length
    /// * `Error::Io` on socket failures and deadline expiry
    pub fn connect(cfg: &SessionConfig) -> Result<Self> {
        let opts = DialOptions {
            connect_timeout: cfg.read_timeout,
            read_timeout: Some(cfg.read_timeout),
            write_timeout: Some(cfg.read_timeout),
            keepalive: Some(cfg.keepalive),
        };
        let tcp = net::dial(&cfg.addr, &opts)?;
        let transport = if cfg.tls {
            Transport::Tls(Box::new(tls_wrap(&cfg.addr, tcp)?))
        } else {
            Transport::Plain(tcp)
        };

        let mut session = Self {
            transport,
            payload_len: 0,
        };
        session.handshake(cfg)?;
        info!(
            "source {} announced a {} byte snapshot",
            cfg.addr, session.payload_len
        );
        Ok(session)
    }

    /// Size of the RDB payload announced by the source
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Borrow a reader over exactly the announced payload
    pub fn reader(&mut self) -> BoundedReader<&mut Self> {
        let limit = self.payload_len;
        BoundedReader::new(self, limit)
    }

    /// Consume the session into a reader over exactly the announced payload
    pub fn into_reader(self) -> BoundedReader<Self> {
        let limit = self.payload_len;
        BoundedReader::new(self, limit)
    }

    fn handshake(&mut self, cfg: &SessionConfig) -> Result<()> {
        if let Some(pass) = cfg.password.as_deref().filter(|p| !p.is_empty()) {
            let mut args: Vec<&[u8]> = vec![b"AUTH".as_slice()];
            if let Some(user) = cfg.user.as_deref().filter(|u| !u.is_empty()) {
                args.push(user.as_bytes());
            }
            args.push(pass.as_bytes());
            self.send(&args)?;

            let line = self.read_line()?;
            if line != b"+OK" {
                return Err(Error::Protocol(format!(
                    "auth failed: {}",
                    String::from_utf8_lossy(&line)
                )));
            }
            debug!("authenticated against {}", cfg.addr);
        }

        self.send(&[b"SYNC".as_slice()])?;
        let line = self.read_line()?;
        self.payload_len = parse_payload_header(&line)?;
        Ok(())
    }

    fn send(&mut self, args: &[&[u8]]) -> Result<()> {
        let mut buf = BytesMut::new();
        protocol::write_command(&mut buf, args);
        self.transport.write_all(&buf).map_err(net::timed_out)?;
        self.transport.flush().map_err(net::timed_out)?;
        Ok(())
    }

    /// Read one `\r\n` terminated line, skipping the bare `\n` keepalives a
    /// server sends while it prepares the snapshot
    ///
    /// Reads byte by byte so not a single payload byte is consumed.
    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.transport.read(&mut byte).map_err(net::timed_out)?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source closed the connection during the handshake",
                )));
            }
            match byte[0] {
                b'\n' if line.is_empty() => continue,
                b'\n' if line.last() == Some(&b'\r') => {
                    line.pop();
                    return Ok(line);
                }
                b => line.push(b),
            }
            if line.len() > MAX_LINE {
                return Err(Error::Protocol("handshake reply line too long".into()));
            }
        }
    }
}

impl Read for SourceSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.transport.read(buf).map_err(net::timed_out)
    }
}

/// Parse the `$<n>` line that precedes the RDB payload
pub fn parse_payload_header(line: &[u8]) -> Result<u64> {
    let text = String::from_utf8_lossy(line);
    if let Some(msg) = text.strip_prefix('-') {
        return Err(Error::Protocol(format!("source refused SYNC: {}", msg)));
    }
    let n = text
        .strip_prefix('$')
        .and_then(|n| n.parse::<i64>().ok())
        .ok_or_else(|| Error::Protocol(format!("unexpected SYNC reply {:?}", text)))?;
    if n <= 0 {
        return Err(Error::Protocol(format!(
            "source announced an empty snapshot ({})",
            n
        )));
    }
    Ok(n as u64)
}

fn tls_wrap(addr: &str, tcp: TcpStream) -> Result<StreamOwned<ClientConnection, TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let host = host_of(addr);
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Protocol(format!("invalid TLS server name {}: {}", host, e)))?;
    let conn = ClientConnection::new(Arc::new(config), name)
        .map_err(|e| Error::Protocol(format!("tls setup failed: {}", e)))?;
    Ok(StreamOwned::new(conn, tcp))
}

/// Host part of `host:port`, IPv6 brackets removed
fn host_of(addr: &str) -> &str {
    let host = match addr.rfind(':') {
        Some(i) => &addr[..i],
        None => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Reader that yields at most `limit` bytes from `inner`
pub struct BoundedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> BoundedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    /// Bytes still to be delivered
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source closed with {} payload bytes outstanding", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
