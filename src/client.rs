/*!
 * Destination Client
 *
 * The loader talks to its destination stores through two small traits:
 * [`Connect`] opens one connection per worker, [`Destination`] pipelines a
 * batch of commands and returns the replies. [`RespClient`] is the RESP over
 * TCP implementation; tests substitute in-memory fakes.
 */

use crate::error::{Error, Result};
use crate::net::{self, DialOptions};
use crate::protocol::{self, Reply};
use bytes::BytesMut;
use log::debug;
use std::io::{Read, Write};
use std::net::TcpStream;

/// Size of read buffer for incoming replies
const READ_BUF: usize = 16 * 1024;

/// A connection that executes pipelined command batches
pub trait Destination: Send {
    /// Send every command in one write and read one reply per command
    ///
    /// Error replies are returned as `Reply::Error`; transport failures as
    /// `Err`.
    fn exec(&mut self, commands: &[Vec<Vec<u8>>]) -> Result<Vec<Reply>>;

    /// Round trip a `PING`
    fn ping(&mut self) -> Result<()> {
        let replies = self.exec(&[vec![b"PING".to_vec()]])?;
        match replies.into_iter().next() {
            Some(Reply::Simple(s)) if s.as_ref() == b"PONG" => Ok(()),
            Some(Reply::Error(e)) => Err(Error::Destination(
                String::from_utf8_lossy(&e).into_owned(),
            )),
            other => Err(Error::Destination(format!(
                "unexpected PING reply {:?}",
                other
            ))),
        }
    }
}

/// Opens destination connections, one per worker
pub trait Connect: Send + Sync {
    type Conn: Destination + 'static;

    /// # Arguments
    /// * `worker` - Worker index, used to spread workers over addresses
    fn connect(&self, worker: usize) -> Result<Self::Conn>;
}

impl<D: Destination + ?Sized> Destination for Box<D> {
    fn exec(&mut self, commands: &[Vec<Vec<u8>>]) -> Result<Vec<Reply>> {
        (**self).exec(commands)
    }

    fn ping(&mut self) -> Result<()> {
        (**self).ping()
    }
}

/// Blocking RESP client over one TCP connection
pub struct RespClient {
    stream: TcpStream,
    wbuf: BytesMut,
    rbuf: BytesMut,
}

impl RespClient {
    /// Dial `addr` and authenticate when a password is given
    pub fn connect(
        addr: &str,
        opts: &DialOptions,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let stream = net::dial(addr, opts)?;
        let mut client = Self {
            stream,
            wbuf: BytesMut::with_capacity(READ_BUF),
            rbuf: BytesMut::with_capacity(READ_BUF),
        };

        if let Some(pass) = password.filter(|p| !p.is_empty()) {
            let mut auth: Vec<Vec<u8>> = vec![b"AUTH".to_vec()];
            if let Some(user) = username.filter(|u| !u.is_empty()) {
                auth.push(user.as_bytes().to_vec());
            }
            auth.push(pass.as_bytes().to_vec());

            let reply = client.exec(&[auth])?.into_iter().next();
            match reply {
                Some(r) if r.is_ok() => {}
                Some(Reply::Error(e)) => {
                    return Err(Error::Destination(format!(
                        "auth rejected by {}: {}",
                        addr,
                        String::from_utf8_lossy(&e)
                    )))
                }
                other => {
                    return Err(Error::Destination(format!(
                        "unexpected AUTH reply from {}: {:?}",
                        addr, other
                    )))
                }
            }
        }
        debug!("connected to destination {}", addr);
        Ok(client)
    }

    fn read_replies(&mut self, want: usize) -> Result<Vec<Reply>> {
        let mut out = Vec::with_capacity(want);
        let mut chunk = [0u8; READ_BUF];
        loop {
            protocol::parse_many(&mut self.rbuf, &mut out)?;
            if out.len() >= want {
                return Ok(out);
            }
            let n = self.stream.read(&mut chunk).map_err(net::timed_out)?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "destination closed the connection",
                )));
            }
            self.rbuf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl Destination for RespClient {
    fn exec(&mut self, commands: &[Vec<Vec<u8>>]) -> Result<Vec<Reply>> {
        self.wbuf.clear();
        for c in commands {
            protocol::write_command(&mut self.wbuf, c);
        }
        self.stream.write_all(&self.wbuf).map_err(net::timed_out)?;
        self.read_replies(commands.len())
    }
}

/// Connects workers round-robin over a list of destination addresses
#[derive(Debug, Clone)]
pub struct RespConnector {
    pub addrs: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub dial: DialOptions,
}

impl Connect for RespConnector {
    type Conn = RespClient;

    fn connect(&self, worker: usize) -> Result<RespClient> {
        if self.addrs.is_empty() {
            return Err(Error::Destination("no destination address".into()));
        }
        let addr = &self.addrs[worker % self.addrs.len()];
        RespClient::connect(
            addr,
            &self.dial,
            self.username.as_deref(),
            self.password.as_deref(),
        )
    }
}
