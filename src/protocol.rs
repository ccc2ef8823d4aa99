/*!
 * Redis RESP Protocol Implementation
 *
 * Client side of the Redis Serialization Protocol. Commands go out as arrays
 * of bulk strings; replies come back as any of the five RESP2 types and are
 * parsed incrementally, so a partially received reply simply yields `None`
 * until more bytes arrive.
 */

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A reply received from a Redis-compatible server
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK`
    Simple(Bytes),
    /// `-ERR message`
    Error(Bytes),
    /// `:42`
    Integer(i64),
    /// `$n` payload, `None` for `$-1`
    Bulk(Option<Bytes>),
    /// `*n` elements, `None` for `*-1`
    Array(Option<Vec<Reply>>),
}

impl Reply {
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Turn an error reply into `Error::Destination`
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error(msg) => Err(Error::Destination(
                String::from_utf8_lossy(&msg).into_owned(),
            )),
            other => Ok(other),
        }
    }

    /// True for `+OK`
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Simple(s) if s.as_ref() == b"OK")
    }
}

/// Parse a single reply from the front of `data`
///
/// # Arguments
/// * `data` - Raw bytes received from the server
///
/// # Returns
/// * `Ok(Some((consumed_bytes, reply)))` - A complete reply
/// * `Ok(None)` - Incomplete data, need more bytes
/// * `Err(Error::Protocol)` - Malformed reply
pub fn parse_reply(data: &[u8]) -> Result<Option<(usize, Reply)>> {
    if data.is_empty() {
        return Ok(None);
    }

    match data[0] {
        b'+' | b'-' => {
            let end = match find_crlf(&data[1..]) {
                Some(end) => end,
                None => return Ok(None),
            };
            let line = Bytes::copy_from_slice(&data[1..1 + end]);
            let reply = if data[0] == b'+' {
                Reply::Simple(line)
            } else {
                Reply::Error(line)
            };
            Ok(Some((1 + end + 2, reply)))
        }
        b':' => {
            let (i, n) = read_decimal_line(&data[1..])?;
            if i == 0 {
                return Ok(None);
            }
            Ok(Some((1 + i, Reply::Integer(n))))
        }
        b'$' => {
            let (i, len) = read_decimal_line(&data[1..])?;
            if i == 0 {
                return Ok(None);
            }
            let cursor = 1 + i;
            if len < 0 {
                return Ok(Some((cursor, Reply::Bulk(None))));
            }

            // Payload plus trailing \r\n
            let need = len as usize + 2;
            if cursor + need > data.len() {
                return Ok(None);
            }
            if &data[cursor + len as usize..cursor + need] != b"\r\n" {
                return Err(Error::Protocol("bulk string not terminated by CRLF".into()));
            }
            let payload = Bytes::copy_from_slice(&data[cursor..cursor + len as usize]);
            Ok(Some((cursor + need, Reply::Bulk(Some(payload)))))
        }
        b'*' => {
            let (i, n) = read_decimal_line(&data[1..])?;
            if i == 0 {
                return Ok(None);
            }
            let mut cursor = 1 + i;
            if n < 0 {
                return Ok(Some((cursor, Reply::Array(None))));
            }

            let mut items = Vec::with_capacity(n.min(1024) as usize);
            for _ in 0..n {
                match parse_reply(&data[cursor..])? {
                    Some((used, item)) => {
                        cursor += used;
                        items.push(item);
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((cursor, Reply::Array(Some(items)))))
        }
        other => Err(Error::Protocol(format!(
            "unexpected reply type byte 0x{:02x}",
            other
        ))),
    }
}

/// Parse every complete reply in `buf`, leaving a partial tail in place
///
/// Used for pipelined batches where many replies arrive back to back.
pub fn parse_many(buf: &mut BytesMut, out: &mut Vec<Reply>) -> Result<()> {
    loop {
        let (consumed, reply) = match parse_reply(&buf[..])? {
            Some(x) => x,
            None => break,
        };
        buf.advance(consumed);
        out.push(reply);
    }
    Ok(())
}

/// Append one command as an array of bulk strings
///
/// # Arguments
/// * `buf` - Output buffer
/// * `args` - Command name followed by its arguments
pub fn write_command<A: AsRef<[u8]>>(buf: &mut BytesMut, args: &[A]) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for a in args {
        let a = a.as_ref();
        buf.put_u8(b'$');
        buf.put_slice(a.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(a);
        buf.put_slice(b"\r\n");
    }
}

/// Read a decimal number followed by \r\n
///
/// # Returns
/// * `(bytes_consumed, parsed_number)`, with `bytes_consumed == 0` when the
///   line is not complete yet
fn read_decimal_line(s: &[u8]) -> Result<(usize, i64)> {
    let mut i = 0;
    let mut num: i64 = 0;
    let mut sign: i64 = 1;

    if i < s.len() && s[i] == b'-' {
        sign = -1;
        i += 1;
    }
    let start = i;

    while i < s.len() && s[i].is_ascii_digit() {
        num = num
            .checked_mul(10)
            .and_then(|n| n.checked_add((s[i] - b'0') as i64))
            .ok_or_else(|| Error::Protocol("integer overflow in reply".into()))?;
        i += 1;
    }

    if i + 1 < s.len() && s[i] == b'\r' && s[i + 1] == b'\n' {
        if i == start {
            return Err(Error::Protocol("expected digits".into()));
        }
        Ok((i + 2, num * sign))
    } else if i + 1 >= s.len() {
        Ok((0, 0))
    } else {
        Err(Error::Protocol("expected CRLF".into()))
    }
}

#[inline]
fn find_crlf(s: &[u8]) -> Option<usize> {
    s.windows(2).position(|w| w == b"\r\n")
}

/// Encode a simple string reply: +<string>\r\n
pub fn resp_simple(s: &str) -> Vec<u8> {
    format!("+{}\r\n", s).into_bytes()
}

/// Encode an error reply: -<message>\r\n
pub fn resp_error(s: &str) -> Vec<u8> {
    format!("-{}\r\n", s).into_bytes()
}

/// Encode a bulk string reply: $<len>\r\n<data>\r\n
pub fn resp_bulk(b: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(b.len() + 16);
    v.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
    v.extend_from_slice(b);
    v.extend_from_slice(b"\r\n");
    v
}

/// Encode an integer reply: :<number>\r\n
pub fn resp_integer(i: i64) -> Vec<u8> {
    format!(":{}\r\n", i).into_bytes()
}
