/*!
 * Length/Value Codec
 *
 * Redis prefixes almost everything in a snapshot with a variable width length.
 * The two top bits of the first byte select the width:
 *
 * * `00xxxxxx` - 6 bit length
 * * `01xxxxxx xxxxxxxx` - 14 bit length
 * * `10000000` + 4 bytes - 32 bit big endian length
 * * `10000001` + 8 bytes - 64 bit big endian length
 * * `11xxxxxx` - encoded literal, the low 6 bits name the encoding
 *
 * [`RdbReader`] owns the stream cursor used by the parser and the object
 * decoders. [`Input`] is the bounds-checked cursor the compact container
 * codecs use on already materialised blobs.
 */

use crate::error::{Error, Result};
use crate::lzf;
use std::io::{self, BufReader, Read};

/// 6 bit inline length
pub const LEN_6BIT: u8 = 0;
/// 14 bit length, second byte holds the low bits
pub const LEN_14BIT: u8 = 1;
/// Encoded literal marker
pub const LEN_ENCVAL: u8 = 3;
/// 32 bit big endian length marker byte
pub const LEN_32BIT: u8 = 0x80;
/// 64 bit big endian length marker byte
pub const LEN_64BIT: u8 = 0x81;

/// Encoded literal kinds (low 6 bits of an `11xxxxxx` prefix)
pub const ENC_INT8: u64 = 0;
pub const ENC_INT16: u64 = 1;
pub const ENC_INT32: u64 = 2;
pub const ENC_LZF: u64 = 3;

/// Stream reader carrying the parse cursor
///
/// Tracks the absolute byte offset so errors can point at the failing
/// position, and keeps an 8 byte scratch buffer for fixed width reads.
pub struct RdbReader<R: Read> {
    inner: BufReader<R>,
    offset: u64,
    scratch: [u8; 8],
}

impl<R: Read> RdbReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            offset: 0,
            scratch: [0u8; 8],
        }
    }

    /// Bytes consumed so far
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8> {
        self.fill(1)?;
        Ok(self.scratch[0])
    }

    /// Read exactly `n` bytes into a fresh buffer
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Read exactly `buf.len()` bytes
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| self.eof_context(e))?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.fill(4)?;
        Ok(u32::from_le_bytes([
            self.scratch[0],
            self.scratch[1],
            self.scratch[2],
            self.scratch[3],
        ]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        self.fill(8)?;
        Ok(u64::from_le_bytes(self.scratch))
    }

    pub fn read_u64_be(&mut self) -> Result<u64> {
        self.fill(8)?;
        Ok(u64::from_be_bytes(self.scratch))
    }

    /// Read a length prefix
    ///
    /// # Returns
    /// * `(value, false)` for plain lengths
    /// * `(encoding, true)` for encoded literals; `encoding` is one of the
    ///   `ENC_*` constants
    pub fn read_length(&mut self) -> Result<(u64, bool)> {
        let first = self.read_u8()?;
        match (first & 0xC0) >> 6 {
            LEN_6BIT => Ok(((first & 0x3F) as u64, false)),
            LEN_14BIT => {
                let next = self.read_u8()?;
                Ok(((((first & 0x3F) as u64) << 8) | next as u64, false))
            }
            LEN_ENCVAL => Ok(((first & 0x3F) as u64, true)),
            _ => match first {
                LEN_32BIT => {
                    self.fill(4)?;
                    let v = u32::from_be_bytes([
                        self.scratch[0],
                        self.scratch[1],
                        self.scratch[2],
                        self.scratch[3],
                    ]);
                    Ok((v as u64, false))
                }
                LEN_64BIT => Ok((self.read_u64_be()?, false)),
                other => Err(Error::format(format!(
                    "unknown length encoding 0x{:02x} at offset {}",
                    other,
                    self.offset - 1
                ))),
            },
        }
    }

    /// Read a plain length, rejecting encoded literals
    pub fn read_len(&mut self) -> Result<u64> {
        match self.read_length()? {
            (n, false) => Ok(n),
            (_, true) => Err(Error::format(format!(
                "expected a length, found an encoded literal at offset {}",
                self.offset - 1
            ))),
        }
    }

    /// Read a string: raw bytes, an integer literal rendered as text, or an
    /// LZF payload
    pub fn read_string(&mut self) -> Result<Vec<u8>> {
        let (len, encoded) = self.read_length()?;
        if !encoded {
            let len = usize::try_from(len)
                .map_err(|_| Error::format(format!("string length {} too large", len)))?;
            return self.read_bytes(len);
        }

        match len {
            ENC_INT8 => Ok((self.read_u8()? as i8).to_string().into_bytes()),
            ENC_INT16 => {
                self.fill(2)?;
                let v = i16::from_le_bytes([self.scratch[0], self.scratch[1]]);
                Ok(v.to_string().into_bytes())
            }
            ENC_INT32 => Ok((self.read_u32_le()? as i32).to_string().into_bytes()),
            ENC_LZF => {
                let compressed_len = self.read_len()? as usize;
                let uncompressed_len = self.read_len()? as usize;
                let compressed = self.read_bytes(compressed_len)?;
                lzf::decompress(&compressed, uncompressed_len)
            }
            other => Err(Error::format(format!(
                "unknown string encoding {} at offset {}",
                other, self.offset
            ))),
        }
    }

    /// Read a score stored as length-prefixed ASCII
    ///
    /// Length bytes 253, 254 and 255 stand for NaN, +inf and -inf.
    pub fn read_float_text(&mut self) -> Result<f64> {
        match self.read_u8()? {
            253 => Ok(f64::NAN),
            254 => Ok(f64::INFINITY),
            255 => Ok(f64::NEG_INFINITY),
            n => {
                let raw = self.read_bytes(n as usize)?;
                parse_float(&raw)
            }
        }
    }

    /// Read an IEEE-754 double stored little endian
    pub fn read_float_binary(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64_le()?))
    }

    fn fill(&mut self, n: usize) -> Result<()> {
        let mut tmp = [0u8; 8];
        self.inner
            .read_exact(&mut tmp[..n])
            .map_err(|e| self.eof_context(e))?;
        self.scratch[..n].copy_from_slice(&tmp[..n]);
        self.offset += n as u64;
        Ok(())
    }

    fn eof_context(&self, e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended early at offset {}", self.offset),
            ))
        } else {
            Error::Io(e)
        }
    }
}

/// Parse ASCII float text the way Redis writes it (`inf`, `-inf`, `nan`
/// included)
pub fn parse_float(raw: &[u8]) -> Result<f64> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| Error::format("score is not valid utf-8"))?;
    s.trim()
        .parse::<f64>()
        .map_err(|_| Error::format(format!("invalid score {:?}", s)))
}

/// Bounds-checked cursor over an in-memory blob
#[derive(Debug)]
pub struct Input<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::format(format!("blob truncated at byte {}", self.pos)))?;
        self.pos += 1;
        Ok(b)
    }

    /// Borrow the next `n` bytes
    pub fn slice(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::format(format!(
                    "blob truncated: need {} bytes at {}, have {}",
                    n,
                    self.pos,
                    self.remaining()
                ))
            })?;
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.slice(n).map(|_| ())
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let b = self.slice(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let b = self.slice(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        let b = self.slice(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        let b = self.slice(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_u64_be(&mut self) -> Result<u64> {
        let b = self.slice(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}
