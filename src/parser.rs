/*!
 * Snapshot Parser
 *
 * Drives one pass over an RDB stream: validates the 9 byte header, then loops
 * over opcodes until `0xFF`. Every decoded record is pushed through a single
 * [`Handler`]. The parser owns the cursor state (byte offset, pending expiry,
 * whether a database selector was already forwarded) and checks its
 * [`CancelToken`] before each opcode.
 */

use crate::codec::RdbReader;
use crate::decode;
use crate::error::{Error, Result};
use crate::object::{AuxField, KeyObject, ResizeDb, SelectDb, TypeObject};
use log::{debug, trace};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const RDB_MAGIC: &[u8; 5] = b"REDIS";
pub const RDB_VERSION_MIN: u32 = 1;
pub const RDB_VERSION_MAX: u32 = 11;

pub const OPCODE_FUNCTION2: u8 = 0xF5;
pub const OPCODE_MODULE_AUX: u8 = 0xF7;
pub const OPCODE_IDLE: u8 = 0xF8;
pub const OPCODE_FREQ: u8 = 0xF9;
pub const OPCODE_AUX: u8 = 0xFA;
pub const OPCODE_RESIZEDB: u8 = 0xFB;
pub const OPCODE_EXPIRETIME_MS: u8 = 0xFC;
pub const OPCODE_EXPIRETIME: u8 = 0xFD;
pub const OPCODE_SELECTDB: u8 = 0xFE;
pub const OPCODE_EOF: u8 = 0xFF;

/// Cooperative cancellation flag shared between the parser, the loader and
/// whoever drives them
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// `Err(Error::Cancelled)` once the token fired
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Receives every record the parser produces
///
/// An error returned from `handle` aborts the parse and is returned from
/// [`Parser::parse`] unchanged.
pub trait Handler {
    fn handle(&mut self, cancel: &CancelToken, obj: TypeObject) -> Result<()>;

    /// Called once after the EOF opcode
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<H: Handler + ?Sized> Handler for &mut H {
    fn handle(&mut self, cancel: &CancelToken, obj: TypeObject) -> Result<()> {
        (**self).handle(cancel, obj)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn handle(&mut self, cancel: &CancelToken, obj: TypeObject) -> Result<()> {
        (**self).handle(cancel, obj)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Adapts a closure into a [`Handler`]
pub struct FnHandler<F>(pub F);

impl<F> Handler for FnHandler<F>
where
    F: FnMut(&CancelToken, TypeObject) -> Result<()>,
{
    fn handle(&mut self, cancel: &CancelToken, obj: TypeObject) -> Result<()> {
        (self.0)(cancel, obj)
    }
}

/// Parse-time switches
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Forward aux metadata (`redis-ver`, `ctime`, ...) as records
    pub emit_aux: bool,
}

/// Single pass RDB parser
pub struct Parser<R: Read, H: Handler> {
    reader: RdbReader<R>,
    handler: H,
    cancel: CancelToken,
    options: ParseOptions,
    banner: Option<String>,
    pending_expire_ms: i64,
    select_forwarded: bool,
    keys: u64,
}

impl<R: Read, H: Handler> Parser<R, H> {
    pub fn new(reader: R, handler: H, cancel: CancelToken, options: ParseOptions) -> Self {
        Self {
            reader: RdbReader::new(reader),
            handler,
            cancel,
            options,
            banner: None,
            pending_expire_ms: 0,
            select_forwarded: false,
            keys: 0,
        }
    }

    /// Header banner such as `REDIS0011`, known once the header was read
    pub fn version(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.reader.offset()
    }

    /// Keys decoded so far (a quicklist key counts once)
    pub fn keys(&self) -> u64 {
        self.keys
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Run the parse to completion
    ///
    /// # Returns
    /// * `Ok(())` after the EOF opcode and a successful `Handler::finish`
    /// * `Error::Format` for a bad header or malformed body
    /// * `Error::Io` when the stream ends before the EOF opcode
    /// * `Error::Cancelled` when the token fired
    /// * any error returned by the handler
    pub fn parse(&mut self) -> Result<()> {
        self.read_header()?;

        loop {
            self.cancel.check()?;

            let opcode = self.reader.read_u8()?;
            match opcode {
                OPCODE_IDLE => {
                    let _idle = self.reader.read_len()?;
                }
                OPCODE_FREQ => {
                    let _freq = self.reader.read_u8()?;
                }
                OPCODE_AUX => {
                    let field = self.reader.read_string()?;
                    let value = self.reader.read_string()?;
                    trace!(
                        "aux {}={}",
                        String::from_utf8_lossy(&field),
                        String::from_utf8_lossy(&value)
                    );
                    if self.options.emit_aux {
                        self.emit(TypeObject::Aux(AuxField { field, value }))?;
                    }
                }
                OPCODE_RESIZEDB => {
                    let db_size = self.reader.read_len()?;
                    let expire_size = self.reader.read_len()?;
                    self.emit(TypeObject::ResizeDb(ResizeDb {
                        db_size,
                        expire_size,
                    }))?;
                }
                OPCODE_EXPIRETIME_MS => {
                    self.pending_expire_ms = self.reader.read_u64_le()? as i64;
                }
                OPCODE_EXPIRETIME => {
                    let secs = self.reader.read_u32_le()? as i64;
                    self.pending_expire_ms = secs * 1000;
                }
                OPCODE_SELECTDB => {
                    let index = self.reader.read_len()?;
                    if self.select_forwarded {
                        debug!("ignoring select db {} after the first selector", index);
                    } else {
                        self.select_forwarded = true;
                        self.emit(TypeObject::SelectDb(SelectDb { index }))?;
                    }
                }
                OPCODE_FUNCTION2 => {
                    let _library = self.reader.read_string()?;
                }
                OPCODE_MODULE_AUX => {
                    return Err(Error::format(format!(
                        "module aux data at offset {} is not supported",
                        self.reader.offset() - 1
                    )));
                }
                OPCODE_EOF => {
                    debug!(
                        "reached EOF opcode after {} keys, {} bytes",
                        self.keys,
                        self.reader.offset()
                    );
                    return self.handler.finish();
                }
                tag => self.read_key_value(tag)?,
            }
        }
    }

    fn read_header(&mut self) -> Result<()> {
        let mut header = [0u8; 9];
        self.reader.read_into(&mut header)?;

        if &header[..5] != RDB_MAGIC {
            return Err(Error::format("bad magic, not an RDB stream"));
        }
        let digits = &header[5..];
        let version = std::str::from_utf8(digits)
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| {
                Error::format(format!(
                    "bad version digits {:?}",
                    String::from_utf8_lossy(digits)
                ))
            })?;
        if !(RDB_VERSION_MIN..=RDB_VERSION_MAX).contains(&version) {
            return Err(Error::format(format!("unsupported rdb version {}", version)));
        }

        let banner = String::from_utf8_lossy(&header).into_owned();
        debug!("rdb header {}", banner);
        self.banner = Some(banner);
        Ok(())
    }

    fn read_key_value(&mut self, tag: u8) -> Result<()> {
        let name = self.reader.read_string()?;
        let key = KeyObject::new(name, self.pending_expire_ms);
        self.pending_expire_ms = 0;

        let records = decode::decode_value(&mut self.reader, tag, key)?;
        self.keys += 1;
        for obj in records {
            self.emit(obj)?;
        }
        Ok(())
    }

    #[inline]
    fn emit(&mut self, obj: TypeObject) -> Result<()> {
        self.handler.handle(&self.cancel, obj)
    }
}

/// Parse `reader` into `handler` and return the header banner
pub fn parse<R: Read, H: Handler>(
    reader: R,
    handler: H,
    cancel: CancelToken,
    options: ParseOptions,
) -> Result<String> {
    let mut parser = Parser::new(reader, handler, cancel, options);
    parser.parse()?;
    Ok(parser.version().unwrap_or_default().to_string())
}
