/*!
 * Record Formatters
 *
 * Line oriented handlers: every decoded record becomes one line on the
 * wrapped writer, either as a JSON object or as the `type:..|key:..` text
 * form.
 */

use crate::error::Result;
use crate::object::TypeObject;
use crate::parser::{parse, CancelToken, Handler, ParseOptions};
use std::io::{Read, Write};

/// Writes each record as one JSON line
pub struct JsonWriter<W: Write> {
    out: W,
    lines: u64,
}

impl<W: Write> JsonWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, lines: 0 }
    }

    /// Lines written so far
    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Handler for JsonWriter<W> {
    fn handle(&mut self, _cancel: &CancelToken, obj: TypeObject) -> Result<()> {
        let data = obj.to_json().map_err(std::io::Error::from)?;
        self.out.write_all(&data)?;
        self.out.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Writes each record as one `type:T|key:K|value:V|expire:E` line
pub struct KvWriter<W: Write> {
    out: W,
    lines: u64,
}

impl<W: Write> KvWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, lines: 0 }
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Handler for KvWriter<W> {
    fn handle(&mut self, _cancel: &CancelToken, obj: TypeObject) -> Result<()> {
        let line = obj.to_kv();
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Parse `reader` and write every record to `out` as JSON lines
///
/// # Returns
/// * The header banner, e.g. `REDIS0009`
pub fn parse_to_json<R: Read, W: Write>(
    reader: R,
    out: W,
    cancel: CancelToken,
    options: ParseOptions,
) -> Result<String> {
    parse(reader, JsonWriter::new(out), cancel, options)
}

/// Parse `reader` and write every record to `out` in the key/value text form
pub fn parse_to_kv<R: Read, W: Write>(
    reader: R,
    out: W,
    cancel: CancelToken,
    options: ParseOptions,
) -> Result<String> {
    parse(reader, KvWriter::new(out), cancel, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{KeyObject, ListValue, SelectDb, StringValue};

    fn string(key: &str, value: &str, exp: i64) -> TypeObject {
        TypeObject::String(StringValue {
            key: KeyObject::new(key.as_bytes(), exp),
            value: value.as_bytes().to_vec(),
        })
    }

    #[test]
    fn json_lines() {
        let cancel = CancelToken::new();
        let mut w = JsonWriter::new(Vec::new());
        w.handle(&cancel, string("k", "v", 0)).unwrap();
        w.handle(&cancel, TypeObject::SelectDb(SelectDb { index: 3 }))
            .unwrap();
        w.finish().unwrap();
        assert_eq!(w.lines(), 2);

        let out = String::from_utf8(w.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["key"], "k");
        assert_eq!(first["value"], "v");
        assert!(first.get("expire").is_none());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["Index"], 3);
    }

    #[test]
    fn kv_lines() {
        let cancel = CancelToken::new();
        let mut w = KvWriter::new(Vec::new());
        w.handle(
            &cancel,
            TypeObject::List(ListValue {
                key: KeyObject::new(b"l".to_vec(), 42),
                entries: vec![b"a".to_vec(), b"b".to_vec()],
            }),
        )
        .unwrap();
        let out = String::from_utf8(w.into_inner()).unwrap();
        assert_eq!(out, "type:List|key:l|value:a,b|expire:42\n");
    }

    #[test]
    fn parse_minimal_file_writes_nothing() {
        let mut out = Vec::new();
        let banner = parse_to_json(
            &b"REDIS0009\xFF"[..],
            &mut out,
            CancelToken::new(),
            ParseOptions::default(),
        )
        .unwrap();
        assert_eq!(banner, "REDIS0009");
        assert!(out.is_empty());
    }
}
