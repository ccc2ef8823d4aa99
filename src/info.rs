/*!
 * Snapshot Info
 *
 * Summarises a snapshot without materialising it anywhere: the server
 * metadata carried in aux fields, optional per-database/per-type key counts
 * and an optional list of big keys.
 *
 * When only the metadata is wanted the parse is cut short as soon as the four
 * interesting aux fields were seen; they precede every key in practice.
 */

use crate::error::{Error, Result};
use crate::object::TypeObject;
use crate::parser::{CancelToken, Handler, ParseOptions, Parser};
use ahash::RandomState;
use hashbrown::HashMap;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;

/// Value size above which a key is big unless configured otherwise
pub const DEFAULT_BIG_KEY_SIZE: u64 = 1024 * 1024;

/// What the collector gathers
#[derive(Debug, Clone)]
pub struct InfoOptions {
    /// Stop once the server metadata is complete
    pub only_info: bool,
    /// Count keys and bytes per database and type
    pub key_statistics: bool,
    /// List keys over the big-key thresholds
    pub big_key: bool,
    /// Default size threshold for every type
    pub big_key_size: u64,
    /// Per-type overrides keyed by type name (`String`, `Hash`, ...)
    pub thresholds: HashMap<String, BigKeyThreshold, RandomState>,
}

impl Default for InfoOptions {
    fn default() -> Self {
        Self {
            only_info: true,
            key_statistics: false,
            big_key: false,
            big_key_size: DEFAULT_BIG_KEY_SIZE,
            thresholds: HashMap::default(),
        }
    }
}

/// A key is big when its payload exceeds `value_size` bytes or it holds at
/// least `member_len` elements; zero disables either test
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BigKeyThreshold {
    pub value_size: u64,
    pub member_len: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RdbInfo {
    pub rdb_version: String,
    pub redis_version: String,
    pub redis_bits: u32,
    pub ctime: i64,
    pub used_mem: i64,
    /// database -> type name -> counters
    pub key_statistics: BTreeMap<u64, BTreeMap<String, KeyStatistics>>,
}

impl RdbInfo {
    fn is_complete(&self) -> bool {
        !self.redis_version.is_empty() && self.redis_bits != 0 && self.ctime != 0 && self.used_mem != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyStatistics {
    pub count: u64,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub big_keys: Vec<BigKeyInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BigKeyInfo {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub size: u64,
    pub len: u64,
}

/// [`Handler`] that fills an [`RdbInfo`]
pub struct InfoCollector {
    options: InfoOptions,
    info: RdbInfo,
    stats: HashMap<(u64, &'static str), KeyStatistics, RandomState>,
    db: u64,
    stopped_early: bool,
}

impl InfoCollector {
    pub fn new(options: InfoOptions) -> Self {
        Self {
            options,
            info: RdbInfo::default(),
            stats: HashMap::default(),
            db: 0,
            stopped_early: false,
        }
    }

    /// Consume the collector into the report
    pub fn into_info(mut self) -> RdbInfo {
        for ((db, kind), stats) in self.stats.drain() {
            self.info
                .key_statistics
                .entry(db)
                .or_default()
                .insert(kind.to_string(), stats);
        }
        self.info
    }

    fn threshold(&self, kind: &str) -> BigKeyThreshold {
        let mut t = self.options.thresholds.get(kind).copied().unwrap_or_default();
        if t.value_size == 0 {
            t.value_size = self.options.big_key_size;
        }
        t
    }

    fn aux(&mut self, field: &[u8], value: &[u8]) -> Result<()> {
        let value = String::from_utf8_lossy(value);
        let bad = |what: &str| Error::format(format!("aux field {} is not a number: {:?}", what, value));
        match field {
            b"redis-ver" => self.info.redis_version = value.to_string(),
            b"redis-bits" => self.info.redis_bits = value.parse().map_err(|_| bad("redis-bits"))?,
            b"ctime" => self.info.ctime = value.parse().map_err(|_| bad("ctime"))?,
            b"used-mem" => self.info.used_mem = value.parse().map_err(|_| bad("used-mem"))?,
            _ => {}
        }
        if self.options.only_info && self.info.is_complete() {
            debug!("server metadata complete, stopping early");
            self.stopped_early = true;
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn key(&mut self, obj: &TypeObject) {
        let kind = obj.type_name();
        let size = obj.concrete_size();

        if self.options.big_key {
            let len = obj.value_len();
            let t = self.threshold(kind);
            let big = (t.value_size > 0 && size > t.value_size) || (t.member_len > 0 && len >= t.member_len);
            if big {
                let stats = self.stats.entry((self.db, kind)).or_default();
                stats.count += 1;
                stats.total_size += size;
                stats.big_keys.push(BigKeyInfo {
                    key: obj.key().into_owned(),
                    kind,
                    size,
                    len,
                });
            }
            return;
        }

        if self.options.key_statistics {
            let stats = self.stats.entry((self.db, kind)).or_default();
            stats.count += 1;
            stats.total_size += size;
        }
    }
}

impl Handler for InfoCollector {
    fn handle(&mut self, _cancel: &CancelToken, obj: TypeObject) -> Result<()> {
        match &obj {
            TypeObject::Aux(a) => self.aux(&a.field, &a.value),
            TypeObject::SelectDb(s) => {
                self.db = s.index;
                Ok(())
            }
            TypeObject::ResizeDb(_) => Ok(()),
            keyed => {
                self.key(keyed);
                Ok(())
            }
        }
    }
}

/// Collect an [`RdbInfo`] from `reader`
///
/// # Arguments
/// * `reader` - RDB byte stream
/// * `options` - What to gather
/// * `cancel` - External cancellation; still reported as `Error::Cancelled`
pub fn collect_info<R: Read>(reader: R, options: InfoOptions, cancel: CancelToken) -> Result<RdbInfo> {
    let mut collector = InfoCollector::new(options);
    let mut parser = Parser::new(reader, &mut collector, cancel, ParseOptions { emit_aux: true });
    let result = parser.parse();
    let banner = parser.version().unwrap_or_default().to_string();
    drop(parser);

    match result {
        Ok(()) => {}
        Err(Error::Cancelled) if collector.stopped_early => {}
        Err(e) => return Err(e),
    }
    let mut info = collector.into_info();
    info.rdb_version = banner;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{AuxField, KeyObject, SelectDb, SetValue, StringValue};

    fn aux(field: &str, value: &str) -> TypeObject {
        TypeObject::Aux(AuxField {
            field: field.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        })
    }

    fn aux_bytes(out: &mut Vec<u8>, field: &str, value: &str) {
        out.push(0xFA);
        out.push(field.len() as u8);
        out.extend_from_slice(field.as_bytes());
        out.push(value.len() as u8);
        out.extend_from_slice(value.as_bytes());
    }

    #[test]
    fn stops_once_metadata_is_complete() {
        let mut c = InfoCollector::new(InfoOptions::default());
        let cancel = CancelToken::new();
        c.handle(&cancel, aux("redis-ver", "7.2.4")).unwrap();
        c.handle(&cancel, aux("redis-bits", "64")).unwrap();
        c.handle(&cancel, aux("ctime", "1700000000")).unwrap();
        let err = c.handle(&cancel, aux("used-mem", "1048576")).unwrap_err();
        assert!(err.is_cancelled());
        assert!(c.stopped_early);
    }

    #[test]
    fn collect_info_suppresses_early_stop() {
        let mut bytes = b"REDIS0011".to_vec();
        aux_bytes(&mut bytes, "redis-ver", "7.2.4");
        aux_bytes(&mut bytes, "redis-bits", "64");
        aux_bytes(&mut bytes, "ctime", "1700000000");
        aux_bytes(&mut bytes, "used-mem", "2048");
        // no EOF: the parse must stop before it would fail
        let info = collect_info(&bytes[..], InfoOptions::default(), CancelToken::new()).unwrap();
        assert_eq!(info.rdb_version, "REDIS0011");
        assert_eq!(info.redis_version, "7.2.4");
        assert_eq!(info.redis_bits, 64);
        assert_eq!(info.ctime, 1_700_000_000);
        assert_eq!(info.used_mem, 2048);
    }

    #[test]
    fn bad_number_is_a_format_error() {
        let mut c = InfoCollector::new(InfoOptions::default());
        let err = c
            .handle(&CancelToken::new(), aux("redis-bits", "sixty-four"))
            .unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn statistics_per_db_and_type() {
        let mut c = InfoCollector::new(InfoOptions {
            only_info: false,
            key_statistics: true,
            ..Default::default()
        });
        let cancel = CancelToken::new();
        c.handle(&cancel, TypeObject::SelectDb(SelectDb { index: 2 })).unwrap();
        for v in ["abc", "de"] {
            c.handle(
                &cancel,
                TypeObject::String(StringValue {
                    key: KeyObject::new(v.as_bytes(), 0),
                    value: v.as_bytes().to_vec(),
                }),
            )
            .unwrap();
        }
        let info = c.into_info();
        let s = &info.key_statistics[&2]["String"];
        assert_eq!(s.count, 2);
        assert_eq!(s.total_size, 5);
        assert!(s.big_keys.is_empty());
    }

    #[test]
    fn big_keys_by_size_and_member_count() {
        let mut thresholds = HashMap::default();
        thresholds.insert(
            "Set".to_string(),
            BigKeyThreshold {
                value_size: 0,
                member_len: 3,
            },
        );
        let mut c = InfoCollector::new(InfoOptions {
            only_info: false,
            big_key: true,
            big_key_size: 4,
            thresholds,
            ..Default::default()
        });
        let cancel = CancelToken::new();
        let string = |k: &str, v: &str| {
            TypeObject::String(StringValue {
                key: KeyObject::new(k.as_bytes(), 0),
                value: v.as_bytes().to_vec(),
            })
        };
        c.handle(&cancel, string("small", "abcd")).unwrap();
        c.handle(&cancel, string("large", "abcde")).unwrap();
        c.handle(
            &cancel,
            TypeObject::Set(SetValue {
                key: KeyObject::new(b"members".to_vec(), 0),
                members: vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
            }),
        )
        .unwrap();

        let info = c.into_info();
        let strings = &info.key_statistics[&0]["String"];
        assert_eq!(strings.count, 1);
        assert_eq!(strings.big_keys[0].key, "large");
        let sets = &info.key_statistics[&0]["Set"];
        assert_eq!(sets.big_keys[0].len, 3);
    }
}
