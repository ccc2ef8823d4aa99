/*!
 * Object Decoders
 *
 * One decoder per value type tag. Each decoder consumes exactly the bytes of
 * one value from the [`RdbReader`] and returns the records it produced.
 * Quicklists return one list record per node; every other type returns a
 * single record.
 *
 * Any malformed or truncated input aborts the decode with an error before a
 * record for that key is handed out.
 */

use crate::codec::{parse_float, RdbReader};
use crate::error::{Error, Result};
use crate::object::*;
use crate::{intset, listpack, ziplist, zipmap};
use std::collections::BTreeMap;
use std::io::Read;

pub const TYPE_STRING: u8 = 0;
pub const TYPE_LIST: u8 = 1;
pub const TYPE_SET: u8 = 2;
pub const TYPE_ZSET: u8 = 3;
pub const TYPE_HASH: u8 = 4;
pub const TYPE_ZSET_2: u8 = 5;
pub const TYPE_MODULE: u8 = 6;
pub const TYPE_MODULE_2: u8 = 7;
pub const TYPE_HASH_ZIPMAP: u8 = 9;
pub const TYPE_LIST_ZIPLIST: u8 = 10;
pub const TYPE_SET_INTSET: u8 = 11;
pub const TYPE_ZSET_ZIPLIST: u8 = 12;
pub const TYPE_HASH_ZIPLIST: u8 = 13;
pub const TYPE_LIST_QUICKLIST: u8 = 14;
pub const TYPE_STREAM_LISTPACKS: u8 = 15;
pub const TYPE_HASH_LISTPACK: u8 = 16;
pub const TYPE_ZSET_LISTPACK: u8 = 17;
pub const TYPE_LIST_QUICKLIST_2: u8 = 18;
pub const TYPE_STREAM_LISTPACKS_2: u8 = 19;
pub const TYPE_SET_LISTPACK: u8 = 20;
pub const TYPE_STREAM_LISTPACKS_3: u8 = 21;

/// Quicklist v2 node containers
const QUICKLIST_NODE_PLAIN: u64 = 1;
const QUICKLIST_NODE_PACKED: u64 = 2;

const STREAM_ITEM_FLAG_DELETED: i64 = 1;
const STREAM_ITEM_FLAG_SAME_FIELDS: i64 = 2;

/// Decode the value for `key` according to its type tag
///
/// # Arguments
/// * `r` - Reader positioned right after the key string
/// * `tag` - Type byte read before the key
/// * `key` - Key header, consumed by the produced records
///
/// # Returns
/// * The decoded records, in stream order
/// * `Error::Format` for unsupported tags or malformed payloads
pub fn decode_value<R: Read>(
    r: &mut RdbReader<R>,
    tag: u8,
    key: KeyObject,
) -> Result<Vec<TypeObject>> {
    let obj = match tag {
        TYPE_STRING => TypeObject::String(StringValue {
            key,
            value: r.read_string()?,
        }),
        TYPE_LIST => TypeObject::List(ListValue {
            key,
            entries: read_strings(r)?,
        }),
        TYPE_SET => TypeObject::Set(SetValue {
            key,
            members: read_strings(r)?,
        }),
        TYPE_ZSET | TYPE_ZSET_2 => {
            let n = r.read_len()?;
            let mut entries = Vec::with_capacity(capacity(n));
            for _ in 0..n {
                let member = r.read_string()?;
                let score = if tag == TYPE_ZSET_2 {
                    r.read_float_binary()?
                } else {
                    r.read_float_text()?
                };
                entries.push((member, score));
            }
            TypeObject::SortedSet(SortedSetValue { key, entries })
        }
        TYPE_HASH => {
            let n = r.read_len()?;
            let mut entries = Vec::with_capacity(capacity(n));
            for _ in 0..n {
                let field = r.read_string()?;
                let value = r.read_string()?;
                entries.push((field, value));
            }
            TypeObject::Hash(HashValue { key, entries })
        }
        TYPE_MODULE | TYPE_MODULE_2 => {
            return Err(Error::format(format!(
                "module value type {} is not supported",
                tag
            )))
        }
        TYPE_HASH_ZIPMAP => TypeObject::Hash(HashValue {
            key,
            entries: zipmap::decode(&r.read_string()?)?,
        }),
        TYPE_LIST_ZIPLIST => TypeObject::List(ListValue {
            key,
            entries: ziplist::decode(&r.read_string()?)?,
        }),
        TYPE_SET_INTSET => TypeObject::Set(SetValue {
            key,
            members: intset::decode(&r.read_string()?)?,
        }),
        TYPE_SET_LISTPACK => TypeObject::Set(SetValue {
            key,
            members: listpack::decode(&r.read_string()?)?,
        }),
        TYPE_ZSET_ZIPLIST => TypeObject::SortedSet(SortedSetValue {
            key,
            entries: scored(ziplist::decode_pairs(&r.read_string()?)?)?,
        }),
        TYPE_ZSET_LISTPACK => TypeObject::SortedSet(SortedSetValue {
            key,
            entries: scored(listpack::decode_pairs(&r.read_string()?)?)?,
        }),
        TYPE_HASH_ZIPLIST => TypeObject::Hash(HashValue {
            key,
            entries: ziplist::decode_pairs(&r.read_string()?)?,
        }),
        TYPE_HASH_LISTPACK => TypeObject::Hash(HashValue {
            key,
            entries: listpack::decode_pairs(&r.read_string()?)?,
        }),
        TYPE_LIST_QUICKLIST => return read_quicklist(r, key),
        TYPE_LIST_QUICKLIST_2 => return read_quicklist_2(r, key),
        TYPE_STREAM_LISTPACKS => TypeObject::Stream(read_stream(r, key, 1)?),
        TYPE_STREAM_LISTPACKS_2 => TypeObject::Stream(read_stream(r, key, 2)?),
        TYPE_STREAM_LISTPACKS_3 => TypeObject::Stream(read_stream(r, key, 3)?),
        other => {
            return Err(Error::format(format!(
                "unknown value type {} at offset {}",
                other,
                r.offset()
            )))
        }
    };
    Ok(vec![obj])
}

/// Cap preallocation so a corrupt length cannot exhaust memory up front
#[inline]
fn capacity(n: u64) -> usize {
    n.min(4096) as usize
}

fn read_strings<R: Read>(r: &mut RdbReader<R>) -> Result<Vec<Vec<u8>>> {
    let n = r.read_len()?;
    let mut out = Vec::with_capacity(capacity(n));
    for _ in 0..n {
        out.push(r.read_string()?);
    }
    Ok(out)
}

fn scored(pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<(Vec<u8>, f64)>> {
    pairs
        .into_iter()
        .map(|(member, score)| Ok((member, parse_float(&score)?)))
        .collect()
}

fn read_quicklist<R: Read>(r: &mut RdbReader<R>, key: KeyObject) -> Result<Vec<TypeObject>> {
    let nodes = r.read_len()?;
    let mut out = Vec::with_capacity(capacity(nodes));
    for _ in 0..nodes {
        let entries = ziplist::decode(&r.read_string()?)?;
        out.push(TypeObject::List(ListValue {
            key: key.clone(),
            entries,
        }));
    }
    Ok(out)
}

fn read_quicklist_2<R: Read>(r: &mut RdbReader<R>, key: KeyObject) -> Result<Vec<TypeObject>> {
    let nodes = r.read_len()?;
    let mut out = Vec::with_capacity(capacity(nodes));
    for _ in 0..nodes {
        let container = r.read_len()?;
        let blob = r.read_string()?;
        let entries = match container {
            QUICKLIST_NODE_PLAIN => vec![blob],
            QUICKLIST_NODE_PACKED => listpack::decode(&blob)?,
            other => {
                return Err(Error::format(format!(
                    "unknown quicklist container {}",
                    other
                )))
            }
        };
        out.push(TypeObject::List(ListValue {
            key: key.clone(),
            entries,
        }));
    }
    Ok(out)
}

fn read_raw_id<R: Read>(r: &mut RdbReader<R>) -> Result<StreamId> {
    let mut raw = [0u8; 16];
    r.read_into(&mut raw)?;
    Ok(StreamId::from_raw(&raw))
}

fn read_len_id<R: Read>(r: &mut RdbReader<R>) -> Result<StreamId> {
    let ms = r.read_len()?;
    let seq = r.read_len()?;
    Ok(StreamId::new(ms, seq))
}

/// Decode a stream value; `version` is 1, 2 or 3 for tags 15, 19 and 21
fn read_stream<R: Read>(r: &mut RdbReader<R>, key: KeyObject, version: u8) -> Result<StreamValue> {
    let mut stream = StreamValue {
        key,
        ..Default::default()
    };

    let nodes = r.read_len()?;
    for _ in 0..nodes {
        let master = r.read_string()?;
        let master: &[u8; 16] = master.as_slice().try_into().map_err(|_| {
            Error::format(format!(
                "stream node id must be 16 bytes, got {}",
                master.len()
            ))
        })?;
        let master = StreamId::from_raw(master);
        let lp = listpack::decode(&r.read_string()?)?;
        read_stream_node(master, lp, &mut stream.entries)?;
    }

    stream.length = r.read_len()?;
    stream.last_id = read_len_id(r)?;
    if version >= 2 {
        stream.first_id = Some(read_len_id(r)?);
        stream.max_deleted_id = Some(read_len_id(r)?);
        stream.entries_added = Some(r.read_len()?);
    }

    let groups = r.read_len()?;
    for _ in 0..groups {
        stream.groups.push(read_stream_group(r, version)?);
    }
    Ok(stream)
}

fn read_stream_group<R: Read>(r: &mut RdbReader<R>, version: u8) -> Result<StreamGroup> {
    let name = r.read_string()?;
    let last_id = read_len_id(r)?;
    let entries_read = if version >= 2 {
        Some(r.read_len()?)
    } else {
        None
    };

    let pel_len = r.read_len()?;
    let mut pel: hashbrown::HashMap<StreamId, PendingEntry> =
        hashbrown::HashMap::with_capacity(capacity(pel_len));
    for _ in 0..pel_len {
        let id = read_raw_id(r)?;
        let delivery_time = r.read_u64_le()?;
        let delivery_count = r.read_len()?;
        pel.insert(
            id,
            PendingEntry {
                delivery_time,
                delivery_count,
            },
        );
    }

    let consumer_count = r.read_len()?;
    let mut consumers = Vec::with_capacity(capacity(consumer_count));
    for _ in 0..consumer_count {
        let cname = r.read_string()?;
        let seen_time = r.read_u64_le()?;
        let active_time = if version >= 3 {
            Some(r.read_u64_le()?)
        } else {
            None
        };

        let n = r.read_len()?;
        let mut pending = BTreeMap::new();
        for _ in 0..n {
            let id = read_raw_id(r)?;
            let entry = pel.get(&id).copied().ok_or_else(|| {
                Error::format(format!(
                    "consumer {} references pending entry {} missing from the group PEL",
                    String::from_utf8_lossy(&cname),
                    id
                ))
            })?;
            pending.insert(id, entry);
        }

        consumers.push(StreamConsumer {
            name: cname,
            seen_time,
            active_time,
            pending,
        });
    }

    Ok(StreamGroup {
        name,
        last_id,
        entries_read,
        pending: pel.into_iter().collect(),
        consumers,
    })
}

/// Walks the decoded listpack of one stream node
struct NodeCursor {
    items: std::vec::IntoIter<Vec<u8>>,
}

impl NodeCursor {
    fn bytes(&mut self) -> Result<Vec<u8>> {
        self.items
            .next()
            .ok_or_else(|| Error::format("stream listpack ended early"))
    }

    fn int(&mut self) -> Result<i64> {
        let raw = self.bytes()?;
        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                Error::format(format!(
                    "expected an integer in stream listpack, found {:?}",
                    String::from_utf8_lossy(&raw)
                ))
            })
    }

    fn count(&mut self) -> Result<u64> {
        u64::try_from(self.int()?).map_err(|_| Error::format("negative count in stream listpack"))
    }
}

/// Node layout:
/// `count deleted num_fields field... 0` then per entry
/// `flags ms_delta seq_delta [num_fields field...] value... lp_count`
fn read_stream_node(
    master: StreamId,
    lp: Vec<Vec<u8>>,
    out: &mut BTreeMap<StreamId, StreamEntry>,
) -> Result<()> {
    let mut cur = NodeCursor {
        items: lp.into_iter(),
    };

    let count = cur.count()?;
    let deleted = cur.count()?;
    let master_fields_len = cur.count()?;
    let mut master_fields = Vec::with_capacity(capacity(master_fields_len));
    for _ in 0..master_fields_len {
        master_fields.push(cur.bytes()?);
    }
    cur.bytes()?; // master terminator

    for _ in 0..count.saturating_add(deleted) {
        let flags = cur.int()?;
        let ms_delta = cur.count()?;
        let seq_delta = cur.count()?;
        let id = master.offset_by(ms_delta, seq_delta);

        let fields = if flags & STREAM_ITEM_FLAG_SAME_FIELDS != 0 {
            let mut fields = Vec::with_capacity(master_fields.len());
            for f in &master_fields {
                fields.push((f.clone(), cur.bytes()?));
            }
            fields
        } else {
            let n = cur.count()?;
            let mut fields = Vec::with_capacity(capacity(n));
            for _ in 0..n {
                let f = cur.bytes()?;
                let v = cur.bytes()?;
                fields.push((f, v));
            }
            fields
        };
        cur.bytes()?; // lp-count

        out.insert(
            id,
            StreamEntry {
                deleted: flags & STREAM_ITEM_FLAG_DELETED != 0,
                fields,
            },
        );
    }

    if cur.items.next().is_some() {
        return Err(Error::format("trailing entries in stream listpack"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listpack::tests::{build as lp_build, int_entry, str_entry};

    fn rdb_string(out: &mut Vec<u8>, s: &[u8]) {
        assert!(s.len() < 16384);
        if s.len() < 64 {
            out.push(s.len() as u8);
        } else {
            out.push(0x40 | (s.len() >> 8) as u8);
            out.push(s.len() as u8);
        }
        out.extend_from_slice(s);
    }

    fn decode_bytes(tag: u8, bytes: &[u8]) -> Result<Vec<TypeObject>> {
        let mut r = RdbReader::new(bytes);
        decode_value(&mut r, tag, KeyObject::new(b"k".to_vec(), 0))
    }

    fn stream_node_listpack() -> Vec<u8> {
        lp_build(&[
            int_entry(2), // count
            int_entry(1), // deleted
            int_entry(1), // master fields
            str_entry(b"f"),
            int_entry(0), // terminator
            // entry 1: same fields, id +0-0
            int_entry(STREAM_ITEM_FLAG_SAME_FIELDS),
            int_entry(0),
            int_entry(0),
            str_entry(b"v1"),
            int_entry(4),
            // entry 2: deleted, same fields, id +0-1
            int_entry(STREAM_ITEM_FLAG_SAME_FIELDS | STREAM_ITEM_FLAG_DELETED),
            int_entry(0),
            int_entry(1),
            str_entry(b"v2"),
            int_entry(4),
            // entry 3: own fields, id +5-0
            int_entry(0),
            int_entry(5),
            int_entry(0),
            int_entry(1),
            str_entry(b"g"),
            str_entry(b"v3"),
            int_entry(6),
        ])
    }

    fn stream_payload(version: u8, consumer_pending: &[u8; 16]) -> Vec<u8> {
        let mut master = [0u8; 16];
        master[..8].copy_from_slice(&100u64.to_be_bytes());

        let mut pending_id = [0u8; 16];
        pending_id[..8].copy_from_slice(&105u64.to_be_bytes());

        let mut b = vec![1]; // one node
        rdb_string(&mut b, &master);
        rdb_string(&mut b, &stream_node_listpack());
        b.push(2); // length
        b.extend_from_slice(&[0x40, 105, 0]); // last id 105-0
        if version >= 2 {
            b.extend_from_slice(&[0x40, 100, 0]); // first id
            b.extend_from_slice(&[0x40, 100, 1]); // max deleted
            b.push(3); // entries added
        }
        b.push(1); // groups
        rdb_string(&mut b, b"grp");
        b.extend_from_slice(&[0x40, 105, 0]);
        if version >= 2 {
            b.push(2); // entries read
        }
        b.push(1); // group PEL
        b.extend_from_slice(&pending_id);
        b.extend_from_slice(&77u64.to_le_bytes());
        b.push(1); // delivery count
        b.push(1); // consumers
        rdb_string(&mut b, b"alice");
        b.extend_from_slice(&88u64.to_le_bytes());
        if version >= 3 {
            b.extend_from_slice(&99u64.to_le_bytes());
        }
        b.push(1);
        b.extend_from_slice(consumer_pending);
        b
    }

    fn pel_id() -> [u8; 16] {
        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&105u64.to_be_bytes());
        id
    }

    #[test]
    fn plain_hash_and_zset() {
        let mut b = vec![1];
        rdb_string(&mut b, b"f");
        rdb_string(&mut b, b"v");
        let got = decode_bytes(TYPE_HASH, &b).unwrap();
        assert_eq!(got[0].value_len(), 1);

        let mut b = vec![1];
        rdb_string(&mut b, b"m");
        b.extend_from_slice(&2.5f64.to_le_bytes());
        match &decode_bytes(TYPE_ZSET_2, &b).unwrap()[0] {
            TypeObject::SortedSet(z) => assert_eq!(z.entries, vec![(b"m".to_vec(), 2.5)]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn quicklist_2_mixes_plain_and_packed_nodes() {
        let mut b = vec![2];
        b.push(QUICKLIST_NODE_PLAIN as u8);
        rdb_string(&mut b, b"big-element");
        b.push(QUICKLIST_NODE_PACKED as u8);
        rdb_string(&mut b, &lp_build(&[str_entry(b"a"), int_entry(-7)]));

        let got = decode_bytes(TYPE_LIST_QUICKLIST_2, &b).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].value(), "big-element");
        assert_eq!(got[1].value(), "a,-7");
    }

    #[test]
    fn listpack_set_and_zset() {
        let mut b = Vec::new();
        rdb_string(&mut b, &lp_build(&[str_entry(b"x"), int_entry(12)]));
        assert_eq!(decode_bytes(TYPE_SET_LISTPACK, &b).unwrap()[0].value(), "x,12");

        let mut b = Vec::new();
        rdb_string(&mut b, &lp_build(&[str_entry(b"m"), str_entry(b"1.25")]));
        match &decode_bytes(TYPE_ZSET_LISTPACK, &b).unwrap()[0] {
            TypeObject::SortedSet(z) => assert_eq!(z.entries, vec![(b"m".to_vec(), 1.25)]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stream_versions_decode() {
        for (tag, version) in [
            (TYPE_STREAM_LISTPACKS, 1),
            (TYPE_STREAM_LISTPACKS_2, 2),
            (TYPE_STREAM_LISTPACKS_3, 3),
        ] {
            let got = decode_bytes(tag, &stream_payload(version, &pel_id())).unwrap();
            let s = match &got[0] {
                TypeObject::Stream(s) => s,
                other => panic!("unexpected {:?}", other),
            };
            let ids: Vec<String> = s.entries.keys().map(|id| id.to_string()).collect();
            assert_eq!(ids, vec!["100-0", "100-1", "105-0"]);
            assert!(s.entries[&StreamId::new(100, 1)].deleted);
            assert_eq!(
                s.entries[&StreamId::new(105, 0)].fields,
                vec![(b"g".to_vec(), b"v3".to_vec())]
            );
            assert_eq!(s.last_id, StreamId::new(105, 0));
            assert_eq!(s.entries_added.is_some(), version >= 2);

            let g = &s.groups[0];
            assert_eq!(g.entries_read, (version >= 2).then_some(2));
            let c = &g.consumers[0];
            assert_eq!(c.seen_time, 88);
            assert_eq!(c.active_time, (version >= 3).then_some(99));
            assert_eq!(
                c.pending[&StreamId::new(105, 0)],
                PendingEntry {
                    delivery_time: 77,
                    delivery_count: 1
                }
            );
        }
    }

    #[test]
    fn consumer_pending_missing_from_group_fails() {
        let mut bogus = [0u8; 16];
        bogus[7] = 1;
        let err = decode_bytes(TYPE_STREAM_LISTPACKS, &stream_payload(1, &bogus)).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn unsupported_tags_fail() {
        assert!(matches!(decode_bytes(TYPE_MODULE_2, &[]), Err(Error::Format(_))));
        assert!(matches!(decode_bytes(8, &[]), Err(Error::Format(_))));
        assert!(matches!(decode_bytes(42, &[]), Err(Error::Format(_))));
    }

    #[test]
    fn truncated_plain_list_fails() {
        let mut b = vec![3];
        rdb_string(&mut b, b"a");
        assert!(decode_bytes(TYPE_LIST, &b).is_err());
    }
}
