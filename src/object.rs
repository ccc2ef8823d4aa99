/*!
 * Decoded Records
 *
 * Every object the parser produces is a [`TypeObject`]. Keyed variants carry
 * the [`KeyObject`] that introduced them (name plus absolute expiry), control
 * variants describe database switches, resize hints and aux metadata.
 *
 * Records know how to render themselves for the text sinks (`value`,
 * `to_json`, `to_kv`) and how to project themselves onto the write commands
 * a destination store should receive (`command`).
 */

use serde::Serialize;
use serde_json::{json, Map, Value as Json};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// Key header shared by all keyed records
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyObject {
    pub name: Vec<u8>,
    /// Absolute expiry in unix milliseconds, 0 when the key never expires
    pub expire_at_ms: i64,
}

impl KeyObject {
    pub fn new(name: impl Into<Vec<u8>>, expire_at_ms: i64) -> Self {
        Self {
            name: name.into(),
            expire_at_ms,
        }
    }

    #[inline]
    pub fn has_expiry(&self) -> bool {
        self.expire_at_ms > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringValue {
    pub key: KeyObject,
    pub value: Vec<u8>,
}

/// One list node; quicklists yield one of these per node
#[derive(Debug, Clone, PartialEq)]
pub struct ListValue {
    pub key: KeyObject,
    pub entries: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashValue {
    pub key: KeyObject,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetValue {
    pub key: KeyObject,
    pub members: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortedSetValue {
    pub key: KeyObject,
    /// `(member, score)` in stored order
    pub entries: Vec<(Vec<u8>, f64)>,
}

/// Composite stream entry id; ordering is numeric on `(ms, seq)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Parse the 16 byte big endian form used for master ids and PELs
    pub fn from_raw(raw: &[u8; 16]) -> Self {
        let mut ms = [0u8; 8];
        let mut seq = [0u8; 8];
        ms.copy_from_slice(&raw[..8]);
        seq.copy_from_slice(&raw[8..]);
        Self {
            ms: u64::from_be_bytes(ms),
            seq: u64::from_be_bytes(seq),
        }
    }

    /// Apply the per-entry deltas stored in a listpack node
    pub fn offset_by(&self, ms_delta: u64, seq_delta: u64) -> Self {
        Self {
            ms: self.ms.wrapping_add(ms_delta),
            seq: self.seq.wrapping_add(seq_delta),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamEntry {
    pub deleted: bool,
    pub fields: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingEntry {
    pub delivery_time: u64,
    pub delivery_count: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamConsumer {
    pub name: Vec<u8>,
    pub seen_time: u64,
    /// Present from stream encoding v3
    pub active_time: Option<u64>,
    pub pending: BTreeMap<StreamId, PendingEntry>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamGroup {
    pub name: Vec<u8>,
    pub last_id: StreamId,
    /// Present from stream encoding v2
    pub entries_read: Option<u64>,
    pub pending: BTreeMap<StreamId, PendingEntry>,
    pub consumers: Vec<StreamConsumer>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamValue {
    pub key: KeyObject,
    pub entries: BTreeMap<StreamId, StreamEntry>,
    pub length: u64,
    pub last_id: StreamId,
    pub first_id: Option<StreamId>,
    pub max_deleted_id: Option<StreamId>,
    pub entries_added: Option<u64>,
    pub groups: Vec<StreamGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelectDb {
    #[serde(rename = "Index")]
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResizeDb {
    #[serde(rename = "DBSize")]
    pub db_size: u64,
    #[serde(rename = "ExpireSize")]
    pub expire_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxField {
    pub field: Vec<u8>,
    pub value: Vec<u8>,
}

/// A decoded record
#[derive(Debug, Clone, PartialEq)]
pub enum TypeObject {
    String(StringValue),
    List(ListValue),
    Hash(HashValue),
    Set(SetValue),
    SortedSet(SortedSetValue),
    Stream(StreamValue),
    SelectDb(SelectDb),
    ResizeDb(ResizeDb),
    Aux(AuxField),
}

/// Write commands a destination store needs to rebuild one record
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub key: Vec<u8>,
    /// Each element is one full command: name followed by its arguments
    pub writes: Vec<Vec<Vec<u8>>>,
    /// Absolute expiry in unix milliseconds, 0 for none
    pub expire_at_ms: i64,
}

#[derive(Serialize)]
struct FieldValue<'a> {
    field: Cow<'a, str>,
    value: Cow<'a, str>,
}

#[derive(Serialize)]
struct MemberScore<'a> {
    field: Cow<'a, str>,
    score: f64,
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    key: Cow<'a, str>,
    value: Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    expire: Option<i64>,
}

#[inline]
fn text(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

fn join(items: &[Vec<u8>]) -> String {
    items
        .iter()
        .map(|i| text(i))
        .collect::<Vec<_>>()
        .join(",")
}

impl TypeObject {
    /// Stable type name used by the text sinks and the info report
    pub fn type_name(&self) -> &'static str {
        match self {
            TypeObject::String(_) => "String",
            TypeObject::List(_) => "List",
            TypeObject::Hash(_) => "Hash",
            TypeObject::Set(_) => "Set",
            TypeObject::SortedSet(_) => "SortedSet",
            TypeObject::Stream(_) => "Stream",
            TypeObject::SelectDb(_) => "SelectDB",
            TypeObject::ResizeDb(_) => "ResizeDB",
            TypeObject::Aux(_) => "AuxField",
        }
    }

    /// Key header for keyed records, `None` for control records
    pub fn key_object(&self) -> Option<&KeyObject> {
        match self {
            TypeObject::String(v) => Some(&v.key),
            TypeObject::List(v) => Some(&v.key),
            TypeObject::Hash(v) => Some(&v.key),
            TypeObject::Set(v) => Some(&v.key),
            TypeObject::SortedSet(v) => Some(&v.key),
            TypeObject::Stream(v) => Some(&v.key),
            _ => None,
        }
    }

    /// True for select-db, resize and aux records
    #[inline]
    pub fn is_control(&self) -> bool {
        self.key_object().is_none()
    }

    /// Absolute expiry in milliseconds, 0 for none
    pub fn expire_at_ms(&self) -> i64 {
        self.key_object().map(|k| k.expire_at_ms).unwrap_or(0)
    }

    /// Logical key of the record
    ///
    /// Control records report a fixed label (`select`, `resize db`) or the
    /// aux field name.
    pub fn key(&self) -> Cow<'_, str> {
        match self {
            TypeObject::SelectDb(_) => Cow::Borrowed("select"),
            TypeObject::ResizeDb(_) => Cow::Borrowed("resize db"),
            TypeObject::Aux(a) => text(&a.field),
            keyed => match keyed.key_object() {
                Some(k) => text(&k.name),
                None => Cow::Borrowed(""),
            },
        }
    }

    /// Text rendering of the value
    ///
    /// Lists and sets join their members with `,`; hashes and sorted sets
    /// render a JSON array; streams render a JSON object.
    pub fn value(&self) -> String {
        match self {
            TypeObject::String(v) => text(&v.value).into_owned(),
            TypeObject::List(v) => join(&v.entries),
            TypeObject::Set(v) => join(&v.members),
            TypeObject::Hash(_) | TypeObject::SortedSet(_) | TypeObject::Stream(_) => {
                self.json_value().to_string()
            }
            TypeObject::SelectDb(s) => s.index.to_string(),
            TypeObject::ResizeDb(r) => {
                format!("{{DBSize: {}, ExpireSize: {}}}", r.db_size, r.expire_size)
            }
            TypeObject::Aux(a) => text(&a.value).into_owned(),
        }
    }

    /// Element count; strings report their byte length
    pub fn value_len(&self) -> u64 {
        match self {
            TypeObject::String(v) => v.value.len() as u64,
            TypeObject::List(v) => v.entries.len() as u64,
            TypeObject::Hash(v) => v.entries.len() as u64,
            TypeObject::Set(v) => v.members.len() as u64,
            TypeObject::SortedSet(v) => v.entries.len() as u64,
            TypeObject::Stream(v) => v.entries.len() as u64,
            _ => 0,
        }
    }

    /// Payload size in bytes, metadata excluded
    pub fn concrete_size(&self) -> u64 {
        let size: usize = match self {
            TypeObject::String(v) => v.value.len(),
            TypeObject::List(v) => v.entries.iter().map(Vec::len).sum(),
            TypeObject::Set(v) => v.members.iter().map(Vec::len).sum(),
            TypeObject::Hash(v) => v.entries.iter().map(|(f, x)| f.len() + x.len()).sum(),
            TypeObject::SortedSet(v) => v.entries.iter().map(|(m, _)| m.len()).sum(),
            TypeObject::Stream(v) => v
                .entries
                .values()
                .flat_map(|e| e.fields.iter())
                .map(|(f, x)| f.len() + x.len())
                .sum(),
            _ => 0,
        };
        size as u64
    }

    /// Project the record onto destination write commands
    ///
    /// # Arguments
    /// * `keep_deleted_stream_entries` - also replay stream entries flagged as
    ///   deleted
    ///
    /// # Returns
    /// * `Some(Command)` for keyed records
    /// * `None` for control records, which are never written
    pub fn command(&self, keep_deleted_stream_entries: bool) -> Option<Command> {
        let key = self.key_object()?;
        let name = key.name.clone();

        let with_key = |cmd: &str, cap: usize| {
            let mut w = Vec::with_capacity(cap + 2);
            w.push(cmd.as_bytes().to_vec());
            w.push(name.clone());
            w
        };

        let writes = match self {
            TypeObject::String(v) => {
                let mut w = with_key("SET", 1);
                w.push(v.value.clone());
                vec![w]
            }
            TypeObject::List(v) => {
                let mut w = with_key("LPUSH", v.entries.len());
                w.extend(v.entries.iter().cloned());
                vec![w]
            }
            TypeObject::Set(v) => {
                let mut w = with_key("SADD", v.members.len());
                w.extend(v.members.iter().cloned());
                vec![w]
            }
            TypeObject::Hash(v) => {
                let mut w = with_key("HSET", v.entries.len() * 2);
                for (f, x) in &v.entries {
                    w.push(f.clone());
                    w.push(x.clone());
                }
                vec![w]
            }
            TypeObject::SortedSet(v) => {
                let mut w = with_key("ZADD", v.entries.len() * 2);
                for (member, score) in &v.entries {
                    w.push(score.to_string().into_bytes());
                    w.push(member.clone());
                }
                vec![w]
            }
            TypeObject::Stream(v) => v
                .entries
                .iter()
                .filter(|(_, e)| keep_deleted_stream_entries || !e.deleted)
                .map(|(id, e)| {
                    let mut w = with_key("XADD", 1 + e.fields.len() * 2);
                    w.push(id.to_string().into_bytes());
                    for (f, x) in &e.fields {
                        w.push(f.clone());
                        w.push(x.clone());
                    }
                    w
                })
                .collect(),
            _ => return None,
        };

        // Commands with no payload would be rejected by the destination.
        let writes = writes.into_iter().filter(|w| w.len() > 2).collect();

        Some(Command {
            key: key.name.clone(),
            writes,
            expire_at_ms: key.expire_at_ms,
        })
    }

    /// Serialize as one JSON document
    ///
    /// Keyed records: `{"type","key","value"[,"expire"]}`. Select and resize
    /// records serialize their own fields.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            TypeObject::SelectDb(s) => serde_json::to_vec(s),
            TypeObject::ResizeDb(r) => serde_json::to_vec(r),
            _ => {
                let expire_at_ms = self.expire_at_ms();
                serde_json::to_vec(&JsonRecord {
                    kind: self.type_name(),
                    key: self.key(),
                    value: self.json_value(),
                    expire: (expire_at_ms > 0).then_some(expire_at_ms),
                })
            }
        }
    }

    /// Serialize as one `kv` line (no trailing newline)
    ///
    /// Keyed records: `type:<T>|key:<K>|value:<V>|expire:<E>`. Control
    /// records: `info <key>:<value>`.
    pub fn to_kv(&self) -> String {
        if self.is_control() {
            return format!("info {}:{}", self.key(), self.value());
        }
        format!(
            "type:{}|key:{}|value:{}|expire:{}",
            self.type_name(),
            self.key(),
            self.value(),
            self.expire_at_ms()
        )
    }

    fn json_value(&self) -> Json {
        match self {
            TypeObject::String(v) => Json::String(text(&v.value).into_owned()),
            TypeObject::List(v) => json!(v.entries.iter().map(|e| text(e)).collect::<Vec<_>>()),
            TypeObject::Set(v) => json!(v.members.iter().map(|e| text(e)).collect::<Vec<_>>()),
            TypeObject::Hash(v) => json!(v
                .entries
                .iter()
                .map(|(f, x)| FieldValue {
                    field: text(f),
                    value: text(x),
                })
                .collect::<Vec<_>>()),
            TypeObject::SortedSet(v) => json!(v
                .entries
                .iter()
                .map(|(m, s)| MemberScore {
                    field: text(m),
                    score: *s,
                })
                .collect::<Vec<_>>()),
            TypeObject::Stream(v) => stream_json(v),
            TypeObject::Aux(a) => Json::String(text(&a.value).into_owned()),
            TypeObject::SelectDb(_) | TypeObject::ResizeDb(_) => Json::String(self.value()),
        }
    }
}

fn pending_json(pel: &BTreeMap<StreamId, PendingEntry>) -> Json {
    let mut out = Map::new();
    for (id, p) in pel {
        out.insert(
            id.to_string(),
            json!({ "deliveryTime": p.delivery_time, "deliveryCount": p.delivery_count }),
        );
    }
    Json::Object(out)
}

fn stream_json(s: &StreamValue) -> Json {
    let mut out = Map::new();
    out.insert("LastId".into(), Json::String(s.last_id.to_string()));
    out.insert("Length".into(), json!(s.length));
    if let Some(id) = s.first_id {
        out.insert("FirstId".into(), Json::String(id.to_string()));
    }
    if let Some(id) = s.max_deleted_id {
        out.insert("MaxDeletedId".into(), Json::String(id.to_string()));
    }
    if let Some(n) = s.entries_added {
        out.insert("EntriesAdded".into(), json!(n));
    }

    if !s.entries.is_empty() {
        let mut entries = Map::new();
        for (id, e) in &s.entries {
            let mut fields = Map::new();
            for (f, v) in &e.fields {
                fields.insert(text(f).into_owned(), Json::String(text(v).into_owned()));
            }
            entries.insert(
                id.to_string(),
                json!({ "deleted": e.deleted, "fields": Json::Object(fields) }),
            );
        }
        out.insert("Entries".into(), Json::Object(entries));
    }

    if !s.groups.is_empty() {
        let groups: Vec<Json> = s
            .groups
            .iter()
            .map(|g| {
                let consumers: Vec<Json> = g
                    .consumers
                    .iter()
                    .map(|c| {
                        let mut cj = json!({
                            "consumerName": text(&c.name),
                            "seenTime": c.seen_time,
                            "pending": pending_json(&c.pending),
                        });
                        if let (Some(t), Some(obj)) = (c.active_time, cj.as_object_mut()) {
                            obj.insert("activeTime".into(), json!(t));
                        }
                        cj
                    })
                    .collect();
                let mut gj = json!({
                    "groupName": text(&g.name),
                    "lastId": g.last_id.to_string(),
                    "pending": pending_json(&g.pending),
                    "consumers": consumers,
                });
                if let (Some(n), Some(obj)) = (g.entries_read, gj.as_object_mut()) {
                    obj.insert("entriesRead".into(), json!(n));
                }
                gj
            })
            .collect();
        out.insert("groups".into(), Json::Array(groups));
    }
    Json::Object(out)
}
