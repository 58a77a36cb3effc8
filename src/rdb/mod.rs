//! Binary snapshot format.
//!
//! ```text
//! "REDIS" "0011"
//! FA <name> <value>                        metadata, repeated
//! FE <db> [FB <keys> <expiring>]           one section per database
//!     [FD <u32 secs> | FC <u64 ms>] <type> <key> <payload>
//! FF <u64 crc64, little-endian>
//! ```
//!
//! The checksum covers every byte before it, the `FF` included. A stored
//! checksum of zero means the writer did not compute one.

use std::io::ErrorKind;
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::db::{now_millis, Entry, SortedSet, Value, DB_INDEX};
use crate::{Error, Result};

pub mod crc64;
pub mod length;

pub const MAGIC: &[u8; 5] = b"REDIS";
pub const VERSION: &[u8; 4] = b"0011";

const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_EXPIRETIME: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0;
const TYPE_LIST: u8 = 1;
const TYPE_ZSET_2: u8 = 5;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub metadata: Vec<(String, String)>,
    pub databases: Vec<Database>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Database {
    pub index: u8,
    pub entries: Vec<(String, Entry)>,
}

/// Cursor over an in-memory snapshot.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| format!("needed {n} bytes, {} left", self.buf.len() - self.pos))?;

        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> std::result::Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    pub fn u32_be(&mut self) -> std::result::Result<u32, String> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64_be(&mut self) -> std::result::Result<u64, String> {
        Ok(u64::from_be_bytes(self.array()?))
    }
}

impl Snapshot {
    /// A single-database snapshot of `entries`, stamped with the usual
    /// metadata.
    pub fn from_entries(entries: Vec<(String, Entry)>) -> Snapshot {
        let ctime = (now_millis() / 1000).to_string();

        Snapshot {
            metadata: vec![
                ("redis-ver".to_string(), "7.2.0".to_string()),
                ("redis-bits".to_string(), "64".to_string()),
                ("ctime".to_string(), ctime),
            ],
            databases: vec![Database {
                index: DB_INDEX,
                entries,
            }],
        }
    }

    /// Entries of the served database; other sections are dropped.
    pub fn into_entries(self) -> Vec<(String, Entry)> {
        let mut served = vec![];

        for database in self.databases {
            if database.index == DB_INDEX {
                served.extend(database.entries);
            } else {
                warn!(index = database.index, keys = database.entries.len(), "ignoring database section");
            }
        }

        served
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();

        dst.put_slice(MAGIC);
        dst.put_slice(VERSION);

        for (name, value) in &self.metadata {
            dst.put_u8(OP_AUX);
            length::put_string(&mut dst, name.as_bytes());
            length::put_string(&mut dst, value.as_bytes());
        }

        for database in &self.databases {
            let records: Vec<&(String, Entry)> = database
                .entries
                .iter()
                .filter(|(key, entry)| {
                    let supported = !matches!(entry.value, Value::Stream(_));
                    if !supported {
                        warn!(key = %key, "stream values are not persisted");
                    }
                    supported
                })
                .collect();
            let expiring = records.iter().filter(|(_, entry)| entry.expires_at.is_some()).count();

            dst.put_u8(OP_SELECTDB);
            dst.put_u8(database.index);
            dst.put_u8(OP_RESIZEDB);
            length::put_length(&mut dst, records.len() as u64);
            length::put_length(&mut dst, expiring as u64);

            for (key, entry) in records {
                put_record(&mut dst, key, entry);
            }
        }

        dst.put_u8(OP_EOF);
        let crc = crc64::checksum(&dst);
        dst.put_u64_le(crc);

        dst.freeze()
    }

    /// Parses a complete snapshot. Nothing is returned unless every record
    /// and the checksum are valid.
    pub fn decode(buf: &[u8]) -> Result<Snapshot> {
        let mut src = Reader::new(buf);
        let mut snapshot = Snapshot::default();
        let mut records = 0usize;

        match snapshot.decode_body(&mut src, &mut records) {
            Ok(()) => Ok(snapshot),
            Err(reason) => {
                warn!(position = src.position(), records, %reason, "snapshot rejected");
                Err(Error::CorruptSnapshot(format!(
                    "{reason} at byte {} after {records} records",
                    src.position()
                )))
            }
        }
    }

    fn decode_body(&mut self, src: &mut Reader<'_>, records: &mut usize) -> std::result::Result<(), String> {
        if src.take(MAGIC.len())? != MAGIC {
            return Err("bad magic".into());
        }
        let version = src.take(VERSION.len())?;
        if !version.iter().all(u8::is_ascii_digit) {
            return Err("bad version".into());
        }

        loop {
            let op = src.peek().ok_or("missing end-of-file marker")?;

            match op {
                OP_AUX => {
                    src.u8()?;
                    let name = utf8(length::read_string(src)?);
                    let value = utf8(length::read_string(src)?);
                    self.metadata.push((name, value));
                }
                OP_SELECTDB => {
                    src.u8()?;
                    let index = src.u8()?;
                    self.databases.push(Database { index, entries: vec![] });
                }
                OP_RESIZEDB => {
                    src.u8()?;
                    let keys = length::read_length(src)?;
                    let expiring = length::read_length(src)?;
                    debug!(keys, expiring, "resize hint");
                }
                OP_EOF => {
                    let body_len = src.position() + 1;
                    src.u8()?;
                    let stored = u64::from_le_bytes(src.array()?);

                    if stored != 0 {
                        let computed = crc64::checksum(&src.buf[..body_len]);
                        if computed != stored {
                            return Err(format!(
                                "checksum mismatch, stored {stored:016x} computed {computed:016x}"
                            ));
                        }
                    }

                    return Ok(());
                }
                _ => {
                    let (key, entry) = read_record(src)?;
                    let database = self
                        .databases
                        .last_mut()
                        .ok_or("record outside a database section")?;
                    database.entries.push((key, entry));
                    *records += 1;
                }
            }
        }
    }
}

fn put_record(dst: &mut BytesMut, key: &str, entry: &Entry) {
    match entry.expires_at {
        Some(at) if at % 1000 == 0 && at / 1000 <= u32::MAX as u64 => {
            dst.put_u8(OP_EXPIRETIME);
            dst.put_u32_le((at / 1000) as u32);
        }
        Some(at) => {
            dst.put_u8(OP_EXPIRETIME_MS);
            dst.put_u64_le(at);
        }
        None => {}
    }

    match &entry.value {
        Value::String(value) => {
            dst.put_u8(TYPE_STRING);
            length::put_string(dst, key.as_bytes());
            length::put_string(dst, value);
        }
        Value::List(items) => {
            dst.put_u8(TYPE_LIST);
            length::put_string(dst, key.as_bytes());
            length::put_length(dst, items.len() as u64);
            for item in items {
                length::put_string(dst, item);
            }
        }
        Value::SortedSet(set) => {
            dst.put_u8(TYPE_ZSET_2);
            length::put_string(dst, key.as_bytes());
            length::put_length(dst, set.len() as u64);
            for (member, score) in set.iter() {
                length::put_string(dst, member);
                dst.put_f64_le(*score);
            }
        }
        // Filtered out by the caller.
        Value::Stream(_) => {}
    }
}

fn read_record(src: &mut Reader<'_>) -> std::result::Result<(String, Entry), String> {
    let expires_at = match src.peek() {
        Some(OP_EXPIRETIME) => {
            src.u8()?;
            Some(u32::from_le_bytes(src.array()?) as u64 * 1000)
        }
        Some(OP_EXPIRETIME_MS) => {
            src.u8()?;
            Some(u64::from_le_bytes(src.array()?))
        }
        _ => None,
    };

    let kind = src.u8()?;
    let key = utf8(length::read_string(src)?);

    let value = match kind {
        TYPE_STRING => Value::String(Bytes::from(length::read_string(src)?)),
        TYPE_LIST => {
            let len = length::read_length(src)?;
            let items = (0..len)
                .map(|_| length::read_string(src).map(Bytes::from))
                .collect::<std::result::Result<_, _>>()?;
            Value::List(items)
        }
        TYPE_ZSET_2 => {
            let len = length::read_length(src)?;
            let mut set = SortedSet::new();
            for _ in 0..len {
                let member = Bytes::from(length::read_string(src)?);
                let score = f64::from_le_bytes(src.array()?);
                set.insert(member, score);
            }
            Value::SortedSet(set)
        }
        other => return Err(format!("unsupported value type {other} for key {key:?}")),
    };

    Ok((key, Entry::new(value, expires_at)))
}

fn utf8(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}

/// Reads and decodes the snapshot at `path`. A missing or unreadable file
/// means an empty keyspace; only a corrupt one is an error.
pub async fn load_file(path: &Path) -> Result<Option<Snapshot>> {
    let buf = match tokio::fs::read(path).await {
        Ok(buf) => buf,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "no snapshot file, starting empty");
            return Ok(None);
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "snapshot file unreadable, starting empty");
            return Ok(None);
        }
    };

    let snapshot = Snapshot::decode(&buf)?;
    info!(path = %path.display(), bytes = buf.len(), "snapshot loaded");

    Ok(Some(snapshot))
}

/// Writes through a temporary file and renames it into place. Synchronous,
/// like SAVE itself.
pub fn save_file(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let bytes = snapshot.encode();
    let tmp = path.with_extension("rdb.tmp");

    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;

    info!(path = %path.display(), bytes = bytes.len(), "snapshot saved");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    fn sample() -> Snapshot {
        let mut set = SortedSet::new();
        set.insert(Bytes::from("m"), 1.5);

        Snapshot::from_entries(vec![
            ("counter".to_string(), Entry::new(Value::String(Bytes::from("42")), None)),
            (
                "exp_ms".to_string(),
                Entry::new(Value::String(Bytes::from("v")), Some(4_102_444_800_123)),
            ),
            (
                "exp_s".to_string(),
                Entry::new(Value::String(Bytes::from("w")), Some(4_102_444_800_000)),
            ),
            (
                "list".to_string(),
                Entry::new(Value::List(VecDeque::from([Bytes::from("a"), Bytes::from("b")])), None),
            ),
            ("set".to_string(), Entry::new(Value::SortedSet(set), None)),
        ])
    }

    #[test]
    fn round_trip() {
        let snapshot = sample();
        let decoded = Snapshot::decode(&snapshot.encode()).unwrap();

        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn empty_keyspace() {
        let snapshot = Snapshot::from_entries(vec![]);
        let bytes = snapshot.encode();

        assert!(bytes.starts_with(b"REDIS0011"));
        assert_eq!(Snapshot::decode(&bytes).unwrap().into_entries(), vec![]);
    }

    #[test]
    fn any_flipped_byte_is_rejected() {
        let bytes = sample().encode();

        for at in 0..bytes.len() - 8 {
            let mut corrupt = bytes.to_vec();
            corrupt[at] ^= 0x01;
            assert!(
                matches!(Snapshot::decode(&corrupt), Err(Error::CorruptSnapshot(_))),
                "flip at byte {at} was accepted"
            );
        }
    }

    #[test]
    fn zero_checksum_is_not_verified() {
        let bytes = sample().encode();
        let mut unchecked = bytes.to_vec();
        let len = unchecked.len();
        unchecked[len - 8..].copy_from_slice(&[0; 8]);

        assert_eq!(Snapshot::decode(&unchecked).unwrap(), Snapshot::decode(&bytes).unwrap());
    }

    #[test]
    fn bad_magic() {
        let mut bytes = sample().encode().to_vec();
        bytes[0] = b'X';

        assert!(matches!(Snapshot::decode(&bytes), Err(Error::CorruptSnapshot(_))));
    }

    #[test]
    fn streams_are_skipped_on_write() {
        let snapshot = Snapshot::from_entries(vec![(
            "s".to_string(),
            Entry::new(Value::Stream(crate::db::Stream::new()), None),
        )]);

        assert_eq!(Snapshot::decode(&snapshot.encode()).unwrap().into_entries(), vec![]);
    }

    #[test]
    fn other_databases_are_dropped() {
        let mut snapshot = sample();
        snapshot.databases.push(Database {
            index: 3,
            entries: vec![("elsewhere".to_string(), Entry::new(Value::String(Bytes::from("x")), None))],
        });

        let entries = Snapshot::decode(&snapshot.encode()).unwrap().into_entries();
        assert!(entries.iter().all(|(key, _)| key != "elsewhere"));
        assert_eq!(entries.len(), 5);
    }

    #[tokio::test]
    async fn missing_file_loads_nothing() {
        let path = std::env::temp_dir().join(format!("resp-kv-missing-{}.rdb", std::process::id()));

        assert_eq!(load_file(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreadable_file_loads_nothing() {
        assert_eq!(load_file(&std::env::temp_dir()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_file_is_fatal() {
        let path = std::env::temp_dir().join(format!("resp-kv-corrupt-{}.rdb", std::process::id()));
        std::fs::write(&path, b"not a snapshot").unwrap();

        let loaded = load_file(&path).await;
        let _ = std::fs::remove_file(&path);

        assert!(matches!(loaded, Err(Error::CorruptSnapshot(_))));
    }

    #[tokio::test]
    async fn save_then_load() {
        let path = std::env::temp_dir().join(format!("resp-kv-save-{}.rdb", std::process::id()));
        let snapshot = sample();

        save_file(&path, &snapshot).unwrap();
        let loaded = load_file(&path).await.unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded, Some(snapshot));
    }
}
