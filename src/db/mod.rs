use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

use crate::glob;

pub mod geo;
mod list;
mod sorted_set;
mod stream;

pub use sorted_set::SortedSet;
pub use stream::{IdSpec, Stream, StreamEntry, StreamId};

/// Only database 0 is served; the index is kept for the snapshot format.
pub const DB_INDEX: u8 = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
    SortedSet(SortedSet),
    Stream(Stream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    None,
    String,
    List,
    SortedSet,
    Stream,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    /// Absolute expiry, milliseconds since the Unix epoch.
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    StreamIdZero,

    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    StreamIdTooSmall,

    #[error("ERR Invalid stream ID specified as stream command argument")]
    InvalidStreamId,
}

/// How SET treats the key's existing expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Clear,
    Keep,
    At(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    IfAbsent,
    IfPresent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetOutcome {
    pub applied: bool,
    /// Previous string value, when the caller asked for it.
    pub previous: Option<Bytes>,
}

/// Handle to the keyspace. Cloning shares the same underlying state.
///
/// All operations are synchronous and never hold the lock across an await.
/// Expired keys are removed lazily, when an operation touches them.
#[derive(Debug, Clone)]
pub struct Db {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    /// Signalled after every write so blocked readers can re-check.
    changed: Notify,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    entries: HashMap<String, Entry>,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::String(_) => TypeTag::String,
            Value::List(_) => TypeTag::List,
            Value::SortedSet(_) => TypeTag::SortedSet,
            Value::Stream(_) => TypeTag::Stream,
        }
    }
}

impl TypeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::None => "none",
            TypeTag::String => "string",
            TypeTag::List => "list",
            TypeTag::SortedSet => "zset",
            TypeTag::Stream => "stream",
        }
    }
}

impl Entry {
    pub fn new(value: Value, expires_at: Option<u64>) -> Entry {
        Entry { value, expires_at }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if now > at)
    }
}

impl State {
    /// Looks up a key, evicting it first if its expiry has passed.
    pub(crate) fn live(&mut self, key: &str, now: u64) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            debug!(key, "evicting expired key");
            self.entries.remove(key);
            return None;
        }

        self.entries.get_mut(key)
    }

    pub(crate) fn insert(&mut self, key: String, entry: Entry) {
        self.entries.insert(key, entry);
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Entry> {
        self.entries.remove(key)
    }
}

impl Db {
    pub fn new() -> Db {
        Db {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).map(|entry| entry.value)
    }

    pub fn get_entry(&self, key: &str) -> Option<Entry> {
        self.state().live(key, now_millis()).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value, expires_at: Option<u64>) {
        self.write(|state| state.insert(key.into(), Entry::new(value, expires_at)));
    }

    pub fn delete(&self, key: &str) -> bool {
        self.write(|state| state.remove(key).is_some())
    }

    /// Keys matching the glob `pattern`, sorted. Expired keys are evicted on
    /// the way.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let now = now_millis();
        let mut state = self.state();

        state.entries.retain(|_, entry| !entry.is_expired(now));

        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| glob::matches(pattern.as_bytes(), key.as_bytes()))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn type_of(&self, key: &str) -> TypeTag {
        self.state()
            .live(key, now_millis())
            .map_or(TypeTag::None, |entry| entry.value.type_tag())
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// SET with its conditional and expiry options.
    pub fn set_string(
        &self,
        key: &str,
        value: Bytes,
        expiry: Expiry,
        condition: Option<SetCondition>,
        want_previous: bool,
    ) -> Result<SetOutcome, StoreError> {
        self.write(|state| {
            let existing = state.live(key, now_millis());

            let previous = match (&existing, want_previous) {
                (Some(Entry { value: Value::String(old), .. }), true) => Some(old.clone()),
                (Some(_), true) => return Err(StoreError::WrongType),
                _ => None,
            };

            let allowed = match condition {
                None => true,
                Some(SetCondition::IfAbsent) => existing.is_none(),
                Some(SetCondition::IfPresent) => existing.is_some(),
            };
            if !allowed {
                return Ok(SetOutcome { applied: false, previous });
            }

            let expires_at = match expiry {
                Expiry::Clear => None,
                Expiry::At(at) => Some(at),
                Expiry::Keep => existing.and_then(|entry| entry.expires_at),
            };

            state.insert(key.to_string(), Entry::new(Value::String(value), expires_at));

            Ok(SetOutcome { applied: true, previous })
        })
    }

    /// Adds one to the integer stored at `key`, starting from zero. The key's
    /// expiry is preserved.
    pub fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.write(|state| match state.live(key, now_millis()) {
            None => {
                state.insert(key.to_string(), Entry::new(Value::String(Bytes::from("1")), None));
                Ok(1)
            }
            Some(entry) => {
                let current = match &entry.value {
                    Value::String(bytes) => std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|text| text.parse::<i64>().ok())
                        .ok_or(StoreError::NotInteger)?,
                    _ => return Err(StoreError::WrongType),
                };

                let next = current.checked_add(1).ok_or(StoreError::Overflow)?;
                entry.value = Value::String(Bytes::from(next.to_string()));

                Ok(next)
            }
        })
    }

    /// Live entries, sorted by key.
    pub fn entries(&self) -> Vec<(String, Entry)> {
        let now = now_millis();
        let state = self.state();

        let mut entries: Vec<(String, Entry)> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Replaces the whole keyspace in one step.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = (String, Entry)>) {
        let entries: HashMap<String, Entry> = entries.into_iter().collect();

        self.write(|state| state.entries = entries);
    }

    /// Future resolving at the next write. Create (and enable) it before
    /// checking state so no write slips between the check and the wait.
    pub fn changed(&self) -> Notified<'_> {
        self.shared.changed.notified()
    }

    /// Runs a mutation under the lock and wakes blocked readers afterwards.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let result = {
            let mut state = self.state();
            f(&mut state)
        };

        self.shared.changed.notify_waiters();

        result
    }

    /// Like `write`, but only wakes blocked readers when `f` reports that it
    /// changed something. A failed pop must not wake the popper itself.
    pub(crate) fn write_if<R>(&self, f: impl FnOnce(&mut State) -> (R, bool)) -> R {
        let (result, changed) = {
            let mut state = self.state();
            f(&mut state)
        };

        if changed {
            self.shared.changed.notify_waiters();
        }

        result
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Db {
    fn default() -> Self {
        Db::new()
    }
}

/// Resolves an inclusive `start..=stop` range with negative indexes counting
/// from the end. `None` when the range selects nothing.
pub(crate) fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len {
        return None;
    }

    Some((start as usize, stop as usize))
}
