use std::collections::VecDeque;

use bytes::Bytes;

use super::{normalize_range, now_millis, Db, Entry, StoreError, Value};

impl Db {
    /// Pushes `values` one by one onto the head (`front`) or tail of the list,
    /// creating it if needed. Returns the new length.
    pub fn push(&self, key: &str, values: Vec<Bytes>, front: bool) -> Result<usize, StoreError> {
        self.write(|state| {
            if state.live(key, now_millis()).is_none() {
                state.insert(key.to_string(), Entry::new(Value::List(VecDeque::new()), None));
            }

            match state.live(key, now_millis()).map(|entry| &mut entry.value) {
                Some(Value::List(list)) => {
                    for value in values {
                        if front {
                            list.push_front(value);
                        } else {
                            list.push_back(value);
                        }
                    }
                    Ok(list.len())
                }
                _ => Err(StoreError::WrongType),
            }
        })
    }

    /// Pops up to `count` items from the head. An emptied list is removed.
    pub fn pop_front(&self, key: &str, count: usize) -> Result<Vec<Bytes>, StoreError> {
        self.write_if(|state| {
            let (popped, emptied) = match state.live(key, now_millis()).map(|entry| &mut entry.value) {
                None => return (Ok(vec![]), false),
                Some(Value::List(list)) => {
                    let n = count.min(list.len());
                    let popped: Vec<Bytes> = list.drain(..n).collect();
                    (popped, list.is_empty())
                }
                Some(_) => return (Err(StoreError::WrongType), false),
            };

            if emptied {
                state.remove(key);
            }

            let changed = !popped.is_empty();
            (Ok(popped), changed)
        })
    }

    /// Pops the head of the first non-empty list among `keys`.
    pub fn pop_first_of(&self, keys: &[String]) -> Result<Option<(String, Bytes)>, StoreError> {
        for key in keys {
            if let Some(value) = self.pop_front(key, 1)?.pop() {
                return Ok(Some((key.clone(), value)));
            }
        }

        Ok(None)
    }

    pub fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>, StoreError> {
        match self.state().live(key, now_millis()).map(|entry| &entry.value) {
            None => Ok(vec![]),
            Some(Value::List(list)) => Ok(match normalize_range(start, stop, list.len()) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => vec![],
            }),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        match self.state().live(key, now_millis()).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(StoreError::WrongType),
        }
    }
}
