use std::cmp::Ordering;

use bytes::Bytes;

use super::{normalize_range, now_millis, Db, Entry, StoreError, Value};

/// Members ordered by `(score, member)`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortedSet {
    members: Vec<(Bytes, f64)>,
}

fn by_rank(a: &(Bytes, f64), score: f64, member: &[u8]) -> Ordering {
    a.1.total_cmp(&score).then_with(|| a.0.as_ref().cmp(member))
}

impl SortedSet {
    pub fn new() -> SortedSet {
        SortedSet::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.members
            .iter()
            .find(|(m, _)| m.as_ref() == member)
            .map(|(_, score)| *score)
    }

    /// Inserts or re-scores `member`. Returns true when it was new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        let added = !self.remove(&member);

        let at = self
            .members
            .binary_search_by(|entry| by_rank(entry, score, &member))
            .unwrap_or_else(|at| at);
        self.members.insert(at, (member, score));

        added
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.members.iter().position(|(m, _)| m.as_ref() == member) {
            Some(at) => {
                self.members.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        self.members.iter().position(|(m, _)| m.as_ref() == member)
    }

    pub fn range(&self, start: i64, stop: i64) -> Vec<(Bytes, f64)> {
        match normalize_range(start, stop, self.members.len()) {
            Some((from, to)) => self.members[from..=to].to_vec(),
            None => vec![],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Bytes, f64)> {
        self.members.iter()
    }
}

impl Db {
    /// Adds or updates members. Returns how many were new.
    pub fn zadd(&self, key: &str, members: Vec<(f64, Bytes)>) -> Result<usize, StoreError> {
        self.write(|state| {
            if state.live(key, now_millis()).is_none() {
                state.insert(key.to_string(), Entry::new(Value::SortedSet(SortedSet::new()), None));
            }

            match state.live(key, now_millis()).map(|entry| &mut entry.value) {
                Some(Value::SortedSet(set)) => Ok(members
                    .into_iter()
                    .filter(|(score, member)| set.insert(member.clone(), *score))
                    .count()),
                _ => Err(StoreError::WrongType),
            }
        })
    }

    /// Removes members, dropping the key once the set is empty.
    pub fn zrem(&self, key: &str, members: &[Bytes]) -> Result<usize, StoreError> {
        self.write(|state| {
            let (removed, emptied) = match state.live(key, now_millis()).map(|entry| &mut entry.value) {
                None => return Ok(0),
                Some(Value::SortedSet(set)) => {
                    let removed = members.iter().filter(|member| set.remove(member)).count();
                    (removed, set.is_empty())
                }
                Some(_) => return Err(StoreError::WrongType),
            };

            if emptied {
                state.remove(key);
            }

            Ok(removed)
        })
    }

    pub fn zrank(&self, key: &str, member: &[u8]) -> Result<Option<usize>, StoreError> {
        self.with_sorted_set(key, |set| set.rank(member))
    }

    pub fn zscore(&self, key: &str, member: &[u8]) -> Result<Option<f64>, StoreError> {
        self.with_sorted_set(key, |set| set.score(member))
    }

    pub fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        self.with_sorted_set(key, |set| set.len())
    }

    pub fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<(Bytes, f64)>, StoreError> {
        self.with_sorted_set(key, |set| set.range(start, stop))
    }

    fn with_sorted_set<R: Default>(
        &self,
        key: &str,
        f: impl FnOnce(&SortedSet) -> R,
    ) -> Result<R, StoreError> {
        match self.state().live(key, now_millis()).map(|entry| &entry.value) {
            None => Ok(R::default()),
            Some(Value::SortedSet(set)) => Ok(f(set)),
            Some(_) => Err(StoreError::WrongType),
        }
    }
}
