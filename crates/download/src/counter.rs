// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Atomic per-key counters with an expiry instant.
//!
//! Both the rate limiter windows and the monthly egress counters are stored
//! here. A counter whose `reset_at` has passed is treated as absent, and the
//! next increment replaces it rather than adding to it.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{OptionExt, ResultExt};
use tracing::warn;

use crate::error::{CorruptSnafu, CounterError, OpenStoreSnafu, SledSnafu};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CounterEntry {
    pub value:      u64,
    /// When the current window or period began.
    pub started_at: DateTime<Utc>,
    pub reset_at:   DateTime<Utc>,
}

impl CounterEntry {
    #[must_use]
    pub const fn started(value: u64, now: DateTime<Utc>, reset_at: DateTime<Utc>) -> Self {
        Self {
            value,
            started_at: now,
            reset_at,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool { now >= self.reset_at }
}

/// Counter storage shared by all requests.
///
/// Every mutation is atomic for its key and never serializes unrelated keys.
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Adds `delta` to a live counter, or starts a new one holding `delta`
    /// when the key is absent or expired at `now`.
    fn increment(
        &self,
        key: &str,
        delta: u64,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<CounterEntry, CounterError>;

    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterEntry>, CounterError>;

    /// Removes the counter if it expired. Returns whether anything was removed.
    fn reset_if_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool, CounterError>;

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CounterError>;

    fn flush(&self) -> Result<(), CounterError> { Ok(()) }
}

/// Where counters live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CounterBackend {
    /// Process memory. Counters do not survive a restart.
    #[default]
    Memory,
    /// Embedded sled database.
    Sled { path: PathBuf },
}

impl CounterBackend {
    pub fn open(&self) -> Result<Arc<dyn CounterStore>, CounterError> {
        Ok(match self {
            Self::Memory => Arc::new(MemoryCounterStore::default()),
            Self::Sled { path } => Arc::new(SledCounterStore::open(path)?),
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
}

impl MemoryCounterStore {
    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

impl CounterStore for MemoryCounterStore {
    fn increment(
        &self,
        key: &str,
        delta: u64,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<CounterEntry, CounterError> {
        let entry = match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if current.is_expired(now) {
                    *current = CounterEntry::started(delta, now, reset_at);
                } else {
                    current.value = current.value.saturating_add(delta);
                }
                *current
            }
            Entry::Vacant(vacant) => *vacant.insert(CounterEntry::started(delta, now, reset_at)),
        };
        Ok(entry)
    }

    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterEntry>, CounterError> {
        Ok(self
            .entries
            .get(key)
            .map(|entry| *entry)
            .filter(|entry| !entry.is_expired(now)))
    }

    fn reset_if_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool, CounterError> {
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CounterError> {
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.is_expired(now);
            purged += usize::from(expired);
            !expired
        });
        Ok(purged)
    }
}

const ENCODED_LEN: usize = 24;

/// Counters persisted in a sled tree, surviving restarts.
///
/// Entries are encoded as three big-endian 8-byte fields: value, start and
/// reset instants in unix milliseconds.
pub struct SledCounterStore {
    db:   sled::Db,
    tree: sled::Tree,
}

impl fmt::Debug for SledCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledCounterStore")
            .field("entries", &self.tree.len())
            .finish_non_exhaustive()
    }
}

impl SledCounterStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CounterError> {
        let path = path.as_ref();
        let db = sled::open(path).context(OpenStoreSnafu {
            path: path.display().to_string(),
        })?;
        let tree = db.open_tree("counters").context(OpenStoreSnafu {
            path: path.display().to_string(),
        })?;
        Ok(Self { db, tree })
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<CounterEntry, CounterError> {
        decode_entry(bytes).context(CorruptSnafu { key })
    }
}

fn encode_entry(entry: &CounterEntry) -> [u8; ENCODED_LEN] {
    let mut buf = [0u8; ENCODED_LEN];
    buf[..8].copy_from_slice(&entry.value.to_be_bytes());
    buf[8..16].copy_from_slice(&entry.started_at.timestamp_millis().to_be_bytes());
    buf[16..].copy_from_slice(&entry.reset_at.timestamp_millis().to_be_bytes());
    buf
}

fn decode_entry(bytes: &[u8]) -> Option<CounterEntry> {
    let bytes: &[u8; ENCODED_LEN] = bytes.try_into().ok()?;
    let field = |at: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[at..at + 8]);
        raw
    };
    Some(CounterEntry {
        value:      u64::from_be_bytes(field(0)),
        started_at: DateTime::from_timestamp_millis(i64::from_be_bytes(field(8)))?,
        reset_at:   DateTime::from_timestamp_millis(i64::from_be_bytes(field(16)))?,
    })
}

impl CounterStore for SledCounterStore {
    fn increment(
        &self,
        key: &str,
        delta: u64,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<CounterEntry, CounterError> {
        let updated = self
            .tree
            .update_and_fetch(key, |old| {
                let next = match old.map(decode_entry) {
                    Some(Some(mut current)) if !current.is_expired(now) => {
                        current.value = current.value.saturating_add(delta);
                        current
                    }
                    Some(None) => {
                        warn!(key, "Replacing undecodable counter entry");
                        CounterEntry::started(delta, now, reset_at)
                    }
                    _ => CounterEntry::started(delta, now, reset_at),
                };
                Some(encode_entry(&next).to_vec())
            })
            .context(SledSnafu { key })?
            .context(CorruptSnafu { key })?;
        Self::decode(key, &updated)
    }

    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterEntry>, CounterError> {
        let Some(raw) = self.tree.get(key).context(SledSnafu { key })? else {
            return Ok(None);
        };
        let entry = Self::decode(key, &raw)?;
        Ok((!entry.is_expired(now)).then_some(entry))
    }

    fn reset_if_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool, CounterError> {
        let Some(raw) = self.tree.get(key).context(SledSnafu { key })? else {
            return Ok(false);
        };
        if decode_entry(&raw).is_some_and(|entry| !entry.is_expired(now)) {
            return Ok(false);
        }
        let swapped = self
            .tree
            .compare_and_swap(key, Some(raw), None::<&[u8]>)
            .context(SledSnafu { key })?;
        Ok(swapped.is_ok())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CounterError> {
        let mut purged = 0;
        for item in self.tree.iter() {
            let (raw_key, raw) = item.context(SledSnafu { key: "*" })?;
            let key = String::from_utf8_lossy(&raw_key).into_owned();
            if decode_entry(&raw).is_some_and(|entry| !entry.is_expired(now)) {
                continue;
            }
            let swapped = self
                .tree
                .compare_and_swap(&raw_key, Some(raw), None::<&[u8]>)
                .context(SledSnafu { key })?;
            purged += usize::from(swapped.is_ok());
        }
        Ok(purged)
    }

    fn flush(&self) -> Result<(), CounterError> {
        self.db.flush().context(SledSnafu { key: "*" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::{Duration, TimeZone};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> { Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap() }

    fn exercise(store: &dyn CounterStore) {
        let first = store.increment("k", 2, at(0), at(10)).unwrap();
        assert_eq!(first, CounterEntry::started(2, at(0), at(10)));

        let second = store.increment("k", 3, at(5), at(15)).unwrap();
        assert_eq!(second.value, 5);
        assert_eq!(second.reset_at, at(10), "live window keeps its reset instant");

        assert_eq!(store.get("k", at(9)).unwrap().map(|e| e.value), Some(5));
        assert_eq!(store.get("k", at(10)).unwrap(), None, "expired reads as absent");

        let replaced = store.increment("k", 1, at(10), at(20)).unwrap();
        assert_eq!(replaced, CounterEntry::started(1, at(10), at(20)));

        assert!(!store.reset_if_expired("k", at(19)).unwrap());
        assert!(store.reset_if_expired("k", at(20)).unwrap());
        assert!(!store.reset_if_expired("k", at(20)).unwrap());
        assert_eq!(store.get("missing", at(0)).unwrap(), None);

        store.increment("a", 1, at(0), at(5)).unwrap();
        store.increment("b", 1, at(0), at(50)).unwrap();
        assert_eq!(store.purge_expired(at(6)).unwrap(), 1);
        assert!(store.get("b", at(6)).unwrap().is_some());
    }

    #[test]
    fn test_memory_store_semantics() { exercise(&MemoryCounterStore::default()); }

    #[test]
    fn test_sled_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&SledCounterStore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledCounterStore::open(dir.path()).unwrap();
            store.increment("egress/acme/bytes", 4096, at(0), at(100)).unwrap();
            store.flush().unwrap();
        }
        let store = SledCounterStore::open(dir.path()).unwrap();
        let entry = store.get("egress/acme/bytes", at(1)).unwrap().unwrap();
        assert_eq!(entry.value, 4096);
        assert_eq!(entry.started_at, at(0));
    }

    #[test]
    fn test_concurrent_increments_are_atomic() {
        let store = Arc::new(MemoryCounterStore::default());
        let reset_at = at(0) + Duration::days(1);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        store.increment("hot", 1, at(0), reset_at).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("hot", at(1)).unwrap().unwrap().value, 8000);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_backend_config() {
        let backend: CounterBackend =
            serde_json::from_value(serde_json::json!({ "type": "sled", "path": "/var/lib/dlgate" }))
                .unwrap();
        assert_eq!(backend, CounterBackend::Sled {
            path: PathBuf::from("/var/lib/dlgate"),
        });
        assert_eq!(CounterBackend::default(), CounterBackend::Memory);
        assert!(CounterBackend::Memory.open().is_ok());
    }
}
