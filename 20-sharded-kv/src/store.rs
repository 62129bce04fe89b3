//! Sharded in-memory storage for values and user credentials.
//!
//! Keys are spread over a fixed number of shards by hashing. Each value shard
//! sits behind its own `RwLock`, so reads of one shard run in parallel and
//! writes to different shards never contend. User shards use a plain `Mutex`
//! since every credential operation is a check followed by a decision.
//!
//! # Multi-key operations
//!
//! `multi_put` and `multi_get` lock every shard they touch before doing any
//! work, always in ascending shard index. Two multi-key operations over
//! overlapping shard sets therefore acquire their common shards in the same
//! order and cannot deadlock.
//!
//! # Conditional reads
//!
//! `get_when` waits until a guard key holds an exact value and then reads a
//! target key. Each value shard keeps a registry of wait handles keyed by
//! guard key, protected by its own mutex. Lock order is always registry, then
//! entries. Writers publish under the entries lock, release it, and only then
//! take the registry lock to notify, so a waiter either sees the new value on
//! its check or is already parked when the notification fires.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::trace;

use crate::error::StoreError;

pub struct ShardedStore {
    values: Vec<ValueShard>,
    users: Vec<Mutex<HashMap<String, String>>>,
}

#[derive(Default)]
struct ValueShard {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    pending: Mutex<HashMap<String, Arc<Condvar>>>,
}

/// Cancels the conditional reads of one owner (a session).
///
/// After [`CancelFlag::cancel`], waiters holding this flag return
/// [`StoreError::Cancelled`] on their next wake-up; call
/// [`ShardedStore::wake_waiters`] to make that happen promptly.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl ShardedStore {
    pub fn new(value_shards: NonZeroUsize, user_shards: NonZeroUsize) -> Self {
        Self {
            values: (0..value_shards.get())
                .map(|_| ValueShard::default())
                .collect(),
            users: (0..user_shards.get())
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    pub fn value_shard_count(&self) -> usize {
        self.values.len()
    }

    pub fn user_shard_count(&self) -> usize {
        self.users.len()
    }

    pub fn value_shard_index(&self, key: &str) -> usize {
        shard_index(key, self.values.len())
    }

    pub fn user_shard_index(&self, username: &str) -> usize {
        shard_index(username, self.users.len())
    }

    /// True iff the user exists and the password matches.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let shard = self.users[self.user_shard_index(username)].lock();
        shard.get(username).is_some_and(|stored| stored == password)
    }

    /// Registers a new user; `false` if the username is taken.
    pub fn register(&self, username: &str, password: &str) -> bool {
        let mut shard = self.users[self.user_shard_index(username)].lock();
        match shard.entry(username.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(password.to_string());
                true
            }
        }
    }

    pub fn put(&self, key: String, value: Vec<u8>) {
        let shard = &self.values[self.value_shard_index(&key)];
        shard.entries.write().insert(key.clone(), value);
        self.notify_waiters(&key);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let shard = &self.values[self.value_shard_index(key)];
        let entries = shard.entries.read();
        entries.get(key).cloned()
    }

    /// Writes every pair while holding the write lock of every shard involved.
    pub fn multi_put<I>(&self, pairs: I)
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let mut by_shard: BTreeMap<usize, Vec<(String, Vec<u8>)>> = BTreeMap::new();
        for (key, value) in pairs {
            by_shard
                .entry(self.value_shard_index(&key))
                .or_default()
                .push((key, value));
        }

        let mut guards: Vec<_> = by_shard
            .keys()
            .map(|index| self.values[*index].entries.write())
            .collect();

        let mut written = Vec::new();
        for (entries, (_, pairs)) in guards.iter_mut().zip(by_shard) {
            for (key, value) in pairs {
                entries.insert(key.clone(), value);
                written.push(key);
            }
        }
        drop(guards);

        for key in &written {
            self.notify_waiters(key);
        }
    }

    /// Reads every key while holding the read lock of every shard involved.
    ///
    /// Absent keys are left out of the result.
    pub fn multi_get<I, K>(&self, keys: I) -> HashMap<String, Vec<u8>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut by_shard: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for key in keys {
            let key = key.into();
            by_shard
                .entry(self.value_shard_index(&key))
                .or_default()
                .push(key);
        }

        let guards: Vec<_> = by_shard
            .keys()
            .map(|index| self.values[*index].entries.read())
            .collect();

        let mut found = HashMap::new();
        for (entries, (_, keys)) in guards.iter().zip(by_shard) {
            for key in keys {
                if let Some(value) = entries.get(&key) {
                    found.insert(key, value.clone());
                }
            }
        }
        found
    }

    /// Blocks until `cond_key` holds exactly `cond_value`, then returns the value of `key`.
    ///
    /// The condition is re-checked after every wake-up. There is no timeout:
    /// the only ways out are the condition becoming true or `cancel` firing.
    pub fn get_when(
        &self,
        key: &str,
        cond_key: &str,
        cond_value: &[u8],
        cancel: &CancelFlag,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let shard = &self.values[self.value_shard_index(cond_key)];
        let mut pending = shard.pending.lock();
        let handle = Arc::clone(
            pending
                .entry(cond_key.to_string())
                .or_insert_with(|| Arc::new(Condvar::new())),
        );

        let outcome = loop {
            if cancel.is_cancelled() {
                break Err(StoreError::Cancelled);
            }
            let satisfied = shard
                .entries
                .read()
                .get(cond_key)
                .is_some_and(|current| current.as_slice() == cond_value);
            if satisfied {
                break Ok(());
            }
            handle.wait(&mut pending);
        };

        release_handle(&mut pending, cond_key, handle);
        drop(pending);

        outcome.map(|()| self.get(key))
    }

    /// Wakes every registered conditional reader so it re-checks its condition.
    pub fn wake_waiters(&self) {
        for shard in &self.values {
            let pending = shard.pending.lock();
            for handle in pending.values() {
                handle.notify_all();
            }
        }
    }

    /// Number of guard keys with at least one registered waiter.
    pub fn pending_conditions(&self) -> usize {
        self.values
            .iter()
            .map(|shard| shard.pending.lock().len())
            .sum()
    }

    fn notify_waiters(&self, key: &str) {
        let shard = &self.values[self.value_shard_index(key)];
        let pending = shard.pending.lock();
        if let Some(handle) = pending.get(key) {
            trace!(key, "waking conditional readers");
            handle.notify_all();
        }
    }
}

fn shard_index(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Drops the registry entry for `key` when the caller was its last waiter.
fn release_handle(
    pending: &mut MutexGuard<'_, HashMap<String, Arc<Condvar>>>,
    key: &str,
    handle: Arc<Condvar>,
) {
    if let Some(registered) = pending.get(key) {
        if Arc::ptr_eq(registered, &handle) && Arc::strong_count(&handle) == 2 {
            pending.remove(key);
        }
    }
}
