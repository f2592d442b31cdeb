use crate::error::{Result, SpatialDbError};
use crate::io::{
    CoordinationStore, IndexStore, KeyValueStore, MemoryStats, ObjectStore, RowStore,
    StorageBackend, Transaction,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedMutexGuard};

const CHANNEL_CAPACITY: usize = 64;

fn check_online(offline: &AtomicBool) -> Result<()> {
    if offline.load(AtomicOrdering::SeqCst) {
        return Err(SpatialDbError::StorageConnection(
            "backend is offline".into(),
        ));
    }
    Ok(())
}

/// Totally ordered score for the sorted-set index
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(Score(old), member.to_string()));
        }
        self.ordered.insert((Score(score), member.to_string()));
    }

    fn remove(&mut self, member: &str) {
        if let Some(old) = self.scores.remove(member) {
            self.ordered.remove(&(Score(old), member.to_string()));
        }
    }
}

#[derive(Debug, Default)]
struct KvState {
    values: HashMap<String, Bytes>,
    used_bytes: u64,
}

impl KvState {
    fn set(&mut self, key: String, value: Bytes) {
        let added = (key.len() + value.len()) as u64;
        if let Some(old) = self.values.insert(key.clone(), value) {
            self.used_bytes -= (key.len() + old.len()) as u64;
        }
        self.used_bytes += added;
    }

    fn delete(&mut self, key: &str) {
        if let Some(old) = self.values.remove(key) {
            self.used_bytes -= (key.len() + old.len()) as u64;
        }
    }
}

/// In-process cache tier.
///
/// One instance serves as key-value store, sorted-set index and coordination
/// service at once. Memory usage counts key and value bytes against a
/// configured total.
pub struct MemoryCacheStore {
    kv: Mutex<KvState>,
    sets: Mutex<HashMap<String, SortedSet>>,
    locks: Mutex<HashMap<String, String>>,
    counters: Mutex<HashMap<String, i64>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    total_bytes: AtomicU64,
    offline: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            kv: Mutex::new(KvState::default()),
            sets: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            total_bytes: AtomicU64::new(total_bytes),
            offline: AtomicBool::new(false),
        }
    }

    /// Change the memory total reported by `memory_stats`
    pub fn set_total_bytes(&self, total_bytes: u64) {
        self.total_bytes.store(total_bytes, AtomicOrdering::SeqCst);
    }

    /// Simulate a lost connection; every call fails with `StorageConnection`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.kv.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

#[async_trait]
impl KeyValueStore for MemoryCacheStore {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        check_online(&self.offline)?;
        let kv = self.kv.lock();
        Ok(keys.iter().map(|k| kv.values.get(k).cloned()).collect())
    }

    async fn set_many(&self, entries: Vec<(String, Bytes)>) -> Result<()> {
        check_online(&self.offline)?;
        let mut kv = self.kv.lock();
        for (key, value) in entries {
            kv.set(key, value);
        }
        Ok(())
    }

    async fn set_if_absent_many(&self, entries: Vec<(String, Bytes)>) -> Result<Vec<bool>> {
        check_online(&self.offline)?;
        let mut kv = self.kv.lock();
        Ok(entries
            .into_iter()
            .map(|(key, value)| {
                if kv.values.contains_key(&key) {
                    false
                } else {
                    kv.set(key, value);
                    true
                }
            })
            .collect())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        check_online(&self.offline)?;
        let mut kv = self.kv.lock();
        for key in keys {
            kv.delete(key);
        }
        Ok(())
    }

    async fn memory_stats(&self) -> Result<MemoryStats> {
        check_online(&self.offline)?;
        Ok(MemoryStats {
            used_bytes: self.kv.lock().used_bytes,
            total_bytes: self.total_bytes.load(AtomicOrdering::SeqCst),
        })
    }
}

#[async_trait]
impl IndexStore for MemoryCacheStore {
    async fn add(&self, set: &str, members: &[(String, f64)]) -> Result<()> {
        check_online(&self.offline)?;
        let mut sets = self.sets.lock();
        let entry = sets.entry(set.to_string()).or_default();
        for (member, score) in members {
            entry.insert(member, *score);
        }
        Ok(())
    }

    async fn scores(&self, set: &str, members: &[String]) -> Result<Vec<Option<f64>>> {
        check_online(&self.offline)?;
        let sets = self.sets.lock();
        let entry = sets.get(set);
        Ok(members
            .iter()
            .map(|m| entry.and_then(|s| s.scores.get(m).copied()))
            .collect())
    }

    async fn range_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        check_online(&self.offline)?;
        let sets = self.sets.lock();
        let Some(entry) = sets.get(set) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .ordered
            .iter()
            .filter(|(score, _)| score.0 >= min && score.0 <= max)
            .skip(offset)
            .take(limit)
            .map(|(score, member)| (member.clone(), score.0))
            .collect())
    }

    async fn remove(&self, set: &str, members: &[String]) -> Result<()> {
        check_online(&self.offline)?;
        let mut sets = self.sets.lock();
        if let Some(entry) = sets.get_mut(set) {
            for member in members {
                entry.remove(member);
            }
        }
        Ok(())
    }

    async fn cardinality(&self, set: &str) -> Result<usize> {
        check_online(&self.offline)?;
        Ok(self.sets.lock().get(set).map_or(0, |s| s.scores.len()))
    }
}

#[async_trait]
impl CoordinationStore for MemoryCacheStore {
    async fn try_lock(&self, name: &str, token: &str) -> Result<bool> {
        check_online(&self.offline)?;
        let mut locks = self.locks.lock();
        if locks.contains_key(name) {
            return Ok(false);
        }
        locks.insert(name.to_string(), token.to_string());
        Ok(true)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        check_online(&self.offline)?;
        let mut locks = self.locks.lock();
        match locks.get(name) {
            Some(owner) if owner == token => {
                locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn counter(&self, name: &str) -> Result<i64> {
        check_online(&self.offline)?;
        Ok(self.counters.lock().get(name).copied().unwrap_or(0))
    }

    async fn add_to_counter(&self, name: &str, delta: i64) -> Result<i64> {
        check_online(&self.offline)?;
        let mut counters = self.counters.lock();
        let value = counters.entry(name.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn set_counter(&self, name: &str, value: i64) -> Result<()> {
        check_online(&self.offline)?;
        self.counters.lock().insert(name.to_string(), value);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        check_online(&self.offline)?;
        // No subscribers is not an error
        Ok(self.sender(channel).send(message.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        check_online(&self.offline)?;
        Ok(self.sender(channel).subscribe())
    }
}

/// In-process durable tier
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    offline: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        check_online(&self.offline)?;
        Ok(self.objects.lock().get(path).cloned())
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        check_online(&self.offline)?;
        self.objects.lock().insert(path.to_string(), data);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        check_online(&self.offline)?;
        Ok(self.objects.lock().contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        check_online(&self.offline)?;
        self.objects.lock().remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        check_online(&self.offline)?;
        let mut paths: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

type RowId = (String, String);

#[derive(Default)]
struct RowState {
    rows: Mutex<HashMap<RowId, Bytes>>,
    locks: Mutex<HashMap<RowId, Arc<tokio::sync::Mutex<()>>>>,
    offline: AtomicBool,
}

/// In-process transactional row store with row-level locks
#[derive(Default, Clone)]
pub struct MemoryRowStore {
    state: Arc<RowState>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Rows with a lock entry, held or awaited
    pub fn lock_entries(&self) -> usize {
        self.state.locks.lock().len()
    }

    /// Committed row count of `table`
    pub fn table_len(&self, table: &str) -> usize {
        self.state
            .rows
            .lock()
            .keys()
            .filter(|(t, _)| t == table)
            .count()
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        check_online(&self.state.offline)?;
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            guards: HashMap::new(),
            writes: HashMap::new(),
        }))
    }
}

/// Open transaction over a [`MemoryRowStore`].
///
/// Writes are buffered and applied atomically on commit; dropping the
/// transaction without committing discards them and releases its locks.
struct MemoryTransaction {
    state: Arc<RowState>,
    guards: HashMap<RowId, OwnedMutexGuard<()>>,
    writes: HashMap<RowId, Option<Bytes>>,
}

impl MemoryTransaction {
    fn visible(&self, id: &RowId) -> Option<Bytes> {
        match self.writes.get(id) {
            Some(pending) => pending.clone(),
            None => self.state.rows.lock().get(id).cloned(),
        }
    }

    async fn lock(&mut self, id: &RowId) -> Result<()> {
        check_online(&self.state.offline)?;
        if self.guards.contains_key(id) {
            return Ok(());
        }
        let mutex = Arc::clone(self.state.locks.lock().entry(id.clone()).or_default());
        let guard = mutex.lock_owned().await;
        self.guards.insert(id.clone(), guard);
        Ok(())
    }
}

fn row_id(table: &str, key: &str) -> RowId {
    (table.to_string(), key.to_string())
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn select(&mut self, table: &str, key: &str) -> Result<Option<Bytes>> {
        check_online(&self.state.offline)?;
        Ok(self.visible(&row_id(table, key)))
    }

    async fn select_for_update(&mut self, table: &str, key: &str) -> Result<Option<Bytes>> {
        let id = row_id(table, key);
        self.lock(&id).await?;
        Ok(self.visible(&id))
    }

    async fn lock_row(&mut self, table: &str, key: &str) -> Result<()> {
        self.lock(&row_id(table, key)).await
    }

    async fn insert(&mut self, table: &str, key: &str, value: Bytes) -> Result<()> {
        let id = row_id(table, key);
        self.lock(&id).await?;
        if self.visible(&id).is_some() {
            return Err(SpatialDbError::AlreadyExists(format!("{}/{}", table, key)));
        }
        self.writes.insert(id, Some(value));
        Ok(())
    }

    async fn update(&mut self, table: &str, key: &str, value: Bytes) -> Result<()> {
        let id = row_id(table, key);
        self.lock(&id).await?;
        if self.visible(&id).is_none() {
            return Err(SpatialDbError::NotFound(format!("{}/{}", table, key)));
        }
        self.writes.insert(id, Some(value));
        Ok(())
    }

    async fn delete(&mut self, table: &str, key: &str) -> Result<()> {
        let id = row_id(table, key);
        self.lock(&id).await?;
        self.writes.insert(id, None);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        check_online(&self.state.offline)?;
        let writes = std::mem::take(&mut self.writes);
        let mut rows = self.state.rows.lock();
        for (id, value) in writes {
            match value {
                Some(v) => {
                    rows.insert(id, v);
                }
                None => {
                    rows.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        let held: Vec<RowId> = self.guards.drain().map(|(id, _)| id).collect();
        // Entries only the map still references have no holder or waiter
        let mut locks = self.state.locks.lock();
        for id in held {
            if locks.get(&id).is_some_and(|m| Arc::strong_count(m) == 1) {
                locks.remove(&id);
            }
        }
    }
}
