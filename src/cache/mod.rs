//! Content-addressed translation store.
//! Key: blake3 digest of the original segment text. Entries live in memory and
//! are persisted to a [`DurableStore`] through a debounced batch writer, the
//! same way history records are coalesced before hitting SQLite.

pub mod sqlite;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Default entry lifetime since last access: 30 days.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Default write-coalescing window.
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// 256-bit content digest used as cache key and in-flight dedup key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(text: &str) -> Self {
        Self(*blake3::hash(text.as_bytes()).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(|h| Self(*h.as_bytes()))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

/// Time source for entry timestamps (Unix milliseconds).
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Manually driven clock for tests and replay tools.
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// One cached translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub original_text: String,
    pub translated_text: String,
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub access_count: u64,
    /// Set for failed translations. Error entries are session-only and are
    /// never written to the durable store.
    #[serde(skip)]
    pub error: Option<String>,
}

impl CacheEntry {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    fn is_expired(&self, now_ms: i64, ttl: Duration) -> bool {
        now_ms.saturating_sub(self.last_accessed_at) > ttl.as_millis() as i64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
    #[error("durable store query failed: {0}")]
    Query(String),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Everything loaded from the durable store at start-up.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    /// (hex hash, serialized [`CacheEntry`])
    pub entries: Vec<(String, String)>,
    pub settings: Vec<(String, String)>,
}

/// One coalesced flush.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub puts: Vec<(String, String)>,
    pub deletes: Vec<String>,
    pub settings: Vec<(String, String)>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty() && self.settings.is_empty()
    }
}

/// Persisted key-value map behind the content store. Calls are blocking and
/// are always issued from `spawn_blocking`.
pub trait DurableStore: Send + Sync {
    fn load(&self) -> Result<Snapshot, StoreError>;
    fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

/// In-process durable store. Useful for hosts without a database and in tests
/// (can be switched into a failing mode).
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    settings: Mutex<HashMap<String, String>>,
    failing: std::sync::atomic::AtomicBool,
    applied_batches: std::sync::atomic::AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn applied_batches(&self) -> usize {
        self.applied_batches.load(Ordering::SeqCst)
    }

    pub fn raw_entry(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn setting(&self, name: &str) -> Option<String> {
        self.settings.lock().get(name).cloned()
    }
}

impl DurableStore for MemoryStore {
    fn load(&self) -> Result<Snapshot, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        Ok(Snapshot {
            entries: self.entries.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            settings: self.settings.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        let mut entries = self.entries.lock();
        for key in &batch.deletes {
            entries.remove(key);
        }
        for (key, value) in &batch.puts {
            entries.insert(key.clone(), value.clone());
        }
        self.settings.lock().extend(batch.settings.iter().cloned());
        self.applied_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct StoreState {
    entries: HashMap<ContentHash, CacheEntry>,
    settings: HashMap<String, String>,
    dirty: HashSet<ContentHash>,
    dirty_settings: HashSet<String>,
    hits: u64,
    misses: u64,
}

impl StoreState {
    fn mark_dirty(&mut self, hash: ContentHash) {
        self.dirty.insert(hash);
    }

    fn take_batch(&mut self) -> WriteBatch {
        let mut batch = WriteBatch::default();
        for hash in self.dirty.drain() {
            let key = hash.to_hex();
            match self.entries.get(&hash) {
                Some(entry) if !entry.is_error() => match serde_json::to_string(entry) {
                    Ok(json) => batch.puts.push((key, json)),
                    Err(e) => warn!(error = %e, %key, "cache entry serialization failed"),
                },
                _ => batch.deletes.push(key),
            }
        }
        for name in self.dirty_settings.drain() {
            if let Some(value) = self.settings.get(&name) {
                batch.settings.push((name, value.clone()));
            }
        }
        batch
    }
}

/// Content store: get/set/delete/sweep over content hashes, with a
/// write-coalescing flush to the durable store.
pub struct ContentStore {
    state: Mutex<StoreState>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    durable: Mutex<Option<Arc<dyn DurableStore>>>,
    wakeup: Arc<Notify>,
    /// Serializes flushes so batches reach the durable store in order.
    flush_lock: tokio::sync::Mutex<()>,
}

impl ContentStore {
    /// Memory-only store (no durable backing).
    pub fn in_memory(ttl: Duration, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::build(ttl, clock, None, Snapshot::default()))
    }

    /// Load the durable store and start the debounced writer. Must be called
    /// within a Tokio runtime. A failing durable store degrades to memory-only.
    pub fn open(
        durable: Arc<dyn DurableStore>,
        ttl: Duration,
        flush_debounce: Duration,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (snapshot, durable) = match durable.load() {
            Ok(snapshot) => (snapshot, Some(durable)),
            Err(e) => {
                warn!(error = %e, "durable store load failed, continuing memory-only");
                (Snapshot::default(), None)
            }
        };
        let store = Arc::new(Self::build(ttl, clock, durable, snapshot));
        tokio::spawn(flush_loop(
            Arc::downgrade(&store),
            Arc::clone(&store.wakeup),
            flush_debounce,
        ));
        store
    }

    fn build(
        ttl: Duration,
        clock: Arc<dyn Clock>,
        durable: Option<Arc<dyn DurableStore>>,
        snapshot: Snapshot,
    ) -> Self {
        let mut entries = HashMap::with_capacity(snapshot.entries.len());
        for (key, json) in snapshot.entries {
            let Some(hash) = ContentHash::from_hex(&key) else {
                warn!(%key, "skipping cache record with malformed key");
                continue;
            };
            match serde_json::from_str::<CacheEntry>(&json) {
                Ok(entry) => {
                    entries.insert(hash, entry);
                }
                Err(e) => warn!(error = %e, %key, "skipping corrupt cache record"),
            }
        }
        if !entries.is_empty() {
            info!(entries = entries.len(), "content store loaded");
        }

        Self {
            state: Mutex::new(StoreState {
                entries,
                settings: snapshot.settings.into_iter().collect(),
                dirty: HashSet::new(),
                dirty_settings: HashSet::new(),
                hits: 0,
                misses: 0,
            }),
            ttl,
            clock,
            durable: Mutex::new(durable),
            wakeup: Arc::new(Notify::new()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether writes still reach a durable store.
    pub fn is_persistent(&self) -> bool {
        self.durable.lock().is_some()
    }

    /// Look up an entry. Expired entries read as absent but stay in place
    /// until [`sweep_expired`](Self::sweep_expired). A hit refreshes
    /// `last_accessed_at` and bumps `access_count`.
    pub fn get(&self, hash: &ContentHash) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let hit = match state.entries.get_mut(hash) {
            Some(entry) if !entry.is_expired(now, self.ttl) => {
                entry.last_accessed_at = entry.last_accessed_at.max(now);
                entry.access_count += 1;
                Some(entry.clone())
            }
            _ => None,
        };
        match hit {
            Some(entry) => {
                state.hits += 1;
                if !entry.is_error() {
                    state.mark_dirty(*hash);
                }
                Some(entry)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Read a live entry without touching access bookkeeping or stats.
    pub fn peek(&self, hash: &ContentHash) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        self.state
            .lock()
            .entries
            .get(hash)
            .filter(|e| !e.is_expired(now, self.ttl))
            .cloned()
    }

    /// Batch lookup with the same semantics as [`get`](Self::get).
    pub fn get_many<'a>(
        &self,
        hashes: impl IntoIterator<Item = &'a ContentHash>,
    ) -> HashMap<ContentHash, CacheEntry> {
        hashes
            .into_iter()
            .filter_map(|h| self.get(h).map(|e| (*h, e)))
            .collect()
    }

    /// Upsert a successful translation. Keeps `created_at` of an existing
    /// entry; writes never count as accesses.
    pub fn set(&self, hash: ContentHash, original: &str, translated: &str) {
        self.upsert(hash, original, translated.to_string(), None);
    }

    /// Record a failed translation for this session.
    pub fn set_error(&self, hash: ContentHash, original: &str, message: &str) {
        self.upsert(hash, original, String::new(), Some(message.to_string()));
    }

    fn upsert(&self, hash: ContentHash, original: &str, translated: String, error: Option<String>) {
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();
            let entry = state.entries.entry(hash).or_insert_with(|| CacheEntry {
                original_text: original.to_string(),
                translated_text: String::new(),
                created_at: now,
                last_accessed_at: now,
                access_count: 0,
                error: None,
            });
            entry.original_text = original.to_string();
            entry.translated_text = translated;
            entry.last_accessed_at = entry.last_accessed_at.max(now);
            entry.error = error;
            state.mark_dirty(hash);
        }
        self.wakeup.notify_one();
    }

    pub fn delete(&self, hash: &ContentHash) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.entries.remove(hash).is_some();
            if removed {
                state.mark_dirty(*hash);
            }
            removed
        };
        if removed {
            self.wakeup.notify_one();
        }
    }

    /// Remove entries not accessed within `ttl`. Returns the number removed.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let now = self.clock.now_ms();
        let removed = {
            let mut state = self.state.lock();
            let expired: Vec<ContentHash> = state
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now, ttl))
                .map(|(h, _)| *h)
                .collect();
            for hash in &expired {
                state.entries.remove(hash);
                state.mark_dirty(*hash);
            }
            expired.len()
        };
        if removed > 0 {
            info!(removed, "content store sweep");
            self.wakeup.notify_one();
        }
        removed
    }

    /// Drop every entry. Returns the number removed.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let hashes: Vec<ContentHash> = state.entries.keys().copied().collect();
            state.entries.clear();
            state.dirty.extend(hashes.iter().copied());
            hashes.len()
        };
        if removed > 0 {
            self.wakeup.notify_one();
        }
        removed
    }

    pub fn setting(&self, name: &str) -> Option<String> {
        self.state.lock().settings.get(name).cloned()
    }

    pub fn set_setting(&self, name: &str, value: &str) {
        {
            let mut state = self.state.lock();
            state.settings.insert(name.to_string(), value.to_string());
            state.dirty_settings.insert(name.to_string());
        }
        self.wakeup.notify_one();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
        }
    }

    /// Write every pending change to the durable store now. On failure the
    /// store switches to memory-only for the rest of the session.
    pub async fn flush(&self) {
        let _serial = self.flush_lock.lock().await;
        let Some(durable) = self.durable.lock().clone() else {
            // Memory-only: nothing to persist, drop the dirty marks.
            let mut state = self.state.lock();
            state.dirty.clear();
            state.dirty_settings.clear();
            return;
        };
        let batch = self.state.lock().take_batch();
        if batch.is_empty() {
            return;
        }

        let (puts, deletes) = (batch.puts.len(), batch.deletes.len());
        let start = std::time::Instant::now();
        let result = tokio::task::spawn_blocking(move || durable.apply(&batch)).await;
        match result {
            Ok(Ok(())) => debug!(
                puts,
                deletes,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "content store flushed"
            ),
            Ok(Err(e)) => {
                warn!(error = %e, "content store flush failed, continuing memory-only");
                *self.durable.lock() = None;
            }
            Err(e) => {
                warn!(error = %e, "content store flush task panicked, continuing memory-only");
                *self.durable.lock() = None;
            }
        }
    }
}

impl Drop for ContentStore {
    /// Wake the writer so it observes the dropped store and exits.
    fn drop(&mut self) {
        self.wakeup.notify_one();
    }
}

/// Debounced writer: waits for a mutation, lets the burst settle for
/// `debounce`, then flushes once. Exits when the store is dropped.
async fn flush_loop(store: Weak<ContentStore>, wakeup: Arc<Notify>, debounce: Duration) {
    loop {
        wakeup.notified().await;
        tokio::time::sleep(debounce).await;
        let Some(store) = store.upgrade() else {
            break;
        };
        store.flush().await;
    }
    debug!("content store flush loop exiting");
}

/// Periodic expiry sweep (hourly, plus once immediately).
pub fn start_sweep_loop(store: &Arc<ContentStore>, every: Duration) {
    let weak = Arc::downgrade(store);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let Some(store) = weak.upgrade() else {
                break;
            };
            store.sweep_expired(store.ttl());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn store_with_clock() -> (Arc<ContentStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = ContentStore::in_memory(DEFAULT_TTL, clock.clone());
        (store, clock)
    }

    #[test]
    fn hash_is_deterministic_and_hex_round_trips() {
        let a = ContentHash::of("hello");
        assert_eq!(a, ContentHash::of("hello"));
        assert_ne!(a, ContentHash::of("hello "));
        assert_eq!(ContentHash::from_hex(&a.to_hex()), Some(a));
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn set_then_get_within_ttl_and_absent_after() {
        let (store, clock) = store_with_clock();
        let h = ContentHash::of("A");
        store.set(h, "A", "甲");
        assert_eq!(store.get(&h).map(|e| e.translated_text), Some("甲".to_string()));

        clock.advance(DEFAULT_TTL + DAY);
        assert!(store.get(&h).is_none());
    }

    #[test]
    fn set_twice_counts_only_reads() {
        let (store, _) = store_with_clock();
        let h = ContentHash::of("o");
        store.set(h, "o", "t");
        store.set(h, "o", "t");
        assert_eq!(store.stats().entries, 1);
        assert_eq!(store.get(&h).map(|e| e.access_count), Some(1));
        assert_eq!(store.get(&h).map(|e| e.access_count), Some(2));
    }

    #[test]
    fn upsert_keeps_created_at_and_access_time_moves_forward() {
        let (store, clock) = store_with_clock();
        let h = ContentHash::of("x");
        store.set(h, "x", "1");
        let created = store.get(&h).map(|e| e.created_at);
        clock.advance(Duration::from_secs(60));
        store.set(h, "x", "2");
        let entry = store.get(&h).expect("entry present");
        assert_eq!(Some(entry.created_at), created);
        assert_eq!(entry.translated_text, "2");
        assert!(entry.last_accessed_at > entry.created_at);
    }

    #[test]
    fn expired_entry_survives_get_until_swept() {
        let (store, clock) = store_with_clock();
        let old = ContentHash::of("old");
        let fresh = ContentHash::of("fresh");
        store.set(old, "old", "旧");
        clock.advance(DEFAULT_TTL + DAY);
        store.set(fresh, "fresh", "新");

        assert!(store.get(&old).is_none());
        assert_eq!(store.stats().entries, 2);
        assert_eq!(store.sweep_expired(DEFAULT_TTL), 1);
        assert_eq!(store.stats().entries, 1);
        assert!(store.get(&fresh).is_some());
    }

    #[test]
    fn access_extends_lifetime() {
        let (store, clock) = store_with_clock();
        let h = ContentHash::of("kept");
        store.set(h, "kept", "留");
        clock.advance(DEFAULT_TTL - DAY);
        assert!(store.get(&h).is_some());
        clock.advance(2 * DAY);
        assert!(store.get(&h).is_some());
    }

    #[test]
    fn get_many_returns_only_hits() {
        let (store, _) = store_with_clock();
        let a = ContentHash::of("a");
        let b = ContentHash::of("b");
        store.set(a, "a", "α");
        let found = store.get_many([&a, &b]);
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&a));
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn delete_and_clear() {
        let (store, _) = store_with_clock();
        let a = ContentHash::of("a");
        store.set(a, "a", "α");
        store.set(ContentHash::of("b"), "b", "β");
        store.delete(&a);
        assert!(store.get(&a).is_none());
        assert_eq!(store.clear(), 1);
        assert_eq!(store.stats().entries, 0);
    }

    #[test]
    fn error_entries_are_readable_and_replaced_by_success() {
        let (store, _) = store_with_clock();
        let h = ContentHash::of("e");
        store.set_error(h, "e", "timeout");
        let entry = store.get(&h).expect("error entry");
        assert_eq!(entry.error.as_deref(), Some("timeout"));
        store.set(h, "e", "ok");
        assert!(!store.get(&h).expect("entry").is_error());
    }

    #[tokio::test]
    async fn flush_persists_and_reload_restores() {
        let durable = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let store = ContentStore::open(durable.clone(), DEFAULT_TTL, DEFAULT_FLUSH_DEBOUNCE, clock.clone());
        let h = ContentHash::of("persist me");
        store.set(h, "persist me", "保存我");
        store.set_error(ContentHash::of("bad"), "bad", "boom");
        store.set_setting("showTranslated", "false");
        store.flush().await;

        assert!(durable.raw_entry(&h.to_hex()).is_some());
        assert!(durable.raw_entry(&ContentHash::of("bad").to_hex()).is_none());
        assert_eq!(durable.setting("showTranslated").as_deref(), Some("false"));

        let reopened = ContentStore::open(durable, DEFAULT_TTL, DEFAULT_FLUSH_DEBOUNCE, clock);
        assert_eq!(reopened.get(&h).map(|e| e.translated_text), Some("保存我".to_string()));
        assert_eq!(reopened.setting("showTranslated").as_deref(), Some("false"));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_writes_coalesces_into_one_flush() {
        let durable = Arc::new(MemoryStore::new());
        let store = ContentStore::open(
            durable.clone(),
            DEFAULT_TTL,
            DEFAULT_FLUSH_DEBOUNCE,
            Arc::new(SystemClock),
        );
        for i in 0..20 {
            let text = format!("segment {i}");
            store.set(ContentHash::of(&text), &text, "译");
        }
        assert_eq!(durable.applied_batches(), 0);

        tokio::time::sleep(DEFAULT_FLUSH_DEBOUNCE * 2).await;
        assert_eq!(durable.applied_batches(), 1);
        assert!(durable.raw_entry(&ContentHash::of("segment 7").to_hex()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn writer_exits_after_store_is_dropped() {
        let durable = Arc::new(MemoryStore::new());
        let store = ContentStore::open(durable, DEFAULT_TTL, DEFAULT_FLUSH_DEBOUNCE, Arc::new(SystemClock));
        let wakeup = Arc::downgrade(&store.wakeup);
        tokio::task::yield_now().await;
        drop(store);

        tokio::time::sleep(DEFAULT_FLUSH_DEBOUNCE * 2).await;
        assert!(wakeup.upgrade().is_none(), "flush loop still holds its wakeup");
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_memory() {
        let durable = Arc::new(MemoryStore::new());
        durable.set_failing(true);
        let store = ContentStore::open(durable.clone(), DEFAULT_TTL, DEFAULT_FLUSH_DEBOUNCE, Arc::new(SystemClock));
        assert!(!store.is_persistent());

        let h = ContentHash::of("still works");
        store.set(h, "still works", "仍然可用");
        store.flush().await;
        assert!(store.get(&h).is_some());
    }

    #[tokio::test]
    async fn failed_flush_switches_to_memory_only() {
        let durable = Arc::new(MemoryStore::new());
        let store = ContentStore::open(durable.clone(), DEFAULT_TTL, DEFAULT_FLUSH_DEBOUNCE, Arc::new(SystemClock));
        assert!(store.is_persistent());
        durable.set_failing(true);
        store.set(ContentHash::of("x"), "x", "y");
        store.flush().await;
        assert!(!store.is_persistent());
        assert!(store.get(&ContentHash::of("x")).is_some());
    }
}
