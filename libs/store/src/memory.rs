use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{as_number, merge_values, now_ms, numeric_value, Entry, StateStore, StoreError};

#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Bounded size; at capacity the oldest-inserted key is evicted.
    pub max_size: usize,
    /// Applied to `set` calls that carry no TTL of their own.
    pub default_ttl: Option<u64>,
    /// Number of one-second slots in the timing wheel.
    pub wheel_slots: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            default_ttl: None,
            wheel_slots: 3600,
        }
    }
}

/// In-memory backend: a hash map guarded by a mutex, plus a timing wheel of
/// fixed slot count. A sweeper advances once per second and processes every
/// slot between its last cursor and the current second, so missed ticks and
/// clock jumps only delay expiry, never skip it. Reads double-check expiry.
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    config: MemoryStoreConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    map: HashMap<String, Entry>,
    /// Insertion order, one entry per live key, for FIFO eviction.
    order: VecDeque<String>,
    wheel: Vec<HashSet<String>>,
    /// Epoch second last processed by the sweeper.
    cursor: i64,
}

impl Inner {
    fn slot(&self, expires_at_ms: i64) -> usize {
        ((expires_at_ms / 1000).rem_euclid(self.wheel.len() as i64)) as usize
    }

    /// Process every slot from the cursor up to `now_secs`, capped at one
    /// full revolution. Entries that sit in a due slot but have not expired
    /// yet (wrap-around from TTLs longer than the wheel) stay put.
    fn sweep(&mut self, now_secs: i64) {
        if self.cursor >= now_secs {
            return;
        }
        let slots = self.wheel.len() as i64;
        let span = (now_secs - self.cursor).min(slots);
        let now = now_secs * 1000;

        for second in (now_secs - span + 1)..=now_secs {
            let idx = (second.rem_euclid(slots)) as usize;
            let keys: Vec<String> = self.wheel[idx].iter().cloned().collect();
            for key in keys {
                match self.map.get(&key) {
                    Some(entry) if entry.is_expired(now) => {
                        self.map.remove(&key);
                        self.wheel[idx].remove(&key);
                    }
                    Some(_) => {}
                    None => {
                        self.wheel[idx].remove(&key);
                    }
                }
            }
        }
        self.cursor = now_secs;
    }

    /// Lazy expiry on read.
    fn live_entry(&mut self, key: &str, now: i64) -> Option<&Entry> {
        if matches!(self.map.get(key), Some(e) if e.is_expired(now)) {
            self.map.remove(key);
            return None;
        }
        self.map.get(key)
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            map: HashMap::new(),
            order: VecDeque::new(),
            wheel: vec![HashSet::new(); config.wheel_slots.max(1)],
            cursor: now_ms() / 1000,
        }));

        // The sweeper only runs inside a tokio runtime; without one, lazy
        // expiry on read still upholds the contract.
        let sweeper = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let weak = Arc::downgrade(&inner);
            handle.spawn(async move {
                let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    inner.lock().sweep(now_ms() / 1000);
                }
            })
        });

        Self {
            inner,
            config,
            sweeper: Mutex::new(sweeper),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut inner = self.inner.lock();
        Ok(inner.live_entry(key, now_ms()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> Result<(), StoreError> {
        let now = now_ms();
        let entry = Entry::new(value, ttl.or(self.config.default_ttl), now);

        let mut inner = self.inner.lock();
        if !inner.map.contains_key(key) {
            while inner.map.len() >= self.config.max_size {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                if inner.map.remove(&oldest).is_some() {
                    tracing::debug!(key = %oldest, "memory store at capacity, evicted oldest key");
                }
            }
            inner.order.push_back(key.to_string());
        }
        if let Some(at) = entry.expires_at {
            let slot = inner.slot(at);
            inner.wheel[slot].insert(key.to_string());
        }
        inner.map.insert(key.to_string(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().map.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, by: f64) -> Result<Value, StoreError> {
        let now = now_ms();
        let mut inner = self.inner.lock();

        let prior = inner.live_entry(key, now).cloned();
        let new_value = numeric_value(as_number(prior.as_ref().map(|e| &e.value)) + by);

        let is_new = prior.is_none();
        let entry = match prior {
            Some(mut e) => {
                e.value = new_value.clone();
                e.updated_at = now;
                e
            }
            None => Entry::new(new_value.clone(), None, now),
        };
        inner.map.insert(key.to_string(), entry);
        if is_new {
            inner.order.push_back(key.to_string());
        }
        Ok(new_value)
    }

    async fn patch(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let now = now_ms();
        let mut inner = self.inner.lock();

        let prior = inner.live_entry(key, now).cloned();
        let is_new = prior.is_none();
        let entry = match prior {
            Some(mut e) => {
                e.value = merge_values(&e.value, value);
                e.updated_at = now;
                e
            }
            None => Entry::new(value, None, now),
        };
        inner.map.insert(key.to_string(), entry);
        if is_new {
            inner.order.push_back(key.to_string());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}
