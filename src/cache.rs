use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::config::CacheConfig;
use crate::log::Command;

/// A single cache entry plus the bookkeeping spec section 4.6 requires:
/// wall-clock timestamps for TTL (advisory, not replicated), and a logical
/// access sequence number for LRU ordering (command-stream-derived, so it is
/// identical across replicas regardless of wall-clock skew).
#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    #[allow(dead_code)]
    created_at: SystemTime,
    last_access_at: SystemTime,
    access_count: u64,
    expires_at: Option<SystemTime>,
    /// Strictly increasing per-apply sequence number; the ordering key used
    /// for LRU eviction. Never derived from wall-clock time.
    access_seq: u64,
}

/// Bounded LRU + TTL key/value cache, the state machine every committed
/// command is applied to (spec section 4.6).
///
/// Size-triggered eviction is driven only by `access_seq`, which advances
/// once per applied command — never by `SystemTime`, so two replicas that
/// have applied the same command prefix always agree on which key is
/// evicted, even if their clocks disagree. This is the reason `moka` (whose
/// eviction timing is opaque to the caller) is not used here, unlike
/// elsewhere in the teacher's stack — see DESIGN.md.
pub struct Cache {
    entries: HashMap<String, Entry>,
    /// (access_seq, key) ordered index; the minimum is the LRU victim. Key
    /// is part of the ordering tuple solely to keep `BTreeSet` total order
    /// well-defined — ties on `access_seq` cannot occur since each command
    /// consumes a unique sequence number, but keeping key in the tuple also
    /// gives us the lexicographic tiebreak spec section 4.6 mandates if that
    /// ever changes.
    order: BTreeSet<(u64, String)>,
    max_size: usize,
    next_seq: u64,
    stats: Stats,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
}

impl Cache {
    pub fn new(config: &CacheConfig) -> Self {
        Cache {
            entries: HashMap::new(),
            order: BTreeSet::new(),
            max_size: config.max_size.max(1),
            next_seq: 0,
            stats: Stats::default(),
        }
    }

    fn tick(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn touch_order(&mut self, key: &str, seq: u64) {
        if let Some(entry) = self.entries.get(key) {
            self.order.remove(&(entry.access_seq, key.to_string()));
        }
        self.order.insert((seq, key.to_string()));
    }

    /// Applies one committed command to the state machine, in index order
    /// (the apply loop guarantees this — spec section 4.4).
    pub fn apply(&mut self, command: &Command, apply_time: SystemTime) {
        match command {
            Command::Set {
                key,
                value,
                ttl_millis,
            } => self.set(key, value.clone(), *ttl_millis, apply_time),
            Command::Delete { key } => {
                self.delete(key);
            }
            Command::Clear => self.clear(),
        }
    }

    fn set(&mut self, key: &str, value: Vec<u8>, ttl_millis: Option<u64>, apply_time: SystemTime) {
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_size {
            self.evict_one();
        }

        let seq = self.tick();
        self.touch_order(key, seq);

        let expires_at = ttl_millis.map(|ms| apply_time + Duration::from_millis(ms));
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: apply_time,
                last_access_at: apply_time,
                access_count: 0,
                expires_at,
                access_seq: seq,
            },
        );
        self.stats.sets += 1;
    }

    fn delete(&mut self, key: &str) -> bool {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&(entry.access_seq, key.to_string()));
            self.stats.deletes += 1;
            true
        } else {
            false
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Evicts the least-recently-accessed entry. Ties (which cannot occur in
    /// practice since every command consumes a unique sequence number) break
    /// on the lexicographically smallest key, per spec section 4.6 — the
    /// `(seq, key)` tuple ordering gives us that for free.
    fn evict_one(&mut self) {
        if let Some(&(seq, ref key)) = self.order.iter().next() {
            let key = key.clone();
            self.order.remove(&(seq, key.clone()));
            self.entries.remove(&key);
            self.stats.evictions += 1;
        }
    }

    /// Local, non-replicated read (spec section 4.6). Updates
    /// `last_access_at`/`access_count` for observability, but read-only
    /// accesses never feed eviction ordering directly — only `set`-induced
    /// updates do, since eviction order must be derivable from the command
    /// stream alone. An expired entry is removed and reported absent.
    pub fn get(&mut self, key: &str, now: SystemTime) -> Option<Vec<u8>> {
        let expired =
            matches!(self.entries.get(key), Some(e) if e.expires_at.is_some_and(|exp| now > exp));
        if expired {
            if let Some(entry) = self.entries.remove(key) {
                self.order.remove(&(entry.access_seq, key.to_string()));
            }
            self.stats.misses += 1;
            return None;
        }

        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access_at = now;
                entry.access_count += 1;
                self.stats.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// All non-expired keys, sorted for deterministic output. Not part of
    /// spec.md's minimum client surface; restored from the original
    /// prototype's `get_all_keys` (see SPEC_FULL.md section D).
    pub fn keys(&mut self, now: SystemTime) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|exp| now > exp))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.delete(&key);
        }
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> Stats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(max_size: usize) -> CacheConfig {
        CacheConfig { max_size }
    }

    fn set(key: &str, value: u8) -> Command {
        Command::Set {
            key: key.to_string(),
            value: vec![value],
            ttl_millis: None,
        }
    }

    #[test]
    fn lru_eviction_is_deterministic() {
        let mut cache = Cache::new(&config(2));
        let t = SystemTime::now();
        cache.apply(&set("a", 1), t);
        cache.apply(&set("b", 2), t);
        cache.apply(&set("c", 3), t);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", t).is_none());
        assert_eq!(cache.get("b", t), Some(vec![2]));
        assert_eq!(cache.get("c", t), Some(vec![3]));
    }

    #[test]
    fn set_induced_access_protects_from_eviction() {
        let mut cache = Cache::new(&config(2));
        let t = SystemTime::now();
        cache.apply(&set("a", 1), t);
        cache.apply(&set("b", 2), t);
        // Re-setting "a" refreshes its access order ahead of "b".
        cache.apply(&set("a", 10), t);
        cache.apply(&set("c", 3), t);

        assert!(cache.get("b", t).is_none());
        assert_eq!(cache.get("a", t), Some(vec![10]));
        assert_eq!(cache.get("c", t), Some(vec![3]));
    }

    #[test]
    fn delete_then_get_is_absent() {
        let mut cache = Cache::new(&config(10));
        let t = SystemTime::now();
        cache.apply(&set("k", 1), t);
        cache.apply(
            &Command::Delete {
                key: "k".to_string(),
            },
            t,
        );
        assert_eq!(cache.get("k", t), None);
    }

    #[test]
    fn clear_removes_everything() {
        let mut cache = Cache::new(&config(10));
        let t = SystemTime::now();
        cache.apply(&set("a", 1), t);
        cache.apply(&set("b", 2), t);
        cache.apply(&Command::Clear, t);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get("a", t), None);
    }

    #[test]
    fn ttl_expiry_is_local_and_wall_clock_driven() {
        let mut cache = Cache::new(&config(10));
        let t0 = SystemTime::now();
        cache.apply(
            &Command::Set {
                key: "k".to_string(),
                value: vec![1],
                ttl_millis: Some(10),
            },
            t0,
        );
        assert_eq!(cache.get("k", t0), Some(vec![1]));
        let later = t0 + Duration::from_millis(50);
        assert_eq!(cache.get("k", later), None);
    }

    #[test]
    fn replaying_commands_on_a_fresh_machine_matches() {
        let commands = vec![set("a", 1), set("b", 2), set("c", 3), set("b", 20)];
        let t = SystemTime::now();

        let mut m1 = Cache::new(&config(2));
        let mut m2 = Cache::new(&config(2));
        for cmd in &commands {
            m1.apply(cmd, t);
            m2.apply(cmd, t);
        }

        let mut k1 = m1.keys(t);
        let mut k2 = m2.keys(t);
        k1.sort();
        k2.sort();
        assert_eq!(k1, k2);
        for k in &k1 {
            assert_eq!(m1.get(k, t), m2.get(k, t));
        }
    }
}
