//! Token-id -> lineage cache with TTL, capacity caps and pluggable
//! eviction.
//!
//! The map, the dependency index and the statistics live behind one coarse
//! mutex, so each cache operation is atomic with respect to concurrent
//! readers (the shared-resource policy: a get/set pair never observes a
//! half-applied invalidation).

pub mod policy;

use self::policy::{EntryMeta, EvictionPolicy, LfuPolicy, LruPolicy, MemoryPolicy, TtlPolicy};
use crate::engine::Lineage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tokenflow_types::LogEntry;

static TOKEN_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\btok_\d+\b").expect("valid regex"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub ttl_ms: i64,
    pub strategy: EvictionStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_bytes: 50 * 1024 * 1024,
            ttl_ms: 5 * 60 * 1_000,
            strategy: EvictionStrategy::Lru,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    Lru,
    Lfu,
    Ttl,
    Memory,
}

impl EvictionStrategy {
    fn policy(self) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionStrategy::Lru => Box::new(LruPolicy),
            EvictionStrategy::Lfu => Box::new(LfuPolicy),
            EvictionStrategy::Ttl => Box::new(TtlPolicy),
            EvictionStrategy::Memory => Box::new(MemoryPolicy),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub total_evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    lineage: Lineage,
    #[allow(dead_code)]
    computed_in_ms: u64,
    size_bytes: usize,
    deps: BTreeSet<String>,
    last_access_ms: i64,
    access_count: u64,
    created_ms: i64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// token id -> cache keys whose lineage depends on it.
    dep_index: HashMap<String, BTreeSet<String>>,
    stats: CacheStats,
}

pub struct LineageCache {
    config: CacheConfig,
    policy: Box<dyn EvictionPolicy>,
    inner: Mutex<Inner>,
}

impl LineageCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            policy: config.strategy.policy(),
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn get(&self, token_id: &str) -> Option<Lineage> {
        self.get_at(token_id, Self::now_ms())
    }

    /// Clock-explicit variant; TTL is enforced here, so an expired entry is
    /// removed and reported as a miss.
    pub fn get_at(&self, token_id: &str, now_ms: i64) -> Option<Lineage> {
        let mut inner = self.inner.lock().expect("cache lock");

        let expired = inner
            .entries
            .get(token_id)
            .map(|entry| now_ms.saturating_sub(entry.created_ms) > self.config.ttl_ms);
        let Some(expired) = expired else {
            inner.stats.misses += 1;
            return None;
        };

        if expired {
            remove_entry(&mut inner, token_id);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            refresh_sizes(&mut inner);
            return None;
        }

        let entry = inner.entries.get_mut(token_id).expect("present");
        entry.last_access_ms = now_ms;
        entry.access_count += 1;
        let lineage = entry.lineage.clone();
        inner.stats.hits += 1;
        Some(lineage)
    }

    pub fn set(&self, token_id: &str, lineage: Lineage, computed_in_ms: u64) {
        self.set_at(token_id, lineage, computed_in_ms, Self::now_ms())
    }

    pub fn set_at(&self, token_id: &str, lineage: Lineage, computed_in_ms: u64, now_ms: i64) {
        let size_bytes = estimate_size(&lineage);
        let deps: BTreeSet<String> = lineage.dependency_ids().map(String::from).collect();

        let mut inner = self.inner.lock().expect("cache lock");

        // Replacing an entry frees its slot before capacity is checked.
        if inner.entries.contains_key(token_id) {
            remove_entry(&mut inner, token_id);
        }

        // Capacity is ensured before insertion, under the configured policy.
        while inner.entries.len() + 1 > self.config.max_entries
            || current_bytes(&inner) + size_bytes > self.config.max_bytes
        {
            let metas: Vec<EntryMeta<'_>> = inner
                .entries
                .iter()
                .map(|(key, entry)| EntryMeta {
                    key,
                    last_access_ms: entry.last_access_ms,
                    access_count: entry.access_count,
                    created_ms: entry.created_ms,
                    size_bytes: entry.size_bytes,
                })
                .collect();
            let Some(victim) = self.policy.victim(&metas) else {
                break;
            };
            remove_entry(&mut inner, &victim);
            inner.stats.total_evictions += 1;
        }

        for dep in &deps {
            inner
                .dep_index
                .entry(dep.clone())
                .or_default()
                .insert(token_id.to_string());
        }
        inner.entries.insert(
            token_id.to_string(),
            CacheEntry {
                lineage,
                computed_in_ms,
                size_bytes,
                deps,
                last_access_ms: now_ms,
                access_count: 0,
                created_ms: now_ms,
            },
        );
        inner.stats.insertions += 1;
        refresh_sizes(&mut inner);
    }

    /// Drop one cached lineage. Idempotent: a second call is a no-op.
    pub fn invalidate(&self, token_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache lock");
        let removed = remove_entry(&mut inner, token_id);
        if removed {
            inner.stats.invalidations += 1;
            refresh_sizes(&mut inner);
        }
        removed
    }

    /// Drop every cached lineage whose dependency set touches `token_id`.
    pub fn invalidate_dependents(&self, token_id: &str) -> usize {
        let mut inner = self.inner.lock().expect("cache lock");
        let dependents: Vec<String> = inner
            .dep_index
            .get(token_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        let mut dropped = 0;
        for key in dependents {
            if remove_entry(&mut inner, &key) {
                dropped += 1;
            }
        }
        inner.stats.invalidations += dropped as u64;
        refresh_sizes(&mut inner);
        dropped
    }

    /// Invalidate everything affected by freshly appended log entries: the
    /// entries' own tokens, their referenced sources, and any token id
    /// mentioned inside operation details.
    pub fn invalidate_by_history_changes(&self, new_entries: &[LogEntry]) -> usize {
        let mut affected: BTreeSet<String> = BTreeSet::new();
        for entry in new_entries {
            if let Some(token_id) = &entry.token_id {
                affected.insert(token_id.clone());
            }
            for source in entry.source_ids() {
                affected.insert(source.to_string());
            }
            if let Some(details) = &entry.details {
                if let Ok(rendered) = serde_json::to_string(details) {
                    for found in TOKEN_ID.find_iter(&rendered) {
                        affected.insert(found.as_str().to_string());
                    }
                }
            }
        }

        let mut dropped = 0;
        for token_id in &affected {
            dropped += self.invalidate_dependents(token_id);
            if self.invalidate(token_id) {
                dropped += 1;
            }
        }
        dropped
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.entries.clear();
        inner.dep_index.clear();
        refresh_sizes(&mut inner);
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().expect("cache lock").stats.clone()
    }

    /// Purge expired entries; returns how many were dropped.
    pub fn maintenance(&self) -> usize {
        self.maintenance_at(Self::now_ms())
    }

    pub fn maintenance_at(&self, now_ms: i64) -> usize {
        let mut inner = self.inner.lock().expect("cache lock");
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| now_ms.saturating_sub(e.created_ms) > self.config.ttl_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            remove_entry(&mut inner, key);
            inner.stats.expirations += 1;
        }
        refresh_sizes(&mut inner);
        expired.len()
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.inner
            .lock()
            .expect("cache lock")
            .entries
            .contains_key(token_id)
    }
}

fn remove_entry(inner: &mut Inner, key: &str) -> bool {
    let Some(entry) = inner.entries.remove(key) else {
        return false;
    };
    for dep in &entry.deps {
        if let Some(keys) = inner.dep_index.get_mut(dep) {
            keys.remove(key);
            if keys.is_empty() {
                inner.dep_index.remove(dep);
            }
        }
    }
    true
}

fn current_bytes(inner: &Inner) -> usize {
    inner.entries.values().map(|e| e.size_bytes).sum()
}

fn refresh_sizes(inner: &mut Inner) {
    inner.stats.entries = inner.entries.len();
    inner.stats.bytes = current_bytes(inner);
}

/// Serialized length as the footprint estimate; stable across runs.
fn estimate_size(lineage: &Lineage) -> usize {
    serde_json::to_string(lineage).map(|s| s.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lineage(token_id: &str, ancestors: &[&str]) -> Lineage {
        Lineage {
            token_id: token_id.to_string(),
            generation_level: ancestors.len() as u32,
            ultimate_sources: ancestors.last().map(|s| vec![s.to_string()]).unwrap_or_default(),
            ancestors: ancestors
                .iter()
                .enumerate()
                .map(|(i, id)| crate::query::AncestorInfo {
                    token_id: id.to_string(),
                    generation_level: i as u32 + 1,
                    is_root: i == ancestors.len() - 1,
                    path: vec![token_id.to_string(), id.to_string()],
                })
                .collect(),
            descendants: Vec::new(),
            generations: BTreeMap::new(),
            source_contributions: BTreeMap::new(),
        }
    }

    fn cache(max_entries: usize, strategy: EvictionStrategy) -> LineageCache {
        LineageCache::new(CacheConfig {
            max_entries,
            max_bytes: usize::MAX,
            ttl_ms: 60_000,
            strategy,
        })
    }

    #[test]
    fn test_get_set_round_trip() {
        let cache = cache(10, EvictionStrategy::Lru);
        assert!(cache.get_at("tok_1", 0).is_none());
        cache.set_at("tok_1", lineage("tok_1", &["tok_0"]), 3, 0);
        let hit = cache.get_at("tok_1", 10).unwrap();
        assert_eq!(hit.token_id, "tok_1");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_lru_eviction_scenario() {
        // maxEntries=3: insert A, B, C, access A, insert D -> B evicted.
        let cache = cache(3, EvictionStrategy::Lru);
        cache.set_at("A", lineage("A", &[]), 1, 0);
        cache.set_at("B", lineage("B", &[]), 1, 1);
        cache.set_at("C", lineage("C", &[]), 1, 2);
        assert!(cache.get_at("A", 3).is_some());
        cache.set_at("D", lineage("D", &[]), 1, 4);

        assert!(cache.contains("A"));
        assert!(!cache.contains("B"));
        assert!(cache.contains("C"));
        assert!(cache.contains("D"));
        assert_eq!(cache.stats().total_evictions, 1);
    }

    #[test]
    fn test_lfu_eviction() {
        let cache = cache(2, EvictionStrategy::Lfu);
        cache.set_at("A", lineage("A", &[]), 1, 0);
        cache.set_at("B", lineage("B", &[]), 1, 1);
        // A becomes the frequent one.
        cache.get_at("A", 2);
        cache.get_at("A", 3);
        cache.get_at("B", 4);
        cache.set_at("C", lineage("C", &[]), 1, 5);
        assert!(cache.contains("A"));
        assert!(!cache.contains("B"));
    }

    #[test]
    fn test_ttl_expiry_on_get() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set_at("tok_1", lineage("tok_1", &[]), 1, 0);
        // Within TTL.
        assert!(cache.get_at("tok_1", 60_000).is_some());
        // Past TTL: miss, entry dropped, expiration counted.
        assert!(cache.get_at("tok_1", 60_001).is_none());
        assert!(!cache.contains("tok_1"));
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_byte_cap_evicts() {
        let small = lineage("A", &[]);
        let budget = estimate_size(&small) + estimate_size(&small) / 2;
        let cache = LineageCache::new(CacheConfig {
            max_entries: 100,
            max_bytes: budget,
            ttl_ms: 60_000,
            strategy: EvictionStrategy::Lru,
        });
        cache.set_at("A", lineage("A", &[]), 1, 0);
        cache.set_at("B", lineage("B", &[]), 1, 1);
        // Only one fits.
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().total_evictions, 1);
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set_at("tok_1", lineage("tok_1", &[]), 1, 0);
        assert!(cache.invalidate("tok_1"));
        assert!(!cache.invalidate("tok_1"));
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_invalidate_dependents() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set_at("tok_5", lineage("tok_5", &["tok_0"]), 1, 0);
        cache.set_at("tok_6", lineage("tok_6", &["tok_0"]), 1, 1);
        cache.set_at("tok_7", lineage("tok_7", &["tok_3"]), 1, 2);

        let dropped = cache.invalidate_dependents("tok_0");
        assert_eq!(dropped, 2);
        assert!(!cache.contains("tok_5"));
        assert!(!cache.contains("tok_6"));
        assert!(cache.contains("tok_7"));
    }

    #[test]
    fn test_invalidate_by_history_changes() {
        use tokenflow_types::{LogAction, LogEntry};

        let cache = cache(10, EvictionStrategy::Lru);
        cache.set_at("tok_5", lineage("tok_5", &["tok_0"]), 1, 0);
        cache.set_at("tok_9", lineage("tok_9", &["tok_8"]), 1, 1);

        // A new aggregation touching tok_0 lands in the log.
        let entry = LogEntry {
            sim_time: 500,
            epoch_ms: 500,
            sequence: 10,
            node_id: "q".to_string(),
            token_id: Some("tok_10".to_string()),
            action: LogAction::Created,
            value: serde_json::json!(1.0),
            source_tokens: vec![],
            details: Some(tokenflow_types::OperationDetails::Transformation {
                formula: "a + 1".to_string(),
                input_mapping: BTreeMap::from([(
                    "a".to_string(),
                    serde_json::json!("tok_0"),
                )]),
                calculation: "tok_0 + 1".to_string(),
            }),
            node_state: "process_evaluating".to_string(),
            buffer_sizes: Default::default(),
        };

        let dropped = cache.invalidate_by_history_changes(&[entry]);
        assert!(dropped >= 1);
        assert!(!cache.contains("tok_5"));
        assert!(cache.contains("tok_9"));
    }

    #[test]
    fn test_maintenance_purges_expired() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set_at("old", lineage("old", &[]), 1, 0);
        cache.set_at("new", lineage("new", &[]), 1, 50_000);
        assert_eq!(cache.maintenance_at(70_000), 1);
        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));
    }

    #[test]
    fn test_clear() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set_at("a", lineage("a", &[]), 1, 0);
        cache.set_at("b", lineage("b", &[]), 1, 0);
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert!(!cache.contains("a"));
    }
}
