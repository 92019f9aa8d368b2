/// Metadata view of one cache entry, all an eviction decision may see.
#[derive(Debug, Clone)]
pub struct EntryMeta<'a> {
    pub key: &'a str,
    pub last_access_ms: i64,
    pub access_count: u64,
    pub created_ms: i64,
    pub size_bytes: usize,
}

/// Picks the entry to evict when the cache is over capacity. Chosen once
/// at construction; the cache type itself is policy-agnostic.
pub trait EvictionPolicy: Send + Sync {
    fn victim(&self, entries: &[EntryMeta<'_>]) -> Option<String>;
}

/// Least recently accessed goes first.
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn victim(&self, entries: &[EntryMeta<'_>]) -> Option<String> {
        entries
            .iter()
            .min_by_key(|e| (e.last_access_ms, e.key))
            .map(|e| e.key.to_string())
    }
}

/// Least frequently accessed goes first; access recency breaks ties.
pub struct LfuPolicy;

impl EvictionPolicy for LfuPolicy {
    fn victim(&self, entries: &[EntryMeta<'_>]) -> Option<String> {
        entries
            .iter()
            .min_by_key(|e| (e.access_count, e.last_access_ms, e.key))
            .map(|e| e.key.to_string())
    }
}

/// Oldest creation timestamp goes first.
pub struct TtlPolicy;

impl EvictionPolicy for TtlPolicy {
    fn victim(&self, entries: &[EntryMeta<'_>]) -> Option<String> {
        entries
            .iter()
            .min_by_key(|e| (e.created_ms, e.key))
            .map(|e| e.key.to_string())
    }
}

/// Largest estimated footprint goes first.
pub struct MemoryPolicy;

impl EvictionPolicy for MemoryPolicy {
    fn victim(&self, entries: &[EntryMeta<'_>]) -> Option<String> {
        entries
            .iter()
            .max_by_key(|e| (e.size_bytes, std::cmp::Reverse(e.key)))
            .map(|e| e.key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(key: &str, last: i64, count: u64, created: i64, size: usize) -> EntryMeta<'_> {
        EntryMeta {
            key,
            last_access_ms: last,
            access_count: count,
            created_ms: created,
            size_bytes: size,
        }
    }

    #[test]
    fn test_lru_picks_stalest() {
        let entries = [meta("a", 30, 1, 0, 1), meta("b", 10, 9, 0, 1), meta("c", 20, 1, 0, 1)];
        assert_eq!(LruPolicy.victim(&entries), Some("b".to_string()));
    }

    #[test]
    fn test_lfu_picks_least_used() {
        let entries = [meta("a", 30, 5, 0, 1), meta("b", 10, 2, 0, 1), meta("c", 20, 8, 0, 1)];
        assert_eq!(LfuPolicy.victim(&entries), Some("b".to_string()));
    }

    #[test]
    fn test_ttl_picks_oldest() {
        let entries = [meta("a", 0, 0, 300, 1), meta("b", 0, 0, 100, 1), meta("c", 0, 0, 200, 1)];
        assert_eq!(TtlPolicy.victim(&entries), Some("b".to_string()));
    }

    #[test]
    fn test_memory_picks_largest() {
        let entries = [meta("a", 0, 0, 0, 10), meta("b", 0, 0, 0, 500), meta("c", 0, 0, 0, 50)];
        assert_eq!(MemoryPolicy.victim(&entries), Some("b".to_string()));
    }

    #[test]
    fn test_empty_has_no_victim() {
        assert_eq!(LruPolicy.victim(&[]), None);
    }
}
