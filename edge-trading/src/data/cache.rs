//! In-memory TTL caches for market data.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Cache entry with TTL
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    data: T,
    expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    fn new(data: T, ttl_secs: i64) -> Self {
        Self {
            data,
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
}

/// String-keyed cache with one TTL for every entry.
#[derive(Debug)]
pub struct TtlCache<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    ttl_secs: i64,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl_secs,
        }
    }

    /// Value for `key` if present and fresh.
    pub fn get(&self, key: &str) -> Option<T> {
        let cache = self.entries.read().ok()?;
        cache
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.data.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: T) {
        if let Ok(mut cache) = self.entries.write() {
            cache.insert(key.into(), CacheEntry::new(value, self.ttl_secs));
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut cache) = self.entries.write() {
            cache.remove(key);
        }
    }

    /// Drop expired entries, returning how many were removed.
    pub fn clear_expired(&self) -> usize {
        let Ok(mut cache) = self.entries.write() else {
            return 0;
        };
        let before = cache.len();
        cache.retain(|_, entry| !entry.is_expired());
        before - cache.len()
    }

    pub fn clear_all(&self) {
        if let Ok(mut cache) = self.entries.write() {
            cache.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let Ok(cache) = self.entries.read() else {
            return CacheStats {
                total_entries: 0,
                expired_entries: 0,
                active_entries: 0,
            };
        };
        let expired = cache.values().filter(|e| e.is_expired()).count();
        CacheStats {
            total_entries: cache.len(),
            expired_entries: expired,
            active_entries: cache.len() - expired,
        }
    }
}

/// Remembers which symbols the provider could (or could not) price.
///
/// Owned by a market data provider; entries expire so that delisted or
/// newly listed tickers are re-checked.
#[derive(Debug)]
pub struct SymbolValidationCache {
    verdicts: TtlCache<bool>,
}

impl SymbolValidationCache {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            verdicts: TtlCache::new(ttl_secs),
        }
    }

    /// `Some(true)` known good, `Some(false)` known bad, `None` unknown.
    pub fn status(&self, symbol: &str) -> Option<bool> {
        self.verdicts.get(symbol)
    }

    pub fn is_known_bad(&self, symbol: &str) -> bool {
        self.status(symbol) == Some(false)
    }

    pub fn mark_good(&self, symbol: &str) {
        self.verdicts.set(symbol, true);
    }

    pub fn mark_bad(&self, symbol: &str) {
        self.verdicts.set(symbol, false);
    }

    pub fn clear_expired(&self) -> usize {
        self.verdicts.clear_expired()
    }

    pub fn stats(&self) -> CacheStats {
        self.verdicts.stats()
    }
}

impl Default for SymbolValidationCache {
    fn default() -> Self {
        Self::new(86_400)
    }
}
