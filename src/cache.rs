//! In-process result cache for repeated commands
//!
//! Uses moka async cache (Send + Sync, TTL-based eviction, bounded size).
//! Entries are keyed by a scope (usually a session id) and a fingerprint of
//! the normalized command, so whitespace-only differences hit the same entry.

use moka::future::Cache;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::core::RunOutput;

/// Cache key: scope plus command fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: String,
    pub fingerprint: u64,
}

impl CacheKey {
    pub fn new(scope: impl Into<String>, language: &str, command: &str) -> Self {
        CacheKey {
            scope: scope.into(),
            fingerprint: fingerprint(language, command),
        }
    }
}

/// Collapse whitespace runs and trim, so formatting noise does not miss
pub fn normalize_command(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hash of language + normalized command
pub fn fingerprint(language: &str, command: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    language.to_lowercase().hash(&mut hasher);
    normalize_command(command).hash(&mut hasher);
    hasher.finish()
}

/// Memoized command outputs
#[derive(Clone)]
pub struct ResultCache {
    entries: Cache<CacheKey, RunOutput>,
}

impl ResultCache {
    /// Create a cache holding at most `max_entries` outputs for `ttl`
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        ResultCache {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl)
    }

    /// Get a cached output
    pub async fn get(&self, key: &CacheKey) -> Option<RunOutput> {
        let hit = self.entries.get(key).await;
        if hit.is_some() {
            debug!("Cache hit in scope {}", key.scope);
        }
        hit
    }

    /// Store an output. Only clean exits are memoized.
    pub async fn put(&self, key: CacheKey, output: RunOutput) -> bool {
        if !output.success() {
            return false;
        }
        self.entries.insert(key, output).await;
        true
    }

    /// Drop every entry belonging to a scope (e.g. a closed session)
    pub fn invalidate_scope(&self, scope: &str) {
        let scope = scope.to_string();
        if let Err(e) = self
            .entries
            .invalidate_entries_if(move |key, _| key.scope == scope)
        {
            warn!("Scoped invalidation unavailable, clearing cache: {}", e);
            self.entries.invalidate_all();
        }
    }

    /// Approximate number of live entries
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Apply pending evictions and invalidations now
    pub async fn sync(&self) {
        self.entries.run_pending_tasks().await;
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
