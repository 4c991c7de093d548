// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! TTL-aware object and metadata caches keyed by record identity
//!
//! [`TtlCache`] is intentionally a plain memoization table, not an
//! eviction-policy cache (no LRU/LFU) — the engine's notion of "TTL-aware"
//! is that cache entries track *when they were inserted* so callers (the
//! record store) can invalidate an entry against a record's own expiry
//! metadata rather than against an independent cache clock, the same shape
//! as `echo-app-core::toast::ToastService`, which also tracks per-entry
//! insertion time and leaves the expiry *policy* to the caller's
//! `retain_visible` pass rather than baking one in.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use persist_uuid::RecordId;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A process-local cache of values keyed by [`RecordId`], tracking each
/// entry's insertion time.
pub struct TtlCache<V> {
    entries: HashMap<RecordId, Entry<V>>,
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TtlCache<V> {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or replace the cached value for `id`, resetting its age.
    pub fn insert(&mut self, id: RecordId, value: V) {
        self.entries.insert(
            id,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        tracing::trace!(record = %id, "cache-entry-added");
    }

    /// Borrow the cached value for `id`, if present.
    pub fn get(&self, id: RecordId) -> Option<&V> {
        let hit = self.entries.get(&id).map(|e| &e.value);
        if hit.is_some() {
            tracing::trace!(record = %id, "cache-hit");
        }
        hit
    }

    /// Remove and return the cached value for `id`, if present.
    pub fn remove(&mut self, id: RecordId) -> Option<V> {
        let removed = self.entries.remove(&id).map(|e| e.value);
        if removed.is_some() {
            tracing::trace!(record = %id, "cache-entry-removed");
        }
        removed
    }

    /// `true` iff `id` currently has a cached value.
    #[must_use]
    pub fn contains(&self, id: RecordId) -> bool {
        self.entries.contains_key(&id)
    }

    /// How long ago `id`'s entry was inserted, if present.
    #[must_use]
    pub fn age(&self, id: RecordId) -> Option<Duration> {
        self.entries.get(&id).map(|e| e.inserted_at.elapsed())
    }

    /// Empty the cache
    pub fn clear(&mut self) {
        self.entries.clear();
        tracing::debug!("cache-cleared");
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` iff the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry for which `keep` returns `false`. Used to evict
    /// entries whose backing record has since expired or been deleted.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(RecordId, &V) -> bool,
    {
        self.entries.retain(|id, entry| keep(*id, &entry.value));
    }
}
