// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
use std::path::PathBuf;
use std::time::Duration;

use persist_graph::ChildWritePolicy;
use persist_meta::DEFAULT_REFERENCE_NAME;

/// Tuning knobs threaded through [`crate::Storage::open`] (spec.md §1's
/// "configuration file parsing" is explicitly out of scope — this is built
/// programmatically, never read from an on-disk format).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Storage root directory. Created on first use if absent.
    pub root: PathBuf,
    /// Default lock-acquisition timeout, applied when a call site does not
    /// override it
    pub lock_timeout: Duration,
    /// Lock-acquisition poll interval
    pub poll_interval: Duration,
    /// Maximum graph recursion depth
    pub max_nesting: usize,
    /// Default time-to-live applied to a `store` call that does not specify
    /// one explicitly. `None` means "never expires"
    pub default_ttl: Option<Duration>,
    /// Default reserved-marker field name; a node declaring a
    /// field by this exact name still gets a uniquely suffixed marker.
    pub reserved_reference_name: String,
    /// How deeply to recurse into embedded composites on `store` (spec
    /// §4.6a "Child-write policy").
    pub child_write_policy: ChildWritePolicy,
    /// Nested-prefix sharding depth for `.obj`/`.metadata` files `0`
    /// disables sharding; every increment adds one more two-hex-character
    /// directory level.
    pub shard_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            lock_timeout: persist_lock::DEFAULT_TIMEOUT,
            poll_interval: persist_lock::POLL_INTERVAL,
            max_nesting: 64,
            default_ttl: None,
            reserved_reference_name: DEFAULT_REFERENCE_NAME.to_owned(),
            child_write_policy: ChildWritePolicy::Always,
            shard_depth: 0,
        }
    }
}

impl StoreConfig {
    /// Build the default configuration rooted at `root`.
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}
