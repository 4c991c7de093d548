// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A seam for "now", so expiry and creation-timestamp logic can
//! be driven deterministically in tests (`persist-test-support`'s
//! `FixedClock`) without the production path ever calling
//! `SystemTime::now()` directly.

use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies the current time as fractional Unix seconds, matching the
/// metadata model's `timestampCreation`/`timestampExpiresAt` fields.
pub trait Clock: Send + Sync {
    /// Current time, fractional Unix seconds.
    fn now_seconds(&self) -> f64;
}

/// [`Clock`] backed by [`SystemTime::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64())
    }
}
