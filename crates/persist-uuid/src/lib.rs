// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identity primitives for the object-graph persistence engine.
//!
//! Every stored record is addressed by a 36-character version-4-style UUID.
//! This crate owns three concerns only: the [`RecordId`] newtype and its
//! textual validation, collision-avoiding generation via
//! [`generate_unique`], and the [`Identified`] capability plus process-local
//! [`IdentityMap`] used to track identity for values that don't implement it.
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
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Stable 36-character identifier assigned to every stored composite node.
///
/// Thin newtype over [`uuid::Uuid`]; validated on every boundary crossing
/// per spec invariant "validated on every boundary crossing".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Generate a fresh random (v4) identifier.
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse and validate a 36-character canonical UUID string.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidUuid`] if `text` is not a
    /// canonically hyphenated UUID.
    pub fn parse(text: &str) -> Result<Self, IdentityError> {
        if text.len() != 36 {
            return Err(IdentityError::InvalidUuid(text.to_owned()));
        }
        Uuid::parse_str(text)
            .map(Self)
            .map_err(|_| IdentityError::InvalidUuid(text.to_owned()))
    }

    /// Render the canonical 36-character hyphenated form.
    #[must_use]
    pub fn as_hyphenated(&self) -> String {
        self.0.hyphenated().to_string()
    }

    /// View the underlying [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for RecordId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Uuid> for RecordId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl serde::Serialize for RecordId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_hyphenated())
    }
}

impl<'de> serde::Deserialize<'de> for RecordId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Identity errors surfaced through the boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// A supplied string is not a canonical 36-character UUID.
    #[error("invalid uuid: {0:?}")]
    InvalidUuid(String),
}

/// Capability that a value may implement to carry its own assigned
/// identifier: a `{get_uuid, set_uuid}` pair a record type opts into.
pub trait Identified {
    /// Return the currently assigned identifier, if any.
    fn get_uuid(&self) -> Option<RecordId>;

    /// Assign (or overwrite) the identifier.
    fn set_uuid(&mut self, id: RecordId);
}

/// Generate random identifiers until `exists` reports one that does not
/// already collide with a stored record.
///
/// `exists` is expected to be a cheap existence check against the record
/// store (e.g. a data-file stat); collisions are astronomically unlikely
/// for a single generation but the loop is the documented contract.
pub fn generate_unique<F>(mut exists: F) -> RecordId
where
    F: FnMut(&RecordId) -> bool,
{
    loop {
        let candidate = RecordId::new_v4();
        if !exists(&candidate) {
            return candidate;
        }
    }
}

/// Process-local, pointer-keyed map from value identity to assigned
/// [`RecordId`], used for composites that do not implement [`Identified`]
/// and have no conventional `uuid` field. Keyed by value identity, not
/// content.
///
/// The key is the value's address (see [`identity_addr`]); callers are
/// responsible for keeping the referenced value alive and at a stable
/// address for as long as entries referencing it are in use — exactly the
/// discipline the serializer's in-progress stack already requires for
/// cycle detection.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<usize, RecordId>,
}

impl IdentityMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Look up the identifier previously assigned to `addr`.
    #[must_use]
    pub fn get(&self, addr: usize) -> Option<RecordId> {
        self.entries.get(&addr).copied()
    }

    /// Return the identifier for `addr`, assigning one via `make` on first
    /// use.
    pub fn get_or_insert_with<F>(&mut self, addr: usize, make: F) -> RecordId
    where
        F: FnOnce() -> RecordId,
    {
        *self.entries.entry(addr).or_insert_with(make)
    }

    /// Record an explicit assignment, overwriting any prior entry.
    pub fn insert(&mut self, addr: usize, id: RecordId) {
        self.entries.insert(addr, id);
    }

    /// Remove the entry for `addr`, if any.
    pub fn remove(&mut self, addr: usize) -> Option<RecordId> {
        self.entries.remove(&addr)
    }

    /// Empty the map. Must be called whenever the storage handle's caches
    /// are cleared
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of tracked identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no identities are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compute a stable identity key for `value`, suitable for use with
/// [`IdentityMap`].
///
/// This is the value's address reinterpreted as an integer — two distinct
/// objects never compare equal, and the same object always yields the same
/// key for as long as it does not move.
#[must_use]
pub fn identity_addr<T>(value: &T) -> usize {
    std::ptr::from_ref::<T>(value) as usize
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ── 1. canonical parse/display round-trip ───────────────────────────

    #[test]
    fn parse_display_round_trip() {
        let id = RecordId::new_v4();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        let parsed = RecordId::parse(&text).unwrap();
        assert_eq!(id, parsed);
    }

    // ── 2. rejects wrong-length strings ─────────────────────────────────

    #[test]
    fn rejects_wrong_length() {
        let err = RecordId::parse("not-a-uuid").unwrap_err();
        assert_eq!(err, IdentityError::InvalidUuid("not-a-uuid".to_owned()));
    }

    // ── 3. rejects malformed-but-right-length strings ───────────────────

    #[test]
    fn rejects_malformed_same_length() {
        let bogus = "zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz";
        assert_eq!(bogus.len(), 36);
        assert!(RecordId::parse(bogus).is_err());
    }

    // ── 4. generate_unique avoids reported collisions ───────────────────

    #[test]
    fn generate_unique_retries_on_collision() {
        let mut calls = 0;
        let id = generate_unique(|_| {
            calls += 1;
            calls < 3
        });
        assert_eq!(calls, 3);
        assert_eq!(id.to_string().len(), 36);
    }

    // ── 5. identity map assigns once, reuses after ──────────────────────

    #[test]
    fn identity_map_assigns_once() {
        let mut map = IdentityMap::new();
        let value = 42_u32;
        let addr = identity_addr(&value);
        let first = map.get_or_insert_with(addr, RecordId::new_v4);
        let second = map.get_or_insert_with(addr, RecordId::new_v4);
        assert_eq!(first, second);
    }

    // ── 6. clear empties the map ─────────────────────────────────────────

    #[test]
    fn clear_empties_map() {
        let mut map = IdentityMap::new();
        let value = 7_u32;
        map.get_or_insert_with(identity_addr(&value), RecordId::new_v4);
        assert_eq!(map.len(), 1);
        map.clear();
        assert!(map.is_empty());
    }

    // ── 7. distinct values get distinct keys ────────────────────────────

    #[test]
    fn distinct_values_distinct_addrs() {
        let a = 1_u32;
        let b = 2_u32;
        assert_ne!(identity_addr(&a), identity_addr(&b));
    }

    // ── 8. serde round-trip through JSON string ─────────────────────────

    #[test]
    fn serde_round_trip() {
        let id = RecordId::new_v4();
        let json = serde_json::to_string(&id).unwrap();
        let back: RecordId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
