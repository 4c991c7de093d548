// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Record metadata model and checksums
//!
//! # Checksum algorithm policy
//!
//! The source project's checksum field sometimes recorded MD5 and sometimes
//! a CRC32 variant, with the algorithm itself absent from older metadata.
//! This port picks CRC32 (`crc32fast`) as both the algorithm it writes and
//! the fallback applied when `checksum_algorithm` is missing on read — a
//! single, consistently-applied content hash, the same way `echo-cas`/
//! `echo-graph` standardize on BLAKE3 for content-addressed hashing rather
//! than supporting multiple hash families. See `DESIGN.md` for the recorded
//! decision.
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

use persist_uuid::RecordId;
use serde::{Deserialize, Serialize};

/// Checksum algorithms this port understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ChecksumAlgorithm {
    /// 32-bit CRC (`crc32fast`), the only algorithm this port writes.
    Crc32,
    /// Recognized but unverifiable — legacy metadata declared an algorithm
    /// this port does not implement. Verification against such metadata
    /// always fails closed (treated as a mismatch).
    #[serde(other)]
    Unsupported,
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        Self::Crc32
    }
}

/// Compute the default checksum of `bytes` as a lowercase hex string.
#[must_use]
pub fn compute_checksum(bytes: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(bytes))
}

/// The metadata record stored alongside every data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// The record's identifier, duplicated here for self-describing files.
    pub uuid: RecordId,
    /// Name of the persisted class/type.
    #[serde(rename = "className")]
    pub class_name: String,
    /// Creation time, fractional Unix seconds.
    #[serde(rename = "timestampCreation")]
    pub timestamp_creation: f64,
    /// Schema/format version of the data file.
    pub version: u32,
    /// Hex digest of the data file's exact bytes.
    pub checksum: String,
    /// Algorithm used to compute `checksum`. Absent on legacy metadata.
    #[serde(rename = "checksumAlgorithm", default, skip_serializing_if = "Option::is_none")]
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    /// Absolute expiry time, fractional Unix seconds; `None` = never.
    #[serde(rename = "timestampExpiresAt")]
    pub timestamp_expires_at: Option<f64>,
    /// The field name used inside the data file to mark references
    ///
    #[serde(rename = "reservedReferenceName")]
    pub reserved_reference_name: String,
}

/// Default reserved reference-marker field name
pub const DEFAULT_REFERENCE_NAME: &str = "__reference";

impl RecordMetadata {
    /// Build metadata for a freshly computed data file.
    #[must_use]
    pub fn new(
        uuid: RecordId,
        class_name: String,
        timestamp_creation: f64,
        checksum: String,
        reserved_reference_name: String,
    ) -> Self {
        Self {
            uuid,
            class_name,
            timestamp_creation,
            version: 1,
            checksum,
            checksum_algorithm: Some(ChecksumAlgorithm::Crc32),
            timestamp_expires_at: None,
            reserved_reference_name,
        }
    }

    /// The algorithm to use when verifying `checksum`, falling back to
    /// [`ChecksumAlgorithm::Crc32`] when the metadata predates the field.
    #[must_use]
    pub fn effective_algorithm(&self) -> ChecksumAlgorithm {
        self.checksum_algorithm.unwrap_or_default()
    }

    /// `true` iff `bytes` hashes to `self.checksum` under the effective
    /// algorithm. Always `false` for [`ChecksumAlgorithm::Unsupported`].
    #[must_use]
    pub fn verify(&self, bytes: &[u8]) -> bool {
        match self.effective_algorithm() {
            ChecksumAlgorithm::Crc32 => compute_checksum(bytes) == self.checksum,
            ChecksumAlgorithm::Unsupported => false,
        }
    }

    /// Remaining lifetime in seconds at time `now`; `None` means "never
    /// expires".
    #[must_use]
    pub fn remaining_lifetime(&self, now: f64) -> Option<f64> {
        self.timestamp_expires_at.map(|expiry| expiry - now)
    }

    /// `true` iff an expiry is set and has passed at time `now`
    #[must_use]
    pub fn is_expired(&self, now: f64) -> bool {
        self.remaining_lifetime(now).is_some_and(|lifetime| lifetime <= 0.0)
    }

    /// Set an absolute expiry `ttl_seconds` from `now`, or clear it when
    /// `ttl_seconds` is `None`.
    pub fn set_ttl(&mut self, now: f64, ttl_seconds: Option<f64>) {
        self.timestamp_expires_at = ttl_seconds.map(|ttl| now + ttl);
    }

    /// Serialize to the canonical metadata JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if serialization fails (should not
    /// happen for well-formed `RecordMetadata` values).
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Parse metadata JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::InvalidFormat`] if `bytes` is not valid
    /// metadata JSON.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, MetadataError> {
        serde_json::from_slice(bytes).map_err(|e| MetadataError::InvalidFormat(e.to_string()))
    }
}

/// Errors surfaced while decoding metadata.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The metadata bytes were not valid/understandable JSON for this
    /// schema.
    #[error("invalid metadata format: {0}")]
    InvalidFormat(String),
}
