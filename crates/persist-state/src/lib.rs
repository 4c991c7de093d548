// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Safe-mode state handler
//!
//! A single boolean flag, persisted as the presence of a marker file
//! (`<root>/safemode`) rather than as in-memory state, so that a
//! process restart does not silently clear a fail-closed condition. Every
//! write path consults [`StateHandler::safe_mode_enabled`] before mutating
//! anything; this crate also implements [`persist_lock::SafeModeGate`] so
//! the lock manager can refuse acquisitions directly.
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

use std::fs;
use std::path::PathBuf;

use persist_lock::SafeModeGate;

/// Name of the marker file under the storage root
pub const MARKER_FILE_NAME: &str = "safemode";

/// Errors surfaced by safe-mode transitions.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The marker file could not be created or removed.
    #[error("io error managing safe-mode marker: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons safe-mode was entered, for diagnostics and event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeModeReason {
    /// Operator/administrator explicitly enabled it.
    Manual,
    /// A stored record's checksum did not match its metadata.
    ChecksumMismatch,
    /// A data file's bytes could not be decoded as valid JSON.
    InvalidFormat,
    /// A data file exists with no corresponding metadata file.
    MissingMetadata,
}

/// Persisted fail-closed flag for one storage root.
pub struct StateHandler {
    root: PathBuf,
}

impl StateHandler {
    /// Bind a handler to `root` (the storage root directory). Does not
    /// create `root` itself.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILE_NAME)
    }

    /// `true` while the marker file is present.
    #[must_use]
    pub fn safe_mode_enabled(&self) -> bool {
        self.marker_path().exists()
    }

    /// Create the marker file, entering safe-mode. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the marker file or its parent
    /// directory cannot be created.
    pub fn enable_safe_mode(&self, reason: SafeModeReason) -> Result<(), StateError> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.marker_path(), format!("{reason:?}"))?;
        tracing::warn!(?reason, "safe-mode-on");
        Ok(())
    }

    /// Remove the marker file, leaving safe-mode. Idempotent — absent
    /// marker is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the marker file exists but cannot be
    /// removed.
    pub fn disable_safe_mode(&self) -> Result<(), StateError> {
        let path = self.marker_path();
        if path.exists() {
            fs::remove_file(path)?;
            tracing::info!("safe-mode-off");
        }
        Ok(())
    }
}

impl SafeModeGate for StateHandler {
    fn is_safe_mode(&self) -> bool {
        self.safe_mode_enabled()
    }
}
