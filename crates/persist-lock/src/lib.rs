// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-record advisory file lock manager
//!
//! Each [`RecordId`] is guarded by a state file `<uuid>.lock` under the
//! configured lock directory: a lock is represented purely by that file's
//! presence on disk. Its JSON body
//! additionally records the current mode (shared/exclusive) and the opaque
//! holder tokens currently granted, so this manager can arbitrate readers
//! vs. writers across cooperating processes without a kernel-level `flock`.
//!
//! Mutating the state file is itself protected by a tiny sidecar mutex file
//! (`<uuid>.lock.mutex`), claimed with an atomic `create_new` and held only
//! for the duration of a single read-decide-write step — this is the
//! classic "spinlock guarding shared state" technique, not a generalized
//! locking primitive.
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
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use persist_uuid::RecordId;

/// Default time a lock acquisition waits before failing
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for a lock to become available.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Requested or held lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple concurrent holders permitted.
    Shared,
    /// At most one holder permitted, exclusive of shared holders too.
    Exclusive,
}

/// Errors surfaced by lock acquisition/release.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Acquisition did not succeed before the deadline.
    #[error("lock timeout on {0}")]
    LockTimeout(RecordId),
    /// Acquisition was refused because the store is in safe-mode.
    #[error("lock refused (safe-mode) on {0}")]
    LockRefused(RecordId),
    /// Releasing a held lock failed (the lock file or mutex sidecar could
    /// not be removed/updated).
    #[error("failed to release lock on {0}: {1}")]
    LockReleaseFailed(RecordId, String),
    /// An underlying filesystem operation failed.
    #[error("lock io error on {0}: {1}")]
    Io(RecordId, String),
}

/// Gate consulted before every acquisition attempt; implemented by the
/// state handler so safe-mode can refuse locks without `persist-lock`
/// depending on `persist-state` directly
pub trait SafeModeGate {
    /// Returns `true` while the store is fail-closed.
    fn is_safe_mode(&self) -> bool;
}

/// A gate that never refuses — convenient for callers/tests that don't care
/// about safe-mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl SafeModeGate for AlwaysOpen {
    fn is_safe_mode(&self) -> bool {
        false
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct LockFileState {
    mode: StoredMode,
    holders: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
enum StoredMode {
    Shared,
    Exclusive,
}

impl From<LockMode> for StoredMode {
    fn from(mode: LockMode) -> Self {
        match mode {
            LockMode::Shared => Self::Shared,
            LockMode::Exclusive => Self::Exclusive,
        }
    }
}

/// Manages advisory locks for every record under one storage root.
pub struct LockManager {
    locks_dir: PathBuf,
    poll_interval: Duration,
    default_timeout: Duration,
    /// Tokens this manager instance currently holds, per record — used by
    /// [`LockManager::is_locked_by_other_process`] and to release-on-drop.
    held: Mutex<HashMap<RecordId, Vec<String>>>,
}

impl LockManager {
    /// Create a manager rooted at `locks_dir` (created lazily on first
    /// acquisition) using the default poll interval and timeout.
    #[must_use]
    pub fn new(locks_dir: PathBuf) -> Self {
        Self {
            locks_dir,
            poll_interval: POLL_INTERVAL,
            default_timeout: DEFAULT_TIMEOUT,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Create a manager with a non-default poll interval and timeout
    /// (useful for tests that cannot wait 10 real seconds).
    #[must_use]
    pub fn with_timing(locks_dir: PathBuf, poll_interval: Duration, default_timeout: Duration) -> Self {
        Self {
            locks_dir,
            poll_interval,
            default_timeout,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn lock_file(&self, id: RecordId) -> PathBuf {
        self.locks_dir.join(format!("{id}.lock"))
    }

    fn mutex_file(&self, id: RecordId) -> PathBuf {
        self.locks_dir.join(format!("{id}.lock.mutex"))
    }

    /// Acquire a lock in `mode` on `id`, waiting up to `timeout` (or the
    /// manager's default if `None`), refused immediately if `gate` reports
    /// safe-mode.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::LockRefused`], [`LockError::LockTimeout`], or
    /// [`LockError::Io`].
    pub fn acquire(
        &self,
        id: RecordId,
        mode: LockMode,
        timeout: Option<Duration>,
        gate: &dyn SafeModeGate,
    ) -> Result<LockGuard<'_>, LockError> {
        if gate.is_safe_mode() {
            return Err(LockError::LockRefused(id));
        }

        fs::create_dir_all(&self.locks_dir)
            .map_err(|e| LockError::Io(id, e.to_string()))?;

        let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);
        let token = uuid::Uuid::new_v4().to_string();

        loop {
            if let Some(granted) = self.try_grant(id, mode, &token)? {
                self.held
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .entry(id)
                    .or_default()
                    .push(token.clone());
                tracing::debug!(record = %id, ?mode, "lock-acquired");
                return Ok(granted);
            }
            if Instant::now() >= deadline {
                tracing::warn!(record = %id, ?mode, "lock-timeout");
                return Err(LockError::LockTimeout(id));
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Convenience for `acquire(id, Shared, None, gate)`.
    ///
    /// # Errors
    ///
    /// See [`LockManager::acquire`].
    pub fn acquire_shared(&self, id: RecordId, gate: &dyn SafeModeGate) -> Result<LockGuard<'_>, LockError> {
        self.acquire(id, LockMode::Shared, None, gate)
    }

    /// Convenience for `acquire(id, Exclusive, None, gate)`.
    ///
    /// # Errors
    ///
    /// See [`LockManager::acquire`].
    pub fn acquire_exclusive(&self, id: RecordId, gate: &dyn SafeModeGate) -> Result<LockGuard<'_>, LockError> {
        self.acquire(id, LockMode::Exclusive, None, gate)
    }

    /// Attempt one grant step under the sidecar mutex. Returns `Ok(None)`
    /// when the requested mode is not currently compatible (caller should
    /// poll again), `Ok(Some(guard))` on success.
    fn try_grant(
        &self,
        id: RecordId,
        mode: LockMode,
        token: &str,
    ) -> Result<Option<LockGuard<'_>>, LockError> {
        let _mutex = self.claim_mutex(id)?;

        let lock_path = self.lock_file(id);
        let mut state = self.read_state(&lock_path, id)?;

        let compatible = match (&state, mode) {
            (None, _) => true,
            (Some(s), LockMode::Shared) => s.mode == StoredMode::Shared,
            (Some(_), LockMode::Exclusive) => false,
        };
        if !compatible {
            return Ok(None);
        }

        let mut holders = state.take().map_or_else(Vec::new, |s| s.holders);
        holders.push(token.to_owned());
        let new_state = LockFileState {
            mode: mode.into(),
            holders,
        };
        self.write_state(&lock_path, &new_state, id)?;

        Ok(Some(LockGuard {
            manager: self,
            id,
            mode,
            token: token.to_owned(),
            released: false,
        }))
    }

    /// Briefly claim the sidecar mutex guarding reads/writes of the lock
    /// state file. Released when the returned guard drops.
    fn claim_mutex(&self, id: RecordId) -> Result<MutexGuard<'_>, LockError> {
        let path = self.mutex_file(id);
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_file) => return Ok(MutexGuard { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(LockError::Io(
                            id,
                            "timed out waiting for internal lock-state mutex".to_owned(),
                        ));
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                Err(e) => return Err(LockError::Io(id, e.to_string())),
            }
        }
    }

    fn read_state(&self, path: &Path, id: RecordId) -> Result<Option<LockFileState>, LockError> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = fs::File::open(path).map_err(|e| LockError::Io(id, e.to_string()))?;
        let mut text = String::new();
        file.read_to_string(&mut text)
            .map_err(|e| LockError::Io(id, e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| LockError::Io(id, e.to_string()))
    }

    fn write_state(&self, path: &Path, state: &LockFileState, id: RecordId) -> Result<(), LockError> {
        let text = serde_json::to_string(state).map_err(|e| LockError::Io(id, e.to_string()))?;
        fs::write(path, text).map_err(|e| LockError::Io(id, e.to_string()))
    }

    fn remove_token(&self, id: RecordId, token: &str) -> Result<(), LockError> {
        let _mutex = self.claim_mutex(id)?;
        let lock_path = self.lock_file(id);
        let Some(mut state) = self.read_state(&lock_path, id)? else {
            return Ok(());
        };
        state.holders.retain(|h| h != token);
        if state.holders.is_empty() {
            if lock_path.exists() {
                fs::remove_file(&lock_path).map_err(|e| LockError::LockReleaseFailed(id, e.to_string()))?;
            }
        } else {
            self.write_state(&lock_path, &state, id)?;
        }
        Ok(())
    }

    /// `true` when `id`'s lock file exists and this manager instance is not
    /// among the recorded holders
    #[must_use]
    pub fn is_locked_by_other_process(&self, id: RecordId) -> bool {
        let lock_path = self.lock_file(id);
        if !lock_path.exists() {
            return false;
        }
        let Ok(Some(state)) = self.read_state(&lock_path, id) else {
            return true;
        };
        let held = self
            .held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let ours = held.get(&id).map(|tokens| tokens.as_slice()).unwrap_or_default();
        !state.holders.iter().all(|h| ours.contains(h))
    }

    /// Release every lock this manager instance currently holds. Used on
    /// process/handle shutdown Failures on individual records are
    /// collected but do not stop attempts on the rest.
    pub fn release_all(&self) -> Vec<LockError> {
        let ids: Vec<(RecordId, Vec<String>)> = {
            let mut held = self
                .held
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            held.drain().collect()
        };
        let mut errors = Vec::new();
        for (id, tokens) in ids {
            for token in tokens {
                if let Err(e) = self.remove_token(id, &token) {
                    errors.push(e);
                }
            }
        }
        errors
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        for err in self.release_all() {
            tracing::warn!(error = %err, "lock-release-failed-on-drop");
        }
    }
}

struct MutexGuard {
    path: PathBuf,
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release internal lock-state mutex");
        }
    }
}

/// A held lock. Dropping releases it (best-effort); call [`LockGuard::release`]
/// to observe release failures explicitly.
pub struct LockGuard<'m> {
    manager: &'m LockManager,
    id: RecordId,
    mode: LockMode,
    token: String,
    released: bool,
}

impl LockGuard<'_> {
    /// The record this guard locks.
    #[must_use]
    pub const fn record_id(&self) -> RecordId {
        self.id
    }

    /// The mode this guard holds.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// Explicitly release the lock, observing failure (the finally-style
    /// guarantee expected around `store`/`delete`).
    ///
    /// # Errors
    ///
    /// Returns [`LockError::LockReleaseFailed`] if the lock file or its
    /// sidecar mutex could not be updated/removed.
    pub fn release(mut self) -> Result<(), LockError> {
        self.do_release()
    }

    fn do_release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        {
            let mut held = self
                .manager
                .held
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(tokens) = held.get_mut(&self.id) {
                tokens.retain(|t| t != &self.token);
            }
        }
        self.manager.remove_token(self.id, &self.token)?;
        tracing::debug!(record = %self.id, mode = ?self.mode, "lock-released");
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.do_release() {
            tracing::warn!(error = %e, "lock-release-failed-on-drop");
        }
    }
}
