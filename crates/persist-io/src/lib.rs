// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Atomic file I/O adapter for the object-graph persistence engine.
//!
//! All filesystem access in the engine is routed through the [`IoAdapter`]
//! trait so higher layers never call `std::fs` directly — tests substitute
//! [a fault-injecting double](https://docs.rs/persist-test-support) to
//! exercise the cleanup paths without real disk failures.
//!
//! # Atomic-write semantics
//!
//! [`RealIo::atomic_write`] follows the prescribed sequence precisely: open for
//! read+write+create (no implicit truncate), rewind to the start, write the
//! new bytes, flush, record the resulting position, truncate the file to
//! that position (dropping any longer tail from a previous write), then
//! close. Safety of this scheme against concurrent readers is provided by
//! the lock manager, not by this module — this is a safe in-place rewrite,
//! not a temp-file-plus-rename swap.
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

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Errors surfaced by [`IoAdapter`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// The requested path does not exist.
    #[error("not found: {0}")]
    NotFound(PathBuf),
    /// An underlying I/O operation failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path the operation was attempted against.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The write itself failed *and* cleanup (closing/unlinking the
    /// partially written file) also failed.
    #[error("write to {path} failed ({write_error}); cleanup also failed: {cleanup_error}")]
    CleanupFailed {
        /// Path that was being written.
        path: PathBuf,
        /// The original write failure, rendered for display.
        write_error: String,
        /// The cleanup failure, rendered for display.
        cleanup_error: String,
    },
}

/// Filesystem access port. All engine components read/write/delete files
/// exclusively through this trait
pub trait IoAdapter: Send + Sync {
    /// Atomically (with respect to the in-place rewrite discipline above)
    /// overwrite `path` with `bytes`. When `create_parent` is set, the
    /// parent directory tree is created first.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Io`] or [`IoError::CleanupFailed`] on failure.
    fn atomic_write(&self, path: &Path, bytes: &[u8], create_parent: bool) -> Result<(), IoError>;

    /// Read the full contents of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::NotFound`] if the file does not exist, or
    /// [`IoError::Io`] for any other failure.
    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError>;

    /// Delete `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::NotFound`] if the file does not exist, or
    /// [`IoError::Io`] for any other failure.
    fn remove_file(&self, path: &Path) -> Result<(), IoError>;

    /// Create `path` and every missing ancestor directory.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Io`] on failure.
    fn create_dir_all(&self, path: &Path) -> Result<(), IoError>;

    /// Cheap existence test. Never errors; a path that cannot be statted is
    /// reported as absent.
    fn exists(&self, path: &Path) -> bool;
}

/// Direct-to-disk [`IoAdapter`] implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealIo;

impl RealIo {
    /// Construct the adapter. Carries no state — every method operates
    /// directly on the path it is given.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn write_inner(file: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(bytes)?;
        file.flush()?;
        let position = file.stream_position()?;
        file.set_len(position)?;
        Ok(())
    }
}

impl IoAdapter for RealIo {
    fn atomic_write(&self, path: &Path, bytes: &[u8], create_parent: bool) -> Result<(), IoError> {
        if create_parent {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| IoError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let existed_before = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| IoError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        if let Err(write_err) = Self::write_inner(&mut file, bytes) {
            drop(file);
            if !existed_before {
                if let Err(cleanup_err) = fs::remove_file(path) {
                    return Err(IoError::CleanupFailed {
                        path: path.to_path_buf(),
                        write_error: write_err.to_string(),
                        cleanup_error: cleanup_err.to_string(),
                    });
                }
            }
            return Err(IoError::Io {
                path: path.to_path_buf(),
                source: write_err,
            });
        }
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError> {
        if !path.exists() {
            return Err(IoError::NotFound(path.to_path_buf()));
        }
        let mut file = fs::File::open(path).map_err(|source| IoError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|source| IoError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(buf)
    }

    fn remove_file(&self, path: &Path) -> Result<(), IoError> {
        if !path.exists() {
            return Err(IoError::NotFound(path.to_path_buf()));
        }
        fs::remove_file(path).map_err(|source| IoError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), IoError> {
        fs::create_dir_all(path).map_err(|source| IoError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
