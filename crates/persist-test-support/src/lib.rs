// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fault-injecting and call-counting test doubles for the object-graph
//! persistence engine, in the spirit of `echo-dry-tests`'
//! `InMemoryConfigStore`: fakes that track how often they were called and
//! can be told to fail on demand, so higher-level tests can drive the
//! engine's failure paths without real disk faults or a sleeping
//! test thread.
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

mod graph;

pub use graph::GraphNode;

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use persist_events::{EventContext, EventKind, Listener};
use persist_io::{IoAdapter, IoError, RealIo};
use persist_store::Clock;
use persist_uuid::RecordId;

/// [`IoAdapter`] wrapping [`RealIo`] that can be told to fail the next (or
/// every) `atomic_write`/`read`/`remove_file` call against a chosen path,
/// so tests can exercise cleanup-on-failure discipline and
/// safe-mode-on-corruption paths without real disk faults.
///
/// Mirrors `echo-dry-tests::InMemoryConfigStore`'s `set_fail_on_load`/
/// `set_fail_on_save` switches, generalized from two named operations to an
/// arbitrary set of paths and a call counter per operation kind. Backed by
/// `Arc<Mutex<_>>` rather than `Rc<RefCell<_>>` because [`IoAdapter`]
/// requires `Send + Sync`.
#[derive(Clone, Default)]
pub struct FaultyIo {
    inner: Arc<Mutex<FaultyIoState>>,
}

#[derive(Default)]
struct FaultyIoState {
    real: RealIo,
    fail_writes: HashSet<PathBuf>,
    fail_reads: HashSet<PathBuf>,
    fail_removes: HashSet<PathBuf>,
    write_attempts: usize,
    read_attempts: usize,
    remove_attempts: usize,
}

impl FaultyIo {
    /// Build a double that otherwise behaves exactly like [`RealIo`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FaultyIoState> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The next (and every subsequent) `atomic_write` to `path` fails.
    pub fn fail_write(&self, path: impl Into<PathBuf>) {
        self.state().fail_writes.insert(path.into());
    }

    /// The next (and every subsequent) `read` of `path` fails.
    pub fn fail_read(&self, path: impl Into<PathBuf>) {
        self.state().fail_reads.insert(path.into());
    }

    /// The next (and every subsequent) `remove_file` of `path` fails.
    pub fn fail_remove(&self, path: impl Into<PathBuf>) {
        self.state().fail_removes.insert(path.into());
    }

    /// Stop injecting failures for every path previously configured.
    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.fail_writes.clear();
        state.fail_reads.clear();
        state.fail_removes.clear();
    }

    /// Number of `atomic_write` calls attempted so far, successful or not.
    #[must_use]
    pub fn write_attempts(&self) -> usize {
        self.state().write_attempts
    }

    /// Number of `read` calls attempted so far, successful or not.
    #[must_use]
    pub fn read_attempts(&self) -> usize {
        self.state().read_attempts
    }

    /// Number of `remove_file` calls attempted so far, successful or not.
    #[must_use]
    pub fn remove_attempts(&self) -> usize {
        self.state().remove_attempts
    }
}

fn simulated_failure(path: &Path) -> IoError {
    IoError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::other("simulated failure"),
    }
}

impl IoAdapter for FaultyIo {
    fn atomic_write(&self, path: &Path, bytes: &[u8], create_parent: bool) -> Result<(), IoError> {
        let mut state = self.state();
        state.write_attempts += 1;
        if state.fail_writes.contains(path) {
            return Err(simulated_failure(path));
        }
        state.real.atomic_write(path, bytes, create_parent)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError> {
        let mut state = self.state();
        state.read_attempts += 1;
        if state.fail_reads.contains(path) {
            return Err(simulated_failure(path));
        }
        state.real.read(path)
    }

    fn remove_file(&self, path: &Path) -> Result<(), IoError> {
        let mut state = self.state();
        state.remove_attempts += 1;
        if state.fail_removes.contains(path) {
            return Err(simulated_failure(path));
        }
        state.real.remove_file(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), IoError> {
        self.state().real.create_dir_all(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.state().real.exists(path)
    }
}

/// [`Clock`] that reports a value under test control rather than wall-clock
/// time, so expiry tests never need to sleep for real
/// seconds. Backed by an atomic rather than `Rc<RefCell<_>>` because
/// [`Clock`] requires `Send + Sync`.
#[derive(Clone)]
pub struct FixedClock {
    now_millis: Arc<std::sync::atomic::AtomicI64>,
}

impl FixedClock {
    /// A clock that reports `now_seconds` until told otherwise.
    #[must_use]
    pub fn at(now_seconds: f64) -> Self {
        Self {
            now_millis: Arc::new(std::sync::atomic::AtomicI64::new(seconds_to_millis(now_seconds))),
        }
    }

    /// Move the clock forward (or backward) by `delta_seconds`.
    pub fn advance(&self, delta_seconds: f64) {
        let delta_millis = seconds_to_millis(delta_seconds);
        self.now_millis.fetch_add(delta_millis, std::sync::atomic::Ordering::SeqCst);
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, now_seconds: f64) {
        self.now_millis.store(seconds_to_millis(now_seconds), std::sync::atomic::Ordering::SeqCst);
    }
}

#[allow(clippy::cast_possible_truncation)]
fn seconds_to_millis(seconds: f64) -> i64 {
    (seconds * 1000.0) as i64
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::at(0.0)
    }
}

#[allow(clippy::cast_precision_loss)]
impl Clock for FixedClock {
    fn now_seconds(&self) -> f64 {
        let millis = self.now_millis.load(std::sync::atomic::Ordering::SeqCst);
        millis as f64 / 1000.0
    }
}

/// [`Listener`] that records every event it observes, for assertions on
/// dispatch order and content without wiring up a real
/// logging sink.
#[derive(Default)]
pub struct RecordingListener {
    seen: RefCell<Vec<(EventKind, Option<EventContext>)>>,
}

impl RecordingListener {
    /// Create a listener with no recorded events.
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Every `(kind, context)` pair observed so far, in dispatch order.
    #[must_use]
    pub fn events(&self) -> Vec<(EventKind, Option<EventContext>)> {
        self.seen.borrow().clone()
    }

    /// How many times `kind` was dispatched.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.seen.borrow().iter().filter(|(seen_kind, _)| *seen_kind == kind).count()
    }

    /// Whether any recorded event concerns `id`.
    #[must_use]
    pub fn saw_record(&self, id: RecordId) -> bool {
        self.seen.borrow().iter().any(|(_, ctx)| ctx.as_ref().and_then(|c| c.record) == Some(id))
    }

    /// Forget every recorded event.
    pub fn reset(&self) {
        self.seen.borrow_mut().clear();
    }
}

impl Listener for RecordingListener {
    fn handle(&self, kind: EventKind, context: Option<&EventContext>) {
        self.seen.borrow_mut().push((kind, context.cloned()));
    }
}

/// [`Listener`] that always panics, for exercising the event bus's
/// "an exception in one listener is caught, logged, and does not abort
/// dispatch" isolation guarantee.
#[derive(Debug, Default)]
pub struct PanickingListener;

impl Listener for PanickingListener {
    fn handle(&self, _kind: EventKind, _context: Option<&EventContext>) {
        panic!("PanickingListener always panics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── 1. FaultyIo behaves exactly like RealIo when no fault is armed ───

    #[test]
    fn faulty_io_passes_through_without_faults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.obj");
        let io = FaultyIo::new();
        io.atomic_write(&path, b"hello", false).expect("writes");
        assert_eq!(io.read(&path).expect("reads"), b"hello");
    }

    // ── 2. fail_write makes every subsequent write to that path fail ────

    #[test]
    fn fail_write_blocks_subsequent_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.obj");
        let io = FaultyIo::new();
        io.fail_write(&path);
        assert!(io.atomic_write(&path, b"x", false).is_err());
        assert!(io.atomic_write(&path, b"y", false).is_err());
        assert_eq!(io.write_attempts(), 2);
    }

    // ── 3. clear_faults restores normal behavior ─────────────────────────

    #[test]
    fn clear_faults_restores_normal_behavior() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.obj");
        let io = FaultyIo::new();
        io.fail_write(&path);
        assert!(io.atomic_write(&path, b"x", false).is_err());
        io.clear_faults();
        io.atomic_write(&path, b"x", false).expect("writes after clearing");
    }

    // ── 4. FixedClock reports and advances deterministically ────────────

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::at(1000.0);
        assert_eq!(clock.now_seconds(), 1000.0);
        clock.advance(5.0);
        assert_eq!(clock.now_seconds(), 1005.0);
        clock.set(0.0);
        assert_eq!(clock.now_seconds(), 0.0);
    }

    // ── 5. RecordingListener records kind and context in order ──────────

    #[test]
    fn recording_listener_records_in_order() {
        let listener = RecordingListener::new();
        let id = RecordId::new_v4();
        listener.handle(EventKind::StoreBefore, Some(&EventContext::for_record(id)));
        listener.handle(EventKind::StoreAfter, Some(&EventContext::for_record(id)));

        let events = listener.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, EventKind::StoreBefore);
        assert_eq!(events[1].0, EventKind::StoreAfter);
        assert_eq!(listener.count(EventKind::StoreAfter), 1);
        assert!(listener.saw_record(id));
    }

    // ── 6. reset forgets every recorded event ────────────────────────────

    #[test]
    fn reset_forgets_events() {
        let listener = RecordingListener::new();
        listener.handle(EventKind::CacheHit, None);
        listener.reset();
        assert!(listener.events().is_empty());
    }
}
