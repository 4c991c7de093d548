// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! [`persist_graph::RecordSink`] backed by the filesystem layout in
//! spec.md §6: data + metadata files written through the injectable
//! [`IoAdapter`], stub files rehomed whenever a record's class name
//! changes, and the `stubs/classnames.json` side-index kept current.
//!
//! Stub-bucket discovery (removing a record's stub from its *old* class
//! bucket when the class changes) walks `stubs/` with `std::fs::read_dir`
//! directly rather than through [`IoAdapter`] — that seam exists for
//! fault-injectable byte I/O, not directory listing, which
//! carries no such requirement.

use std::path::Path;
use std::time::Duration;

use persist_events::{EventBus, EventContext, EventKind};
use persist_graph::{PriorRecord, RecordSink};
use persist_io::IoAdapter;
use persist_meta::RecordMetadata;
use persist_uuid::RecordId;

use crate::clock::Clock;
use crate::layout;

/// Writes records to `root`, threading TTL/timestamp bookkeeping through
/// the one root record a single `store` call targets; recursively stored
/// children preserve whatever expiry they already had (or `None`, for a
/// brand new child).
pub struct StoreSink<'a> {
    root: &'a Path,
    shard_depth: usize,
    io: &'a dyn IoAdapter,
    clock: &'a dyn Clock,
    events: &'a EventBus,
    root_id: RecordId,
    ttl: Option<Duration>,
}

impl<'a> StoreSink<'a> {
    /// Build a sink for a single `store` call rooted at `root_id`, applying
    /// `ttl` only to that record.
    #[must_use]
    pub fn new(
        root: &'a Path,
        shard_depth: usize,
        io: &'a dyn IoAdapter,
        clock: &'a dyn Clock,
        events: &'a EventBus,
        root_id: RecordId,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            root,
            shard_depth,
            io,
            clock,
            events,
            root_id,
            ttl,
        }
    }

    fn read_metadata(&self, id: RecordId) -> Option<RecordMetadata> {
        let path = layout::metadata_path(self.root, id, self.shard_depth);
        let bytes = self.io.read(&path).ok()?;
        RecordMetadata::from_json_bytes(&bytes).ok()
    }

    fn register_classname(&self, class_name: &str) -> Result<(), String> {
        let path = layout::classnames_index_path(self.root);
        let mut names: Vec<String> = self
            .io
            .read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        if names.iter().any(|n| n == class_name) {
            return Ok(());
        }
        names.push(class_name.to_owned());
        names.sort();
        let bytes = serde_json::to_vec_pretty(&names).map_err(|e| e.to_string())?;
        self.io.create_dir_all(&layout::stubs_root(self.root)).map_err(|e| e.to_string())?;
        self.io.atomic_write(&path, &bytes, true).map_err(|e| e.to_string())
    }

    fn remove_existing_stub(&self, id: RecordId) -> Result<(), String> {
        let stubs_root = layout::stubs_root(self.root);
        let Ok(entries) = std::fs::read_dir(&stubs_root) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let bucket = entry.path();
            if !bucket.is_dir() {
                continue;
            }
            let candidate = bucket.join(format!("{id}.stub"));
            if candidate.exists() {
                self.io.remove_file(&candidate).map_err(|e| e.to_string())?;
                self.events.dispatch(EventKind::StubRemoved, || EventContext::for_record(id));
            }
        }
        Ok(())
    }
}

impl RecordSink for StoreSink<'_> {
    fn record_exists(&self, id: RecordId) -> bool {
        self.io.exists(&layout::data_path(self.root, id, self.shard_depth))
    }

    fn prior_record(&self, id: RecordId) -> Option<PriorRecord> {
        self.read_metadata(id).map(|m| PriorRecord {
            checksum: m.checksum,
            class_name: m.class_name,
        })
    }

    fn write_record(
        &mut self,
        id: RecordId,
        class_name: &str,
        reserved_reference_name: &str,
        data_bytes: &[u8],
        checksum: &str,
    ) -> Result<(), String> {
        let data_path = layout::data_path(self.root, id, self.shard_depth);
        self.io.atomic_write(&data_path, data_bytes, true).map_err(|e| e.to_string())?;

        let existing = self.read_metadata(id);
        let creation = existing.as_ref().map_or_else(|| self.clock.now_seconds(), |m| m.timestamp_creation);
        let version = existing.as_ref().map_or(1, |m| m.version + 1);
        let expiry = if id == self.root_id {
            self.ttl.map(|ttl| self.clock.now_seconds() + ttl.as_secs_f64())
        } else {
            existing.as_ref().and_then(|m| m.timestamp_expires_at)
        };

        let mut metadata = RecordMetadata::new(
            id,
            class_name.to_owned(),
            creation,
            checksum.to_owned(),
            reserved_reference_name.to_owned(),
        );
        metadata.version = version;
        metadata.timestamp_expires_at = expiry;

        let metadata_path = layout::metadata_path(self.root, id, self.shard_depth);
        let bytes = metadata.to_json_bytes().map_err(|e| e.to_string())?;
        self.io.atomic_write(&metadata_path, &bytes, true).map_err(|e| e.to_string())
    }

    fn refresh_stub(&mut self, id: RecordId, class_name: &str) -> Result<(), String> {
        self.remove_existing_stub(id)?;

        let stub_path = layout::stub_path(self.root, id, class_name);
        let Some(bucket) = stub_path.parent() else {
            return Err("stub path has no parent directory".to_owned());
        };
        self.io.create_dir_all(bucket).map_err(|e| e.to_string())?;
        self.io.atomic_write(&stub_path, &[], true).map_err(|e| e.to_string())?;
        self.events
            .dispatch(EventKind::StubCreated, || EventContext::for_record(id).with_class_name(class_name.to_owned()));

        self.register_classname(class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use persist_io::RealIo;

    fn sink<'a>(root: &'a Path, io: &'a RealIo, events: &'a EventBus, id: RecordId) -> StoreSink<'a> {
        StoreSink::new(root, 0, io, &SystemClock, events, id, None)
    }

    // ── 1. write_record creates data + metadata, readable back ──────────

    #[test]
    fn write_record_round_trips_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let io = RealIo;
        let events = EventBus::new();
        let id = RecordId::new_v4();
        let mut sink = sink(dir.path(), &io, &events, id);

        sink.write_record(id, "Widget", "__reference", b"{}", "deadbeef").expect("writes");
        assert!(sink.record_exists(id));
        let prior = sink.prior_record(id).expect("metadata written");
        assert_eq!(prior.class_name, "Widget");
        assert_eq!(prior.checksum, "deadbeef");
    }

    // ── 2. re-writing bumps the version and preserves creation time ─────

    #[test]
    fn rewrite_bumps_version_preserves_creation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let io = RealIo;
        let events = EventBus::new();
        let id = RecordId::new_v4();
        let mut sink = sink(dir.path(), &io, &events, id);

        sink.write_record(id, "Widget", "__reference", b"{\"a\":1}", "aaa").expect("writes");
        let first = sink.read_metadata(id).expect("metadata");
        sink.write_record(id, "Widget", "__reference", b"{\"a\":2}", "bbb").expect("rewrites");
        let second = sink.read_metadata(id).expect("metadata");

        assert_eq!(second.version, first.version + 1);
        assert_eq!(second.timestamp_creation, first.timestamp_creation);
    }

    // ── 3. refresh_stub relocates the stub when the class changes ───────

    #[test]
    fn refresh_stub_relocates_on_class_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let io = RealIo;
        let events = EventBus::new();
        let id = RecordId::new_v4();
        let mut sink = sink(dir.path(), &io, &events, id);

        sink.refresh_stub(id, "Widget").expect("first stub");
        assert!(io.exists(&layout::stub_path(dir.path(), id, "Widget")));

        sink.refresh_stub(id, "Gadget").expect("relocated stub");
        assert!(!io.exists(&layout::stub_path(dir.path(), id, "Widget")));
        assert!(io.exists(&layout::stub_path(dir.path(), id, "Gadget")));
    }

    // ── 4. refresh_stub records the class name in the side-index ────────

    #[test]
    fn refresh_stub_records_classname_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let io = RealIo;
        let events = EventBus::new();
        let id = RecordId::new_v4();
        let mut sink = sink(dir.path(), &io, &events, id);

        sink.refresh_stub(id, "Widget").expect("stub");
        let bytes = io.read(&layout::classnames_index_path(dir.path())).expect("index written");
        let names: Vec<String> = serde_json::from_slice(&bytes).expect("valid json");
        assert_eq!(names, vec!["Widget".to_owned()]);
    }
}
