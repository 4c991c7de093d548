// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Listing and stub maintenance
//!
//! Directory enumeration here walks the filesystem directly with
//! `std::fs::read_dir` rather than through [`IoAdapter`], for the same
//! reason `sink::StoreSink`'s stub relocation does: that seam exists for
//! fault-injectable byte I/O, not directory traversal, which
//! carries no such requirement.

use std::path::{Path, PathBuf};

use persist_events::{EventBus, EventContext, EventKind};
use persist_io::IoAdapter;
use persist_meta::RecordMetadata;
use persist_uuid::RecordId;

use crate::layout;
use crate::PersistError;

fn walk_data_tree(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let stubs_root = layout::stubs_root(root);
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if path == stubs_root {
                continue;
            }
            walk_data_tree(root, &path, out);
        } else {
            out.push(path);
        }
    }
}

fn stem_as_id(path: &Path, suffix: &str) -> Option<RecordId> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(suffix)?;
    RecordId::parse(stem).ok()
}

/// Every record id currently present under `root`, discovered by scanning
/// `.obj` files at whatever sharding depth they actually live at
fn list_all(root: &Path) -> Vec<RecordId> {
    let mut files = Vec::new();
    walk_data_tree(root, root, &mut files);
    let mut ids: Vec<RecordId> = files.iter().filter_map(|p| stem_as_id(p, ".obj")).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Every record id whose stub lives in `class_name`'s hash bucket
fn list_by_class(root: &Path, class_name: &str) -> Vec<RecordId> {
    let bucket = layout::stubs_root(root).join(layout::class_hash(class_name));
    let Ok(entries) = std::fs::read_dir(&bucket) else {
        return Vec::new();
    };
    let mut ids: Vec<RecordId> = entries
        .flatten()
        .filter_map(|entry| stem_as_id(&entry.path(), ".stub"))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// List every record id, optionally restricted to `class`.
///
/// # Errors
///
/// Never fails today — a missing or unreadable directory is treated as
/// "nothing listed" rather than an error, matching an empty store. The
/// `Result` is kept so a future adapter-routed implementation can surface
/// [`PersistError::Io`] without changing this function's signature.
pub fn list(root: &Path, class: Option<&str>) -> Result<Vec<RecordId>, PersistError> {
    Ok(match class {
        Some(name) => list_by_class(root, name),
        None => list_all(root),
    })
}

/// Recreate the stub tree from each record's own metadata`, spec.md §6 `maintenance:rebuild-stubs`, "invoked under
/// safe-mode").
///
/// # Errors
///
/// [`PersistError::Io`] if the stub tree cannot be cleared or rewritten.
pub fn rebuild_stubs(io: &dyn IoAdapter, root: &Path, shard_depth: usize, events: &EventBus) -> Result<(), PersistError> {
    let stubs_root = layout::stubs_root(root);
    if stubs_root.exists() {
        std::fs::remove_dir_all(&stubs_root).map_err(|source| persist_io::IoError::Io {
            path: stubs_root.clone(),
            source,
        })?;
    }
    io.create_dir_all(&stubs_root)?;

    let mut classnames: Vec<String> = Vec::new();
    for id in list_all(root) {
        let metadata_path = layout::metadata_path(root, id, shard_depth);
        let Ok(bytes) = io.read(&metadata_path) else {
            continue;
        };
        let Ok(metadata) = RecordMetadata::from_json_bytes(&bytes) else {
            continue;
        };
        write_stub(io, root, id, &metadata, events)?;
        if !classnames.iter().any(|n| n == &metadata.class_name) {
            classnames.push(metadata.class_name);
        }
    }
    classnames.sort_unstable();

    let index_path = layout::classnames_index_path(root);
    let bytes = serde_json::to_vec_pretty(&classnames)?;
    io.atomic_write(&index_path, &bytes, true)?;
    Ok(())
}

fn write_stub(io: &dyn IoAdapter, root: &Path, id: RecordId, metadata: &RecordMetadata, events: &EventBus) -> Result<(), PersistError> {
    let stub_path = layout::stub_path(root, id, &metadata.class_name);
    if let Some(bucket) = stub_path.parent() {
        io.create_dir_all(bucket)?;
    }
    io.atomic_write(&stub_path, &[], true)?;
    events.dispatch(EventKind::StubCreated, || EventContext::for_record(id).with_class_name(metadata.class_name.clone()));
    Ok(())
}

/// Relocate every `.obj`/`.metadata` pair onto the layout implied by `root`'s
/// *current* `shard_depth` (spec.md §6 `maintenance:rebuild-shards`, for a
/// depth changed after records already exist). Files already at the correct
/// location are left untouched; lock files and the safe-mode marker are
/// never sharded and are not touched here
///
/// # Errors
///
/// [`PersistError::Io`] if a file cannot be read, written, or removed.
pub fn rebuild_shards(io: &dyn IoAdapter, root: &Path, shard_depth: usize) -> Result<(), PersistError> {
    let mut files = Vec::new();
    walk_data_tree(root, root, &mut files);

    for path in files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let target = if let Some(stem) = name.strip_suffix(".obj") {
            let Ok(id) = RecordId::parse(stem) else { continue };
            layout::data_path(root, id, shard_depth)
        } else if let Some(stem) = name.strip_suffix(".metadata") {
            let Ok(id) = RecordId::parse(stem) else { continue };
            layout::metadata_path(root, id, shard_depth)
        } else {
            continue;
        };

        if target == path {
            continue;
        }
        let bytes = io.read(&path)?;
        if let Some(parent) = target.parent() {
            io.create_dir_all(parent)?;
        }
        io.atomic_write(&target, &bytes, true)?;
        io.remove_file(&path)?;
    }
    Ok(())
}
