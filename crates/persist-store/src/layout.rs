// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Path conventions for the on-disk layout in spec.md §6:
//!
//! ```text
//! <root>/<uuid>.obj
//! <root>/<uuid>.metadata
//! <root>/<uuid>.lock
//! <root>/stubs/classnames.json
//! <root>/stubs/<md5(class)>/<uuid>.stub
//! <root>/safemode
//! ```

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use persist_uuid::RecordId;

/// Lowercase hex MD5 digest of `class_name`, used as the stub bucket name.
#[must_use]
pub fn class_hash(class_name: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(class_name.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The two-hex-character directory segments a sharded path descends
/// through, derived from the record id's unhyphenated hex form.
fn shard_segments(id: RecordId, depth: usize) -> Vec<String> {
    let simple = id.as_uuid().simple().to_string();
    let depth = depth.min(simple.len() / 2);
    (0..depth).map(|i| simple[i * 2..i * 2 + 2].to_owned()).collect()
}

fn sharded_dir(root: &Path, id: RecordId, shard_depth: usize) -> PathBuf {
    let mut dir = root.to_path_buf();
    for segment in shard_segments(id, shard_depth) {
        dir.push(segment);
    }
    dir
}

/// Path to a record's data file.
#[must_use]
pub fn data_path(root: &Path, id: RecordId, shard_depth: usize) -> PathBuf {
    let mut path = sharded_dir(root, id, shard_depth);
    path.push(format!("{id}.obj"));
    path
}

/// Path to a record's metadata file.
#[must_use]
pub fn metadata_path(root: &Path, id: RecordId, shard_depth: usize) -> PathBuf {
    let mut path = sharded_dir(root, id, shard_depth);
    path.push(format!("{id}.metadata"));
    path
}

/// Directory sharding is never applied to lock files: advisory locks live
/// directly under `<root>` regardless of `shard_depth`.
#[must_use]
pub fn locks_dir(root: &Path) -> PathBuf {
    root.to_path_buf()
}

/// Root of the stub tree, `<root>/stubs`.
#[must_use]
pub fn stubs_root(root: &Path) -> PathBuf {
    root.join("stubs")
}

/// Path to the class-name index file.
#[must_use]
pub fn classnames_index_path(root: &Path) -> PathBuf {
    stubs_root(root).join("classnames.json")
}

/// Path to a record's stub file under its class's hash bucket.
#[must_use]
pub fn stub_path(root: &Path, id: RecordId, class_name: &str) -> PathBuf {
    stubs_root(root)
        .join(class_hash(class_name))
        .join(format!("{id}.stub"))
}
