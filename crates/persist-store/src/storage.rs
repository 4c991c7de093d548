// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The public facade: thin orchestration over the
//! serializer, decoder, locks, safe-mode, caches, and event bus.
//!
//! [`Storage`] is a cheap-to-clone handle wrapping `Rc<Inner>`; `Inner`
//! alone carries a self-[`Weak`] (populated once, in [`StorageBuilder::open`])
//! so nested loads reached through lazy-proxy resolution or forced-eager
//! typed fields can hand the decoder a loader pointing back at the same
//! store without ever needing an outer `Rc` in scope at call time.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::Duration;

use persist_cache::TtlCache;
use persist_events::{EventBus, EventContext, EventKind};
use persist_graph::{ChildWritePolicy, Serializer};
use persist_io::{IoAdapter, IoError, RealIo};
use persist_lock::{LockManager, LockMode, SafeModeGate};
use persist_meta::RecordMetadata;
use persist_proxy::{ProxyError, ProxyLoader};
use persist_reflect::{FieldAccess, Instantiate};
use persist_state::{SafeModeReason, StateHandler};
use persist_uuid::{IdentityMap, RecordId};

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::decode::{DecodeError, DecodeHost, Decoder};
use crate::layout;
use crate::listing;
use crate::registry::{ClassRegistry, Wireable};
use crate::sink::StoreSink;
use crate::PersistError;

/// Builds a [`Storage`] handle: registers the known persisted classes,
/// the class-rename map, and lets tests swap
/// in a fault-injecting [`IoAdapter`] or a deterministic [`Clock`]. A
/// builder rather than a constructor taking a type list directly, since
/// [`StoreConfig`] alone carries none.
pub struct StorageBuilder {
    config: StoreConfig,
    registry: ClassRegistry,
    rename_map: HashMap<String, String>,
    io: Box<dyn IoAdapter>,
    clock: Box<dyn Clock>,
}

impl StorageBuilder {
    /// Start building a store rooted per `config`.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            registry: ClassRegistry::new(),
            rename_map: HashMap::new(),
            io: Box::new(RealIo::new()),
            clock: Box::new(SystemClock),
        }
    }

    /// Register a persisted class so the decoder can instantiate it by
    /// name rather than fabricating a [`crate::DynamicRecord`].
    #[must_use]
    pub fn register<T>(mut self, class_name: &'static str) -> Self
    where
        T: Wireable + Instantiate + 'static,
    {
        self.registry.register::<T>(class_name);
        self
    }

    /// Map `old` class names (found in stored data) to `new` ones, applied
    /// before class lookup and before fabrication
    #[must_use]
    pub fn rename(mut self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.rename_map.insert(old.into(), new.into());
        self
    }

    /// Swap the I/O adapter, e.g. for a fault-injecting double in tests.
    #[must_use]
    pub fn io(mut self, io: impl IoAdapter + 'static) -> Self {
        self.io = Box::new(io);
        self
    }

    /// Swap the clock, e.g. for a fixed clock in tests.
    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Finish building, creating the storage root if absent.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Io`] if the root cannot be created.
    pub fn open(self) -> Result<Storage, PersistError> {
        self.io.create_dir_all(&self.config.root)?;
        let locks = LockManager::with_timing(layout::locks_dir(&self.config.root), self.config.poll_interval, self.config.lock_timeout);
        let state = StateHandler::new(self.config.root.clone());

        let inner = Rc::new(Inner {
            config: self.config,
            io: self.io,
            clock: self.clock,
            locks,
            state,
            events: EventBus::new(),
            registry: self.registry,
            rename_map: self.rename_map,
            identities: RefCell::new(IdentityMap::new()),
            object_cache: RefCell::new(TtlCache::new()),
            metadata_cache: RefCell::new(TtlCache::new()),
            self_loader: RefCell::new(None),
        });
        let weak: Weak<dyn ProxyLoader> = Rc::downgrade(&inner);
        *inner.self_loader.borrow_mut() = Some(weak);

        Ok(Storage { inner })
    }
}

struct Inner {
    config: StoreConfig,
    io: Box<dyn IoAdapter>,
    clock: Box<dyn Clock>,
    locks: LockManager,
    state: StateHandler,
    events: EventBus,
    registry: ClassRegistry,
    rename_map: HashMap<String, String>,
    identities: RefCell<IdentityMap>,
    object_cache: RefCell<TtlCache<Box<dyn FieldAccess>>>,
    metadata_cache: RefCell<TtlCache<RecordMetadata>>,
    self_loader: RefCell<Option<Weak<dyn ProxyLoader>>>,
}

impl Inner {
    fn self_weak(&self) -> Weak<dyn ProxyLoader> {
        self.self_loader.borrow().clone().unwrap_or_else(Weak::new)
    }

    fn enter_safe_mode(&self, reason: SafeModeReason) {
        if self.state.enable_safe_mode(reason).is_ok() {
            self.events.dispatch(EventKind::SafeModeOn, || EventContext::default().with_detail(format!("{reason:?}")));
        }
    }

    fn read_metadata(&self, id: RecordId) -> Result<Option<RecordMetadata>, PersistError> {
        if let Some(cached) = self.metadata_cache.borrow().get(id) {
            return Ok(Some(cached.clone()));
        }
        let path = layout::metadata_path(&self.config.root, id, self.config.shard_depth);
        match self.io.read(&path) {
            Ok(bytes) => {
                let metadata = RecordMetadata::from_json_bytes(&bytes)?;
                self.metadata_cache.borrow_mut().insert(id, metadata.clone());
                Ok(Some(metadata))
            }
            Err(IoError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn evict(&self, id: RecordId) {
        self.object_cache.borrow_mut().remove(id);
        self.metadata_cache.borrow_mut().remove(id);
    }

    /// The shared decode/load path used by the public facade, forced-eager
    /// typed fields ([`DecodeHost`]), and lazy-proxy resolution
    /// ([`ProxyLoader`]). Returns `Ok(None)` for a missing or expired
    /// record; callers decide whether that is an error.
    fn load_internal(&self, id: RecordId, mode: LockMode) -> Result<Option<Box<dyn FieldAccess>>, PersistError> {
        let _guard = self.locks.acquire(id, mode, Some(self.config.lock_timeout), &self.state)?;
        self.events.dispatch(EventKind::LoadBefore, || EventContext::for_record(id));

        let Some(metadata) = self.read_metadata(id)? else {
            if self.io.exists(&layout::data_path(&self.config.root, id, self.config.shard_depth)) {
                self.enter_safe_mode(SafeModeReason::MissingMetadata);
                return Err(PersistError::MetadataNotFound(id));
            }
            return Ok(None);
        };

        if metadata.is_expired(self.clock.now_seconds()) {
            self.events.dispatch(EventKind::ObjectExpired, || EventContext::for_record(id));
            return Ok(None);
        }

        if let Some(cached) = self.object_cache.borrow().get(id) {
            self.events.dispatch(EventKind::CacheHit, || EventContext::for_record(id));
            return Ok(Some(cached.clone_box()));
        }

        let data_path = layout::data_path(&self.config.root, id, self.config.shard_depth);
        let bytes = self.io.read(&data_path)?;
        if !metadata.verify(&bytes) {
            self.enter_safe_mode(SafeModeReason::ChecksumMismatch);
            return Err(PersistError::ChecksumMismatch(id));
        }

        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                self.enter_safe_mode(SafeModeReason::InvalidFormat);
                return Err(PersistError::InvalidFormat(id, e.to_string()));
            }
        };

        let decoder = Decoder::new(&self.registry, &self.rename_map, &self.events);
        let loader = self.self_weak();
        let node = decoder.decode(id, &metadata.class_name, &value, &metadata.reserved_reference_name, &loader, self)?;

        self.object_cache.borrow_mut().insert(id, node.clone_box());
        self.events.dispatch(EventKind::LoadAfter, || EventContext::for_record(id).with_class_name(metadata.class_name.clone()));
        Ok(Some(node))
    }

    fn store_internal(&self, node: &mut dyn FieldAccess, requested_id: Option<RecordId>, ttl: Option<Duration>) -> Result<RecordId, PersistError> {
        if self.state.safe_mode_enabled() {
            return Err(PersistError::SafeMode);
        }

        let root_id = requested_id.or_else(|| node.record_id()).unwrap_or_else(|| {
            persist_uuid::generate_unique(|candidate| self.io.exists(&layout::data_path(&self.config.root, *candidate, self.config.shard_depth)))
        });
        node.set_record_id(root_id);

        let _guard = self.locks.acquire_exclusive(root_id, &self.state)?;
        self.events.dispatch(EventKind::StoreBefore, || EventContext::for_record(root_id));

        let ttl = ttl.or(self.config.default_ttl);
        let assigned = {
            let mut identities = self.identities.borrow_mut();
            let mut serializer = Serializer::new(&mut identities, &self.events, self.config.max_nesting, self.config.child_write_policy);
            let mut sink = StoreSink::new(
                &self.config.root,
                self.config.shard_depth,
                self.io.as_ref(),
                self.clock.as_ref(),
                &self.events,
                root_id,
                ttl,
            );
            serializer.store(node, &mut sink)?
        };

        self.evict(assigned);
        self.events.dispatch(EventKind::StoreAfter, || EventContext::for_record(assigned));
        Ok(assigned)
    }

    fn delete_internal(&self, id: RecordId, force: bool) -> Result<(), PersistError> {
        if self.state.safe_mode_enabled() {
            return Err(PersistError::SafeMode);
        }
        let _guard = self.locks.acquire_exclusive(id, &self.state)?;
        self.events.dispatch(EventKind::DeleteBefore, || EventContext::for_record(id));

        let data_path = layout::data_path(&self.config.root, id, self.config.shard_depth);
        if !self.io.exists(&data_path) && !force {
            return Err(PersistError::NotFound(id));
        }

        let class_name = self.read_metadata(id)?.map(|m| m.class_name);
        self.evict(id);

        let metadata_path = layout::metadata_path(&self.config.root, id, self.config.shard_depth);
        for path in [&data_path, &metadata_path] {
            match self.io.remove_file(path) {
                Ok(()) | Err(IoError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(class_name) = class_name {
            let stub_path = layout::stub_path(&self.config.root, id, &class_name);
            match self.io.remove_file(&stub_path) {
                Ok(()) => self.events.dispatch(EventKind::StubRemoved, || EventContext::for_record(id)),
                Err(IoError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.events.dispatch(EventKind::DeleteAfter, || EventContext::for_record(id));
        Ok(())
    }
}

impl ProxyLoader for Inner {
    fn load_any(&self, target: RecordId) -> Result<Box<dyn FieldAccess>, ProxyError> {
        self.load_internal(target, LockMode::Shared)
            .map_err(|_| ProxyError::DanglingReference(target))?
            .ok_or(ProxyError::DanglingReference(target))
    }
}

impl DecodeHost for Inner {
    fn load_eager(&self, target: RecordId) -> Result<Box<dyn FieldAccess>, DecodeError> {
        self.load_internal(target, LockMode::Shared)
            .map_err(|_| DecodeError::Dangling(target))?
            .ok_or(DecodeError::Dangling(target))
    }
}

/// Cheap-to-clone handle over a record store rooted at one directory (spec
/// §4.9). Every operation acquires and releases its own lock; spec
/// invariant (finally-style release) holds because each `_guard` above is
/// a value dropped at the end of its owning method, including on the
/// early-return error paths.
#[derive(Clone)]
pub struct Storage {
    inner: Rc<Inner>,
}

impl Storage {
    /// Start a [`StorageBuilder`] rooted per `config`.
    #[must_use]
    pub fn builder(config: StoreConfig) -> StorageBuilder {
        StorageBuilder::new(config)
    }

    /// The configured storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    /// Persist `node`, assigning a fresh id unless `uuid` is given or the
    /// node already carries one.
    ///
    /// # Errors
    ///
    /// [`PersistError::SafeMode`] if the store is in safe-mode; otherwise
    /// any lock, I/O, or serialization failure, propagated after the lock
    /// is released.
    pub fn store(&self, node: &mut dyn FieldAccess, uuid: Option<RecordId>, ttl: Option<Duration>) -> Result<RecordId, PersistError> {
        self.inner.store_internal(node, uuid, ttl)
    }

    /// Load and decode the record identified by `id`.
    ///
    /// Returns `Ok(None)` both when `id` was never stored and when its
    /// record has expired (spec.md §4.9: `load` "returns composite or
    /// `null` if expired" — `NotFound` is deliberately not one of its
    /// failure modes, unlike `delete`'s).
    ///
    /// # Errors
    ///
    /// [`PersistError::ChecksumMismatch`] / [`PersistError::InvalidFormat`]
    /// / [`PersistError::MetadataNotFound`] on corruption (each also enables
    /// safe-mode); any lock or I/O failure otherwise.
    pub fn load(&self, id: RecordId, exclusive: bool) -> Result<Option<Box<dyn FieldAccess>>, PersistError> {
        let mode = if exclusive { LockMode::Exclusive } else { LockMode::Shared };
        self.inner.load_internal(id, mode)
    }

    /// Delete the record identified by `id`.
    ///
    /// # Errors
    ///
    /// [`PersistError::NotFound`] if absent and `force` is false;
    /// [`PersistError::SafeMode`] if the store is in safe-mode.
    pub fn delete(&self, id: RecordId, force: bool) -> Result<(), PersistError> {
        self.inner.delete_internal(id, force)
    }

    /// Cheap existence test against the data file.
    #[must_use]
    pub fn exists(&self, id: RecordId) -> bool {
        self.inner.io.exists(&layout::data_path(&self.inner.config.root, id, self.inner.config.shard_depth))
    }

    /// The persisted class name for `id`.
    ///
    /// # Errors
    ///
    /// [`PersistError::NotFound`] if no metadata exists for `id`.
    pub fn get_class_name(&self, id: RecordId) -> Result<String, PersistError> {
        self.load_metadata(id).map(|m| m.class_name)
    }

    /// The full metadata record for `id`.
    ///
    /// # Errors
    ///
    /// [`PersistError::NotFound`] if no metadata exists for `id`.
    pub fn load_metadata(&self, id: RecordId) -> Result<RecordMetadata, PersistError> {
        self.inner.read_metadata(id)?.ok_or(PersistError::NotFound(id))
    }

    /// Set (or clear) `id`'s absolute expiry timestamp, fractional Unix
    /// seconds.
    ///
    /// # Errors
    ///
    /// [`PersistError::NotFound`] if no metadata exists for `id`.
    pub fn set_expiration(&self, id: RecordId, at: Option<f64>) -> Result<(), PersistError> {
        let mut metadata = self.load_metadata(id)?;
        let before = metadata.timestamp_expires_at;
        metadata.timestamp_expires_at = at;
        let path = layout::metadata_path(&self.inner.config.root, id, self.inner.config.shard_depth);
        let bytes = metadata.to_json_bytes()?;
        self.inner.io.atomic_write(&path, &bytes, true)?;
        self.inner.metadata_cache.borrow_mut().insert(id, metadata);
        self.inner.events.dispatch(EventKind::LifetimeChanged, || {
            EventContext::for_record(id).with_detail(format!("{before:?} -> {at:?}"))
        });
        Ok(())
    }

    /// `id`'s absolute expiry timestamp, if any.
    ///
    /// # Errors
    ///
    /// [`PersistError::NotFound`] if no metadata exists for `id`.
    pub fn get_expiration(&self, id: RecordId) -> Result<Option<f64>, PersistError> {
        self.load_metadata(id).map(|m| m.timestamp_expires_at)
    }

    /// Clear both object and metadata caches.
    pub fn clear_cache(&self) {
        self.inner.object_cache.borrow_mut().clear();
        self.inner.metadata_cache.borrow_mut().clear();
        self.inner.events.dispatch(EventKind::CacheCleared, EventContext::default);
    }

    /// List every record id, optionally restricted to `class`.
    ///
    /// # Errors
    ///
    /// [`PersistError::Io`] if the stub tree cannot be read.
    pub fn list(&self, class: Option<&str>) -> Result<Vec<RecordId>, PersistError> {
        listing::list(&self.inner.config.root, class)
    }

    /// Count records, optionally restricted to `class`.
    ///
    /// # Errors
    ///
    /// [`PersistError::Io`] if the stub tree cannot be read.
    pub fn count(&self, class: Option<&str>) -> Result<usize, PersistError> {
        Ok(self.list(class)?.len())
    }

    /// Load every candidate (restricted to `class` and/or `subset` when
    /// given, up to `limit`) and keep those for which `predicate` returns
    /// `true`.
    /// Per-item load failures are logged and skipped rather than aborting
    /// the scan
    ///
    /// # Errors
    ///
    /// [`PersistError::Io`] if the candidate listing itself cannot be read.
    pub fn matches(
        &self,
        predicate: impl Fn(&dyn FieldAccess) -> bool,
        class: Option<&str>,
        limit: Option<usize>,
        subset: Option<&[RecordId]>,
    ) -> Result<Vec<RecordId>, PersistError> {
        let candidates = match subset {
            Some(ids) => ids.to_vec(),
            None => self.list(class)?,
        };
        let mut found = Vec::new();
        for id in candidates {
            if limit.is_some_and(|n| found.len() >= n) {
                break;
            }
            match self.load(id, false) {
                Ok(Some(node)) if predicate(node.as_ref()) => found.push(id),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(record = %id, error = %err, "skipping record during match scan");
                    self.inner.events.dispatch(EventKind::Failure, || {
                        EventContext::for_record(id).with_detail(err.to_string())
                    });
                }
            }
        }
        Ok(found)
    }

    /// Recreate the stub tree from each record's own metadata`, spec.md §6's maintenance table entry: "invoked
    /// under safe-mode").
    ///
    /// # Errors
    ///
    /// [`PersistError::Io`] if the data tree or stub tree cannot be read or
    /// written.
    pub fn rebuild_stubs(&self) -> Result<(), PersistError> {
        listing::rebuild_stubs(self.inner.io.as_ref(), &self.inner.config.root, self.inner.config.shard_depth, &self.inner.events)
    }

    /// Relocate every `.obj`/`.metadata` pair onto the layout implied by
    /// the store's *current* `shard_depth` (spec.md §6's maintenance table
    /// entry `rebuild-shards`, for a depth changed after records already
    /// exist).
    ///
    /// # Errors
    ///
    /// [`PersistError::Io`] if a file cannot be read, written, or removed.
    pub fn rebuild_shards(&self) -> Result<(), PersistError> {
        listing::rebuild_shards(self.inner.io.as_ref(), &self.inner.config.root, self.inner.config.shard_depth)
    }

    /// `true` while the store is in safe-mode
    #[must_use]
    pub fn is_safe_mode(&self) -> bool {
        self.inner.state.safe_mode_enabled()
    }

    /// Manually enable safe-mode
    ///
    /// # Errors
    ///
    /// [`PersistError::Io`] if the marker file cannot be written.
    pub fn enable_safe_mode(&self) -> Result<(), PersistError> {
        self.inner.state.enable_safe_mode(SafeModeReason::Manual)?;
        self.inner.events.dispatch(EventKind::SafeModeOn, EventContext::default);
        Ok(())
    }

    /// Manually disable safe-mode
    ///
    /// # Errors
    ///
    /// [`PersistError::Io`] if the marker file cannot be removed.
    pub fn disable_safe_mode(&self) -> Result<(), PersistError> {
        self.inner.state.disable_safe_mode()?;
        self.inner.events.dispatch(EventKind::SafeModeOff, EventContext::default);
        Ok(())
    }

    /// Subscribe `listener` to the event bus
    pub fn subscribe(&self, listener: Rc<dyn persist_events::Listener>) {
        self.inner.events.subscribe(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persist_reflect::{FieldType, FieldValue, ReflectError, ScalarKind};
    use std::any::Any;

    #[derive(Clone, Default)]
    struct Widget {
        name: String,
        record_id: Option<RecordId>,
    }

    impl FieldAccess for Widget {
        fn class_name(&self) -> &'static str {
            "Widget"
        }
        fn field_names(&self) -> &'static [&'static str] {
            &["name"]
        }
        fn declared_type(&self, name: &str) -> Option<FieldType> {
            (name == "name").then_some(FieldType::Scalar(ScalarKind::Str))
        }
        fn is_initialized(&self, _name: &str) -> bool {
            true
        }
        fn get_field(&self, name: &str) -> Result<FieldValue, ReflectError> {
            match name {
                "name" => Ok(FieldValue::Str(self.name.clone())),
                other => Err(ReflectError::UnknownField(other.to_owned(), "Widget")),
            }
        }
        fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), ReflectError> {
            match (name, value) {
                ("name", FieldValue::Str(s)) => {
                    self.name = s;
                    Ok(())
                }
                (other, _) => Err(ReflectError::UnknownField(other.to_owned(), "Widget")),
            }
        }
        fn unset_field(&mut self, name: &str) -> Result<(), ReflectError> {
            match name {
                "name" => {
                    self.name.clear();
                    Ok(())
                }
                other => Err(ReflectError::UnknownField(other.to_owned(), "Widget")),
            }
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
        fn into_any_box(self: Box<Self>) -> Box<dyn Any> {
            self
        }
        fn clone_box(&self) -> Box<dyn FieldAccess> {
            Box::new(self.clone())
        }
        fn record_id(&self) -> Option<RecordId> {
            self.record_id
        }
        fn set_record_id(&mut self, id: RecordId) {
            self.record_id = Some(id);
        }
    }

    impl Instantiate for Widget {
        fn instantiate_uninitialized() -> Self {
            Self::default()
        }
    }

    impl Widget {
        fn proxy_field_names() -> &'static [&'static str] {
            &[]
        }

        fn wire_proxy_field(&mut self, name: &str, _loader: Weak<dyn ProxyLoader>) -> Result<(), ReflectError> {
            Err(ReflectError::UnknownField(name.to_owned(), "Widget"))
        }
    }

    crate::impl_wireable!(Widget);

    fn open(dir: &std::path::Path) -> Storage {
        Storage::builder(StoreConfig::at(dir))
            .register::<Widget>("Widget")
            .open()
            .expect("opens")
    }

    // ── 1. store then load round-trips a registered class ───────────────

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open(dir.path());
        let mut widget = Widget {
            name: "bolt".to_owned(),
            record_id: None,
        };
        let id = storage.store(&mut widget, None, None).expect("stores");

        let loaded = storage.load(id, false).expect("loads").expect("found");
        assert_eq!(loaded.get_field("name").unwrap(), FieldValue::Str("bolt".to_owned()));
    }

    // ── 2. load of a never-stored id returns None, not an error ──────────

    #[test]
    fn load_missing_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open(dir.path());
        let found = storage.load(RecordId::new_v4(), false).expect("not an error");
        assert!(found.is_none());
    }

    // ── 3. delete without force fails NotFound; exists reflects both ────

    #[test]
    fn delete_roundtrip_and_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open(dir.path());
        let mut widget = Widget {
            name: "bolt".to_owned(),
            record_id: None,
        };
        let id = storage.store(&mut widget, None, None).expect("stores");
        assert!(storage.exists(id));

        storage.delete(id, false).expect("deletes");
        assert!(!storage.exists(id));
        assert!(matches!(storage.delete(id, false), Err(PersistError::NotFound(_))));
        storage.delete(id, true).expect("force delete of absent record is a no-op");
    }

    // ── 4. explicit uuid overrides both generation and a prior id ────────

    #[test]
    fn explicit_uuid_overrides_generation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open(dir.path());
        let requested = RecordId::new_v4();
        let mut widget = Widget {
            name: "bolt".to_owned(),
            record_id: None,
        };
        let id = storage.store(&mut widget, Some(requested), None).expect("stores");
        assert_eq!(id, requested);
    }

    // ── 5. checksum tampering enables safe-mode and blocks further stores ─

    #[test]
    fn tampered_data_enables_safe_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open(dir.path());
        let mut widget = Widget {
            name: "bolt".to_owned(),
            record_id: None,
        };
        let id = storage.store(&mut widget, None, None).expect("stores");

        let data_path = layout::data_path(dir.path(), id, 0);
        std::fs::write(&data_path, b"{\"name\":\"tampered\"}").expect("tamper");

        let err = storage.load(id, false);
        assert!(matches!(err, Err(PersistError::ChecksumMismatch(_))));
        assert!(storage.is_safe_mode());

        let mut other = Widget {
            name: "gadget".to_owned(),
            record_id: None,
        };
        assert!(matches!(storage.store(&mut other, None, None), Err(PersistError::SafeMode)));
    }

    // ── 6. expired records load as absent without erroring ───────────────

    #[test]
    fn expired_record_loads_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open(dir.path());
        let mut widget = Widget {
            name: "bolt".to_owned(),
            record_id: None,
        };
        let id = storage.store(&mut widget, None, Some(Duration::from_secs(0))).expect("stores");
        std::thread::sleep(Duration::from_millis(5));
        assert!(storage.load(id, false).expect("not an error").is_none());
        assert!(storage.exists(id), "expiry leaves the files in place until delete");
    }

    // ── 7. clear_cache does not affect durability: reload still succeeds ──

    #[test]
    fn clear_cache_then_reload_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open(dir.path());
        let mut widget = Widget {
            name: "bolt".to_owned(),
            record_id: None,
        };
        let id = storage.store(&mut widget, None, None).expect("stores");
        storage.load(id, false).expect("primes cache");
        storage.clear_cache();
        let loaded = storage.load(id, false).expect("reloads from disk").expect("found");
        assert_eq!(loaded.get_field("name").unwrap(), FieldValue::Str("bolt".to_owned()));
    }

    // ── 8. list/count/match see a stored record of the right class ───────

    #[test]
    fn list_count_and_match_see_stored_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = open(dir.path());
        let mut widget = Widget {
            name: "bolt".to_owned(),
            record_id: None,
        };
        let id = storage.store(&mut widget, None, None).expect("stores");

        assert_eq!(storage.list(Some("Widget")).expect("lists"), vec![id]);
        assert_eq!(storage.count(Some("Widget")).expect("counts"), 1);
        assert_eq!(storage.count(Some("Gadget")).expect("counts"), 0);

        let found = storage
            .matches(|node| node.get_field("name").ok() == Some(FieldValue::Str("bolt".to_owned())), Some("Widget"), None, None)
            .expect("matches");
        assert_eq!(found, vec![id]);
    }
}
