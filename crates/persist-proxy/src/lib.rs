// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Lazy proxy state machine
//!
//! [`LazyRef<T>`] is the static-language rendering of the source system's
//! deferred-loader object: a field typed `LazyRef<T>` holds either the
//! target's [`RecordId`] (unloaded) or a resolved `T` (loaded), and design
//! note §9 ("Lazy proxies in a static language → tagged variant") is
//! implemented literally — this *is* the `Either<Proxy, T>` the note
//! describes, parameterized by the admitting field's declared composite
//! type.
//!
//! The "on first access, rewrite the slot in the enclosing parent" half of
//! this contract needs no path-walking algorithm and no closure back into
//! the decoder: the slot *is* this `LazyRef`, embedded directly in the
//! parent's field, and [`LazyRef::get`] rewrites it in place by populating
//! its own interior `cached` cell. A field read through
//! [`FieldAccess::get_field`] (via [`LazyRef::snapshot`]) after a `get()`
//! call therefore already reflects the loaded value — there is no separate
//! parent object for a closure to reach back into. `persist-proxy`
//! consequently never needs to know about reflection paths, containers, or
//! the decoder's object graph — only that the loader speaks `Box<dyn
//! FieldAccess>`.
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

use std::cell::RefCell;
use std::fmt;
use std::rc::Weak;

use persist_reflect::{FieldAccess, FieldValue};
use persist_uuid::RecordId;

/// Errors surfaced while forcing a [`LazyRef`] to load.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The target record does not exist, or exists but has expired (spec
    /// §4.10 step 2, §8 invariant 9).
    #[error("dangling reference to {0}")]
    DanglingReference(RecordId),
    /// The loader this proxy was wired with has since been dropped (the
    /// owning storage handle no longer exists).
    #[error("proxy loader has been dropped")]
    LoaderGone,
    /// The loaded record decoded to a different concrete type than this
    /// proxy's declared `T`.
    #[error("loaded record is not a {expected}")]
    TypeMismatch {
        /// The statically-declared class this proxy expected.
        expected: &'static str,
    },
}

/// Type-erased loader a [`LazyRef`] calls on first access. Implemented
/// once by `persist-store::Storage`, not per persisted class — the
/// concrete downcast happens inside [`LazyRef::get`].
pub trait ProxyLoader {
    /// Load and decode the record identified by `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::DanglingReference`] if `target` does not
    /// exist or has expired.
    fn load_any(&self, target: RecordId) -> Result<Box<dyn FieldAccess>, ProxyError>;
}

/// A field that may hold either an unresolved reference or a resolved
/// composite of type `T`
///
/// States: `Unloaded` (has a target, no cached value) and `Loaded` (has a
/// cached value; the target may or may not be known, e.g. for a freshly
/// constructed child not yet assigned an identifier). Transition is
/// one-way and happens at most once per instance: once
/// [`LazyRef::get`] has populated `cached`, every subsequent call returns a
/// clone of the same value without touching the loader again.
pub struct LazyRef<T: FieldAccess + Clone + 'static> {
    target: RefCell<Option<RecordId>>,
    cached: RefCell<Option<T>>,
    loader: RefCell<Option<Weak<dyn ProxyLoader>>>,
}

impl<T: FieldAccess + Clone + 'static> LazyRef<T> {
    /// Construct an unloaded proxy bound to `target`. The loader is
    /// attached later via [`LazyRef::wire`], once the decoder holds a
    /// handle to the store it was decoded through.
    #[must_use]
    pub fn unloaded(target: RecordId) -> Self {
        Self {
            target: RefCell::new(Some(target)),
            cached: RefCell::new(None),
            loader: RefCell::new(None),
        }
    }

    /// Construct an already-resolved proxy wrapping `value` directly — used
    /// when the decoder forces eager resolution, or when application code
    /// assigns a freshly built child composite before it has ever been
    /// stored (no target yet).
    #[must_use]
    pub fn loaded(value: T) -> Self {
        Self {
            target: RefCell::new(None),
            cached: RefCell::new(Some(value)),
            loader: RefCell::new(None),
        }
    }

    /// Record the identifier this proxy's value was (or will be) stored
    /// under, once the graph serializer has assigned or discovered one.
    pub fn bind_target(&self, id: RecordId) {
        *self.target.borrow_mut() = Some(id);
    }

    /// Attach the loader an unloaded proxy needs before [`LazyRef::get`]
    /// can do anything. Re-wiring an already-loaded proxy is harmless (the
    /// loader is simply never consulted, since `get` short-circuits on the
    /// cache).
    pub fn wire(&self, loader: Weak<dyn ProxyLoader>) {
        *self.loader.borrow_mut() = Some(loader);
    }

    /// `true` iff this proxy has already resolved to a value.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.cached.borrow().is_some()
    }

    /// The target identifier, if known (always `Some` for an unloaded
    /// proxy; may be `None` for a loaded one never yet persisted).
    #[must_use]
    pub fn target(&self) -> Option<RecordId> {
        *self.target.borrow()
    }

    /// Force resolution, loading the target on first call Subsequent calls are
    /// idempotent, returning a clone of the cached value without touching
    /// the loader (spec invariant (iii)).
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::LoaderGone`] if called on an unloaded proxy
    /// whose loader has already been dropped, or whatever
    /// [`ProxyLoader::load_any`] returns (typically
    /// [`ProxyError::DanglingReference`]).
    pub fn get(&self) -> Result<T, ProxyError> {
        if let Some(value) = self.cached.borrow().as_ref() {
            return Ok(value.clone());
        }

        let target = self.target.borrow().ok_or(ProxyError::LoaderGone)?;
        let loader = self
            .loader
            .borrow_mut()
            .take()
            .and_then(|weak| weak.upgrade())
            .ok_or(ProxyError::LoaderGone)?;

        let boxed = loader.load_any(target)?;
        let concrete = boxed
            .as_any()
            .downcast_ref::<T>()
            .ok_or(ProxyError::TypeMismatch {
                expected: boxed.class_name(),
            })?
            .clone();

        *self.cached.borrow_mut() = Some(concrete.clone());
        tracing::debug!(target = %target, class = concrete.class_name(), "proxy-loaded");
        Ok(concrete)
    }

    /// A re-storable snapshot of this proxy's current state, without
    /// triggering a load
    #[must_use]
    pub fn snapshot(&self) -> FieldValue {
        if let Some(value) = self.cached.borrow().as_ref() {
            FieldValue::Composite(Box::new(value.clone()))
        } else if let Some(target) = *self.target.borrow() {
            FieldValue::Unresolved(target)
        } else {
            FieldValue::Null
        }
    }
}

impl<T: FieldAccess + Clone + 'static> Clone for LazyRef<T> {
    /// Clones the resolved value (if any) and the target identifier, but
    /// never the loader — a clone is a detached snapshot, not a second
    /// handle into the same parent slot, so it must be re-wired before it
    /// can load on its own.
    fn clone(&self) -> Self {
        Self {
            target: RefCell::new(*self.target.borrow()),
            cached: RefCell::new(self.cached.borrow().clone()),
            loader: RefCell::new(None),
        }
    }
}

impl<T: FieldAccess + Clone + Default + 'static> Default for LazyRef<T> {
    fn default() -> Self {
        Self::loaded(T::default())
    }
}

impl<T: FieldAccess + Clone + 'static> fmt::Debug for LazyRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyRef")
            .field("target", &self.target.borrow())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Leaf {
        value: i64,
    }

    impl FieldAccess for Leaf {
        fn class_name(&self) -> &'static str {
            "Leaf"
        }
        fn field_names(&self) -> &'static [&'static str] {
            &["value"]
        }
        fn declared_type(&self, _name: &str) -> Option<persist_reflect::FieldType> {
            Some(persist_reflect::FieldType::Scalar(persist_reflect::ScalarKind::Int))
        }
        fn is_initialized(&self, _name: &str) -> bool {
            true
        }
        fn get_field(&self, _name: &str) -> Result<FieldValue, persist_reflect::ReflectError> {
            Ok(FieldValue::Int(self.value))
        }
        fn set_field(&mut self, _name: &str, value: FieldValue) -> Result<(), persist_reflect::ReflectError> {
            if let FieldValue::Int(n) = value {
                self.value = n;
            }
            Ok(())
        }
        fn unset_field(&mut self, _name: &str) -> Result<(), persist_reflect::ReflectError> {
            self.value = 0;
            Ok(())
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
    }

    struct FixedLoader {
        value: Leaf,
        calls: Cell<u32>,
    }

    impl ProxyLoader for FixedLoader {
        fn load_any(&self, _target: RecordId) -> Result<Box<dyn FieldAccess>, ProxyError> {
            self.calls.set(self.calls.get() + 1);
            Ok(Box::new(self.value.clone()))
        }
    }

    // ── 1. loaded proxy returns its value without a loader ──────────────

    #[test]
    fn loaded_returns_value_without_loader() {
        let proxy = LazyRef::loaded(Leaf { value: 7 });
        assert!(proxy.is_loaded());
        assert_eq!(proxy.get().unwrap(), Leaf { value: 7 });
    }

    // ── 2. unloaded proxy loads exactly once ─────────────────────────────

    #[test]
    fn unloaded_loads_exactly_once() {
        let concrete = Rc::new(FixedLoader {
            value: Leaf { value: 42 },
            calls: Cell::new(0),
        });
        let loader: Rc<dyn ProxyLoader> = Rc::clone(&concrete) as Rc<dyn ProxyLoader>;
        let target = RecordId::new_v4();
        let proxy = LazyRef::<Leaf>::unloaded(target);
        proxy.wire(Rc::downgrade(&loader));

        assert!(!proxy.is_loaded());
        assert_eq!(proxy.get().unwrap(), Leaf { value: 42 });
        assert_eq!(proxy.get().unwrap(), Leaf { value: 42 });
        assert!(proxy.is_loaded());
        assert_eq!(concrete.calls.get(), 1);
    }

    // ── 3. get() rewrites the slot in place: the cache, not a callback ───
    // ── back into the parent, is what makes the field reflect the load ──

    #[test]
    fn get_rewrites_slot_via_cache() {
        let loader: Rc<dyn ProxyLoader> = Rc::new(FixedLoader {
            value: Leaf { value: 1 },
            calls: Cell::new(0),
        });
        let target = RecordId::new_v4();
        let proxy = LazyRef::<Leaf>::unloaded(target);
        proxy.wire(Rc::downgrade(&loader));

        assert_eq!(proxy.snapshot(), FieldValue::Unresolved(target));
        proxy.get().unwrap();
        match proxy.snapshot() {
            FieldValue::Composite(boxed) => {
                assert_eq!(boxed.as_any().downcast_ref::<Leaf>().unwrap().value, 1);
            }
            other => panic!("expected Composite after load, got {other:?}"),
        }
    }

    // ── 4. loader gone surfaces as LoaderGone ───────────────────────────

    #[test]
    fn loader_gone_is_reported() {
        let proxy = LazyRef::<Leaf>::unloaded(RecordId::new_v4());
        let weak = {
            let loader: Rc<dyn ProxyLoader> = Rc::new(FixedLoader {
                value: Leaf::default(),
                calls: Cell::new(0),
            });
            Rc::downgrade(&loader)
        };
        proxy.wire(weak);
        assert!(matches!(proxy.get(), Err(ProxyError::LoaderGone)));
    }

    // ── 5. unloaded snapshot is the target uuid, not a load ──────────────

    #[test]
    fn unloaded_snapshot_is_reference_marker() {
        let target = RecordId::new_v4();
        let proxy = LazyRef::<Leaf>::unloaded(target);
        assert_eq!(proxy.snapshot(), FieldValue::Unresolved(target));
        assert!(!proxy.is_loaded());
    }

    // ── 6. loaded snapshot carries the composite ─────────────────────────

    #[test]
    fn loaded_snapshot_is_composite() {
        let proxy = LazyRef::loaded(Leaf { value: 9 });
        match proxy.snapshot() {
            FieldValue::Composite(boxed) => {
                assert_eq!(boxed.as_any().downcast_ref::<Leaf>().unwrap().value, 9);
            }
            other => panic!("expected Composite, got {other:?}"),
        }
    }

    // ── 7. clone detaches loader ──────────────────────────────────────────

    #[test]
    fn clone_detaches_wiring() {
        let loader: Rc<dyn ProxyLoader> = Rc::new(FixedLoader {
            value: Leaf { value: 5 },
            calls: Cell::new(0),
        });
        let proxy = LazyRef::<Leaf>::unloaded(RecordId::new_v4());
        proxy.wire(Rc::downgrade(&loader));
        let cloned = proxy.clone();
        assert!(matches!(cloned.get(), Err(ProxyError::LoaderGone)));
    }

    // ── 8. default is a loaded default-valued composite ──────────────────

    #[test]
    fn default_is_loaded_default_value() {
        let proxy: LazyRef<Leaf> = LazyRef::default();
        assert!(proxy.is_loaded());
        assert_eq!(proxy.get().unwrap(), Leaf::default());
    }
}
