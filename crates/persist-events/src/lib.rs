// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![deny(
    missing_docs,
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
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

//! Named-event dispatcher for the persistence engine
//!
//! Listeners are identified by reference identity, added and removed without
//! touching any other listener's registration. Dispatch builds a context
//! lazily so that call sites which have no subscribers pay nothing beyond the
//! borrow check, and isolates listeners from each other: a listener that
//! panics is caught, logged, and does not stop the remaining listeners from
//! running, nor does it propagate to the caller that triggered the event.

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use persist_uuid::RecordId;

/// The named events the store can raise over its lifetime.
///
/// Every event the engine fires is one of these; new call sites must reuse an
/// existing variant rather than growing ad hoc string event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A record is about to be loaded from disk.
    LoadBefore,
    /// A record finished loading from disk.
    LoadAfter,
    /// A record is about to be written to disk.
    StoreBefore,
    /// A record finished writing to disk.
    StoreAfter,
    /// A record is about to be deleted.
    DeleteBefore,
    /// A record finished deleting.
    DeleteAfter,
    /// An object's encoded body was written.
    ObjectSaved,
    /// A record's metadata sidecar was written.
    MetadataSaved,
    /// A stub file was created for a reference that was not yet resolvable.
    StubCreated,
    /// A stub file was removed because its target became resolvable.
    StubRemoved,
    /// A cached value satisfied a lookup without touching disk.
    CacheHit,
    /// The whole cache was cleared.
    CacheCleared,
    /// An entry was inserted into the cache.
    CacheEntryAdded,
    /// An entry was evicted from the cache.
    CacheEntryRemoved,
    /// Safe mode was entered.
    SafeModeOn,
    /// Safe mode was exited.
    SafeModeOff,
    /// A record's time-to-live was changed.
    LifetimeChanged,
    /// A record's time-to-live elapsed.
    ObjectExpired,
    /// A class rename alias was registered.
    ClassAliasCreated,
    /// A record's stored class name was rewritten.
    ClassnameChanged,
    /// An exclusive or shared lock was acquired.
    LockAcquired,
    /// A held lock was released.
    LockReleased,
    /// An operation failed; `EventContext::detail` carries the error kind.
    Failure,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoadBefore => "load-before",
            Self::LoadAfter => "load-after",
            Self::StoreBefore => "store-before",
            Self::StoreAfter => "store-after",
            Self::DeleteBefore => "delete-before",
            Self::DeleteAfter => "delete-after",
            Self::ObjectSaved => "object-saved",
            Self::MetadataSaved => "metadata-saved",
            Self::StubCreated => "stub-created",
            Self::StubRemoved => "stub-removed",
            Self::CacheHit => "cache-hit",
            Self::CacheCleared => "cache-cleared",
            Self::CacheEntryAdded => "cache-entry-added",
            Self::CacheEntryRemoved => "cache-entry-removed",
            Self::SafeModeOn => "safe-mode-on",
            Self::SafeModeOff => "safe-mode-off",
            Self::LifetimeChanged => "lifetime-changed",
            Self::ObjectExpired => "object-expired",
            Self::ClassAliasCreated => "class-alias-created",
            Self::ClassnameChanged => "classname-changed",
            Self::LockAcquired => "lock-acquired",
            Self::LockReleased => "lock-released",
            Self::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// Context passed to listeners alongside an [`EventKind`].
///
/// All fields are optional: not every event concerns a single record, and a
/// context builder that fails produces `EventContext::default()` rather than
/// aborting dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    /// The record the event concerns, if any.
    pub record: Option<RecordId>,
    /// The class name of the record the event concerns, if known.
    pub class_name: Option<String>,
    /// Free-form detail, e.g. an error kind for [`EventKind::Failure`].
    pub detail: Option<String>,
}

impl EventContext {
    /// Build a context naming only a record.
    #[must_use]
    pub fn for_record(record: RecordId) -> Self {
        Self {
            record: Some(record),
            class_name: None,
            detail: None,
        }
    }

    /// Attach a class name to this context, returning the updated value.
    #[must_use]
    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    /// Attach a detail string to this context, returning the updated value.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A subscriber notified when the engine raises an event.
///
/// Implementors should not assume ordering relative to other listeners, and
/// should not panic to signal failure back to the dispatcher: panics are
/// caught, but the listener's own error handling is lost in the process.
pub trait Listener {
    /// Handle one occurrence of `kind`.
    ///
    /// `context` is `None` only when the context builder for this dispatch
    /// itself panicked; implementations should treat that the same as an
    /// event with no known context rather than as an error.
    fn handle(&self, kind: EventKind, context: Option<&EventContext>);
}

/// Registry of listeners plus the dispatch loop that notifies them.
///
/// Not `Send`/`Sync`: the engine's concurrency model is single-threaded per
/// call, so the dispatcher uses `RefCell` rather than a mutex.
#[derive(Default)]
pub struct EventBus {
    listeners: RefCell<Vec<Rc<dyn Listener>>>,
}

impl EventBus {
    /// Create an empty bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. The same `Rc` can be subscribed more than once;
    /// it will then be notified once per subscription.
    pub fn subscribe(&self, listener: Rc<dyn Listener>) {
        self.listeners.borrow_mut().push(listener);
    }

    /// Remove every subscription pointing at the same listener instance as
    /// `listener`, identified by pointer equality rather than by value.
    ///
    /// Returns the number of subscriptions removed.
    pub fn unsubscribe(&self, listener: &Rc<dyn Listener>) -> usize {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|candidate| !Rc::ptr_eq(candidate, listener));
        before - listeners.len()
    }

    /// The number of currently registered subscriptions.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Raise `kind`, building its context lazily and notifying every
    /// subscriber in registration order.
    ///
    /// `build_context` runs at most once, regardless of how many listeners
    /// are registered. If it panics, the panic is caught and logged, and
    /// listeners receive `None` in its place. A listener that panics is
    /// likewise caught and logged; it does not prevent the remaining
    /// listeners from running, and dispatch never propagates a panic to the
    /// caller.
    pub fn dispatch(&self, kind: EventKind, build_context: impl FnOnce() -> EventContext) {
        let listeners = self.listeners.borrow();
        if listeners.is_empty() {
            return;
        }

        let context = match panic::catch_unwind(AssertUnwindSafe(build_context)) {
            Ok(context) => Some(context),
            Err(_) => {
                tracing::warn!(event = %kind, "event context builder panicked, dispatching with no context");
                None
            }
        };

        for listener in listeners.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.handle(kind, context.as_ref());
            }));
            if outcome.is_err() {
                tracing::warn!(event = %kind, "event listener panicked, isolating and continuing");
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}
