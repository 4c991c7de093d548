// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bridges the derive macro's inherent, monomorphic `wire_proxy_field` /
//! `proxy_field_names` methods to the type-erased decode path.
//!
//! `persist-reflect-derive` generates those two methods directly on the
//! concrete host struct rather than as trait methods, because the `match`
//! arm bodies need the field's concrete `LazyRef<Inner>` type to call
//! `LazyRef::wire`. The decoder in this crate only ever holds a
//! `Box<dyn FieldAccess>` selected by class name at runtime, so it cannot
//! call an inherent method directly. [`Wireable`] restates the same two
//! signatures as a trait any derived type can forward to in one line, and
//! [`ClassRegistry`] stores a `wire` function pointer captured generically
//! at registration time, which downcasts back to the concrete type before
//! calling through.

use std::collections::HashMap;
use std::rc::Weak;

use persist_reflect::{FieldAccess, Instantiate, ReflectError};

use persist_proxy::ProxyLoader;

/// Implemented by every derived record type, forwarding to the inherent
/// methods `#[derive(FieldAccess)]` generates. Implement with
/// [`impl_wireable!`] rather than by hand.
pub trait Wireable: FieldAccess {
    /// Field names admitting proxy wiring on this type.
    fn proxy_field_names() -> &'static [&'static str]
    where
        Self: Sized;

    /// Wire a lazy-proxy-backed field to its loader.
    fn wire_proxy_field(&mut self, name: &str, loader: Weak<dyn ProxyLoader>) -> Result<(), ReflectError>;
}

/// Forwards [`Wireable`] to the inherent methods `#[derive(FieldAccess)]`
/// generates on `$ty`. Call once per derived record type.
#[macro_export]
macro_rules! impl_wireable {
    ($ty:ty) => {
        impl $crate::Wireable for $ty {
            fn proxy_field_names() -> &'static [&'static str] {
                <$ty>::proxy_field_names()
            }

            fn wire_proxy_field(
                &mut self,
                name: &str,
                loader: ::std::rc::Weak<dyn ::persist_proxy::ProxyLoader>,
            ) -> ::core::result::Result<(), ::persist_reflect::ReflectError> {
                <$ty>::wire_proxy_field(self, name, loader)
            }
        }
    };
}

type WireFn = fn(&mut dyn FieldAccess, &str, Weak<dyn ProxyLoader>) -> Result<(), ReflectError>;

struct ClassEntry {
    instantiate: fn() -> Box<dyn FieldAccess>,
    proxy_field_names: fn() -> &'static [&'static str],
    wire: WireFn,
}

/// Maps class names to the type-erased operations the decoder needs:
/// instantiation, the set of proxy-admissible field names, and wiring a
/// named field to a loader. Distinct from, and consulted alongside,
/// [`persist_reflect::ClassRegistry`], which only knows how to
/// instantiate — it has no notion of proxy wiring at all.
#[derive(Default)]
pub struct ClassRegistry {
    entries: HashMap<&'static str, ClassEntry>,
}

impl ClassRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register `T` under `class_name`. Typically `class_name` is
    /// `T::default_class_name()`-equivalent, supplied by the caller since
    /// `FieldAccess::class_name` requires an instance.
    pub fn register<T>(&mut self, class_name: &'static str)
    where
        T: Wireable + Instantiate + 'static,
    {
        let wire: WireFn = |node, name, loader| {
            let class_name = node.class_name();
            let concrete = node
                .as_any_mut()
                .downcast_mut::<T>()
                .ok_or_else(|| ReflectError::WrongShape(class_name.to_owned()))?;
            concrete.wire_proxy_field(name, loader)
        };
        self.entries.insert(
            class_name,
            ClassEntry {
                instantiate: || Box::new(T::instantiate_uninitialized()),
                proxy_field_names: T::proxy_field_names,
                wire,
            },
        );
    }

    /// Whether `class_name` has been registered.
    #[must_use]
    pub fn contains(&self, class_name: &str) -> bool {
        self.entries.contains_key(class_name)
    }

    /// Instantiate a fresh, uninitialized instance of `class_name`.
    #[must_use]
    pub fn instantiate(&self, class_name: &str) -> Option<Box<dyn FieldAccess>> {
        self.entries.get(class_name).map(|e| (e.instantiate)())
    }

    /// The proxy-admissible field names for `class_name`, if registered.
    #[must_use]
    pub fn proxy_field_names(&self, class_name: &str) -> Option<&'static [&'static str]> {
        self.entries.get(class_name).map(|e| (e.proxy_field_names)())
    }

    /// Whether `field` on `class_name` admits proxy wiring
    #[must_use]
    pub fn admits_proxy(&self, class_name: &str, field: &str) -> bool {
        self.proxy_field_names(class_name)
            .is_some_and(|names| names.contains(&field))
    }

    /// Wire `field` on `node` (whose concrete type must match the
    /// registration for `class_name`) to `loader`.
    pub fn wire(
        &self,
        class_name: &str,
        node: &mut dyn FieldAccess,
        field: &str,
        loader: Weak<dyn ProxyLoader>,
    ) -> Result<(), ReflectError> {
        let entry = self
            .entries
            .get(class_name)
            .ok_or_else(|| ReflectError::UnknownField(field.to_owned(), "<unregistered class>"))?;
        (entry.wire)(node, field, loader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persist_reflect::{FieldType, FieldValue, ScalarKind};
    use std::any::Any;

    #[derive(Clone, Default)]
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
        fn declared_type(&self, _field: &str) -> Option<FieldType> {
            Some(FieldType::Scalar(ScalarKind::Int))
        }
        fn is_initialized(&self, _field: &str) -> bool {
            true
        }
        fn get_field(&self, field: &str) -> Result<FieldValue, ReflectError> {
            match field {
                "value" => Ok(FieldValue::Int(self.value)),
                other => Err(ReflectError::UnknownField(other.to_owned(), "Leaf")),
            }
        }
        fn set_field(&mut self, field: &str, value: FieldValue) -> Result<(), ReflectError> {
            match (field, value) {
                ("value", FieldValue::Int(v)) => {
                    self.value = v;
                    Ok(())
                }
                (other, _) => Err(ReflectError::UnknownField(other.to_owned(), "Leaf")),
            }
        }
        fn unset_field(&mut self, field: &str) -> Result<(), ReflectError> {
            match field {
                "value" => {
                    self.value = 0;
                    Ok(())
                }
                other => Err(ReflectError::UnknownField(other.to_owned(), "Leaf")),
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
    }

    impl Instantiate for Leaf {
        fn instantiate_uninitialized() -> Self {
            Self::default()
        }
    }

    impl Leaf {
        fn proxy_field_names() -> &'static [&'static str] {
            &[]
        }

        fn wire_proxy_field(&mut self, name: &str, _loader: Weak<dyn ProxyLoader>) -> Result<(), ReflectError> {
            Err(ReflectError::UnknownField(name.to_owned(), "Leaf"))
        }
    }

    impl_wireable!(Leaf);

    // ── 1. a registered class instantiates through the type-erased path ──

    #[test]
    fn instantiate_round_trips_through_registry() {
        let mut registry = ClassRegistry::new();
        registry.register::<Leaf>("Leaf");
        assert!(registry.contains("Leaf"));
        let node = registry.instantiate("Leaf").expect("registered");
        assert_eq!(node.class_name(), "Leaf");
    }

    // ── 2. proxy-admissibility is false for a class with no lazy fields ──

    #[test]
    fn admits_proxy_false_when_no_proxy_fields() {
        let mut registry = ClassRegistry::new();
        registry.register::<Leaf>("Leaf");
        assert!(!registry.admits_proxy("Leaf", "value"));
    }

    // ── 3. wiring an unregistered class fails with UnknownField ──────────

    #[test]
    fn wire_unregistered_class_fails() {
        let registry = ClassRegistry::new();
        let mut node: Box<dyn FieldAccess> = Box::new(Leaf::default());
        let err = registry.wire("Ghost", node.as_mut(), "value", Weak::new());
        assert!(err.is_err());
    }
}
