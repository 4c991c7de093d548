// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reflection adapter capability for persisted classes
//!
//! The source system this engine is ported from reaches into arbitrary
//! private fields, enumerates dynamic properties, and instantiates objects
//! without running their constructors. Rust has no such runtime reflection,
//! so persisted types instead implement [`FieldAccess`] — a small capability
//! enumerating/reading/writing named fields through [`FieldValue`], a
//! JSON-shaped value type with two extra variants for references the graph
//! serializer and decoder need [`persist-reflect-derive`](https://docs.rs/persist-reflect-derive)
//! derives the boilerplate implementation for ordinary structs.
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

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use persist_uuid::RecordId;

/// A value carried in a persisted field, mirroring the shapes allowed in
/// the data JSON
///
/// `Clone`/`PartialEq` are implemented by hand below: [`FieldValue::Composite`]
/// carries a `Box<dyn FieldAccess>`, which can neither derive nor borrow a
/// blanket impl from the trait object itself.
#[derive(Debug)]
pub enum FieldValue {
    /// Absent/uninitialized field
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// String scalar.
    Str(String),
    /// Ordered sequence: any iterable/generator is materialized into an
    /// ordered key→value mapping; a plain array is the integer-keyed
    /// special case.
    Array(Vec<FieldValue>),
    /// Ordered string-keyed mapping (dynamic/nested object fields).
    Map(Vec<(String, FieldValue)>),
    /// An embedded composite that is already resolved in memory, as a
    /// type-erased [`FieldAccess`] handle. Used when the graph serializer
    /// walks a loaded sub-object, or when the decoder forces eager
    /// resolution for a concretely-typed field
    Composite(Box<dyn FieldAccess>),
    /// A reference marker not yet resolved to an in-memory value — the
    /// on-disk `{ reserved-name: uuid }` shape, or (on the decode path) the
    /// signal that a [`FieldAccess`] implementer should install an
    /// unloaded lazy proxy instead
    Unresolved(RecordId),
}

impl FieldValue {
    /// `true` for [`FieldValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl Clone for FieldValue {
    fn clone(&self) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(n) => Self::Int(*n),
            Self::Float(n) => Self::Float(*n),
            Self::Str(s) => Self::Str(s.clone()),
            Self::Array(items) => Self::Array(items.clone()),
            Self::Map(entries) => Self::Map(entries.clone()),
            Self::Composite(boxed) => Self::Composite(boxed.clone_box()),
            Self::Unresolved(id) => Self::Unresolved(*id),
        }
    }
}

impl PartialEq for FieldValue {
    /// Structural equality for everything except [`FieldValue::Composite`],
    /// which compares by class name only — two composites are never
    /// compared field-by-field through this type (callers that need that
    /// compare the concrete, downcast value instead).
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Unresolved(a), Self::Unresolved(b)) => a == b,
            (Self::Composite(a), Self::Composite(b)) => a.class_name() == b.class_name(),
            _ => false,
        }
    }
}

impl fmt::Debug for dyn FieldAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("dyn FieldAccess")
            .field("class_name", &self.class_name())
            .finish_non_exhaustive()
    }
}

/// How a field's declared type constrains the value the decoder may place
/// there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// A JSON scalar (`int`, `float`, `bool`, `string`) — coerced between
    /// the four kinds on mismatch
    Scalar(ScalarKind),
    /// A container (array or map) of further values.
    Container,
    /// A concrete, single persisted class. "Concrete single-class
    /// declarations force eager resolution" — the decoder must load the
    /// target immediately rather than installing a proxy.
    Concrete,
    /// Admits a lazy reference: the proxy variant itself, `any object`,
    /// dynamically typed, or a union including one of those. In this port
    /// this is exactly a field declared as `persist_proxy::LazyRef<T>`.
    ProxyOrAny,
}

/// The four scalar kinds the decoder coerces between on type mismatch
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    /// `i64`.
    Int,
    /// `f64`.
    Float,
    /// `bool`.
    Bool,
    /// `String`.
    Str,
}

/// Errors surfaced by [`FieldAccess`] implementations and the scalar
/// coercion helpers in this crate.
#[derive(Debug, thiserror::Error)]
pub enum ReflectError {
    /// `set_field`/`declared_type` was asked about a field the type does
    /// not declare.
    #[error("unknown field {0:?} on {1}")]
    UnknownField(String, &'static str),
    /// A scalar value could not be coerced to the field's declared kind
    /// (spec error taxonomy: `TypeConversion`).
    #[error("cannot convert {from:?} to {to:?} for field {field:?}")]
    TypeConversion {
        /// Field the conversion was attempted for.
        field: String,
        /// The decoded value's actual shape.
        from: &'static str,
        /// The field's declared scalar kind.
        to: ScalarKind,
    },
    /// A value of the wrong shape (e.g. a composite where a scalar was
    /// expected) was supplied to `set_field`.
    #[error("wrong value shape for field {0:?}")]
    WrongShape(String),
}

/// Capability that a persisted class implements so the engine can
/// enumerate, read, and write its fields without reflection Implementations are generated by `#[derive(FieldAccess)]` for the
/// common case of a struct with named fields.
pub trait FieldAccess: Any {
    /// The persisted class name
    fn class_name(&self) -> &'static str;

    /// Declared field names, in the order the type declares them. The
    /// graph serializer sorts these lexicographically itself; implementers need not pre-sort.
    fn field_names(&self) -> &'static [&'static str];

    /// Declared type of `name`, used to decide proxy admissibility and
    /// scalar coercion. Panics-free: returns `None` for unknown fields
    /// (callers are expected to have checked `field_names` first, but a
    /// resilient implementation still tolerates the miss).
    fn declared_type(&self, name: &str) -> Option<FieldType>;

    /// `true` iff `name` currently holds an initialized value
    fn is_initialized(&self, name: &str) -> bool;

    /// Read the current value of `name` as a [`FieldValue`]. A loaded
    /// `persist_proxy::LazyRef` field reports
    /// [`FieldValue::Composite`]; an unloaded one reports
    /// [`FieldValue::Unresolved`]
    ///
    /// # Errors
    ///
    /// Returns [`ReflectError::UnknownField`] if `name` is not declared.
    fn get_field(&self, name: &str) -> Result<FieldValue, ReflectError>;

    /// Write `value` into `name`, coercing scalars to the field's declared
    /// shape.
    ///
    /// # Errors
    ///
    /// Returns [`ReflectError::UnknownField`], [`ReflectError::WrongShape`],
    /// or [`ReflectError::TypeConversion`].
    fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), ReflectError>;

    /// Clear `name` back to uninitialized.
    ///
    /// # Errors
    ///
    /// Returns [`ReflectError::UnknownField`] if `name` is not declared.
    fn unset_field(&mut self, name: &str) -> Result<(), ReflectError>;

    /// Upcast to [`Any`] for downstream downcasting back to a concrete
    /// type (needed by the typed facade API and by the proxy-wiring
    /// registry's type-erased dispatch).
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast counterpart to [`FieldAccess::as_any`].
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Owned upcast, for the decoder's "concrete eager field" path, which
    /// needs to move a boxed composite back into a struct field of its
    /// exact concrete type.
    fn into_any_box(self: Box<Self>) -> Box<dyn Any>;

    /// Clone this value behind a fresh box, so [`FieldValue`] (which holds
    /// `Box<dyn FieldAccess>`) can implement `Clone` without requiring
    /// `FieldAccess` itself to be object-safe-incompatible `Clone`.
    fn clone_box(&self) -> Box<dyn FieldAccess>;

    /// The identifier this instance currently carries inline, if the
    /// persisted type opts into the `{getUuid, setUuid}` capability (spec
    /// §4.1). Because it is a value read back out of a plain struct field
    /// rather than a pointer, it survives `clone_box` intact — two clones of
    /// the same logical record report the same `record_id`, which is what
    /// lets the graph serializer recognize "the same composite" across repeated
    /// [`FieldAccess::get_field`] calls that each hand back a fresh clone.
    ///
    /// The default implementation returns `None`: types that do not opt in
    /// fall back to the engine's process-local, pointer-keyed identity map.
    fn record_id(&self) -> Option<RecordId> {
        None
    }

    /// Assign this instance's inline identifier. The default implementation
    /// is a no-op, matching [`FieldAccess::record_id`]'s default of `None`.
    fn set_record_id(&mut self, _id: RecordId) {}
}

/// Instantiation without running a user constructor Mapped onto
/// [`Default::default`] in this port: the derive macro requires every
/// field type to implement [`Default`], since Rust has no notion of "skip
/// the constructor" beyond that.
pub trait Instantiate: FieldAccess + Sized {
    /// Build a value with every field at its zero/default state, as the
    /// decoder's starting point before field-by-field assignment.
    fn instantiate_uninitialized() -> Self;
}

/// A constructor function registered per class name, used to fabricate a
/// boxed instance during decode without the caller needing to name the
/// concrete type
pub type BoxedConstructor = fn() -> Box<dyn FieldAccess>;

/// Maps persisted class names to constructors for types registered via
/// [`ClassRegistry::register`]. Used by the decoder to instantiate the
/// right concrete type for a record's `className`, and by the "unknown
/// class" fallback when no constructor is registered.
#[derive(Default)]
pub struct ClassRegistry {
    constructors: HashMap<&'static str, BoxedConstructor>,
}

impl ClassRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register `T` under its own [`FieldAccess::class_name`]. Call once
    /// per persisted type at startup, the same way `echo-app-core`'s
    /// `ConfigService` registers its known preference keys up front.
    pub fn register<T>(&mut self)
    where
        T: Instantiate + 'static,
    {
        let ctor: BoxedConstructor = || Box::new(T::instantiate_uninitialized());
        // Class name comes from a throwaway instance; cheap since
        // `instantiate_uninitialized` does no I/O.
        let name = T::instantiate_uninitialized().class_name();
        self.constructors.insert(name, ctor);
    }

    /// Instantiate a boxed, uninitialized value for `class_name`, if a
    /// constructor is registered.
    #[must_use]
    pub fn instantiate(&self, class_name: &str) -> Option<Box<dyn FieldAccess>> {
        self.constructors.get(class_name).map(|ctor| ctor())
    }

    /// `true` iff `class_name` has a registered constructor.
    #[must_use]
    pub fn contains(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Coerce a decoded JSON-shaped scalar [`FieldValue`] to the field's
/// declared [`ScalarKind`]
///
/// # Errors
///
/// Returns [`ReflectError::TypeConversion`] if `value` is not a scalar, or
/// is a scalar that cannot be coerced to `kind` (e.g. a non-numeric string
/// coerced to `Int`).
pub fn coerce_scalar(field: &str, value: &FieldValue, kind: ScalarKind) -> Result<FieldValue, ReflectError> {
    let shape = |v: &FieldValue| -> &'static str {
        match v {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Str(_) => "string",
            FieldValue::Array(_) => "array",
            FieldValue::Map(_) => "map",
            FieldValue::Composite(_) => "composite",
            FieldValue::Unresolved(_) => "reference",
        }
    };
    let fail = || ReflectError::TypeConversion {
        field: field.to_owned(),
        from: shape(value),
        to: kind,
    };

    match (value, kind) {
        (FieldValue::Int(_), ScalarKind::Int)
        | (FieldValue::Float(_), ScalarKind::Float)
        | (FieldValue::Bool(_), ScalarKind::Bool)
        | (FieldValue::Str(_), ScalarKind::Str) => Ok(value.clone()),

        (FieldValue::Int(n), ScalarKind::Float) => Ok(FieldValue::Float(*n as f64)),
        #[allow(clippy::cast_possible_truncation)]
        (FieldValue::Float(n), ScalarKind::Int) => {
            if n.fract() == 0.0 {
                Ok(FieldValue::Int(*n as i64))
            } else {
                Err(fail())
            }
        }
        (FieldValue::Int(n), ScalarKind::Bool) => Ok(FieldValue::Bool(*n != 0)),
        (FieldValue::Bool(b), ScalarKind::Int) => Ok(FieldValue::Int(i64::from(*b))),
        (FieldValue::Str(s), ScalarKind::Int) => s.parse::<i64>().map(FieldValue::Int).map_err(|_| fail()),
        (FieldValue::Str(s), ScalarKind::Float) => s.parse::<f64>().map(FieldValue::Float).map_err(|_| fail()),
        (FieldValue::Str(s), ScalarKind::Bool) => s.parse::<bool>().map(FieldValue::Bool).map_err(|_| fail()),
        (FieldValue::Int(n), ScalarKind::Str) => Ok(FieldValue::Str(n.to_string())),
        (FieldValue::Float(n), ScalarKind::Str) => Ok(FieldValue::Str(n.to_string())),
        (FieldValue::Bool(b), ScalarKind::Str) => Ok(FieldValue::Str(b.to_string())),

        _ => Err(fail()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Dummy {
        count: i64,
    }

    impl FieldAccess for Dummy {
        fn class_name(&self) -> &'static str {
            "Dummy"
        }
        fn field_names(&self) -> &'static [&'static str] {
            &["count"]
        }
        fn declared_type(&self, name: &str) -> Option<FieldType> {
            (name == "count").then_some(FieldType::Scalar(ScalarKind::Int))
        }
        fn is_initialized(&self, _name: &str) -> bool {
            true
        }
        fn get_field(&self, name: &str) -> Result<FieldValue, ReflectError> {
            if name == "count" {
                Ok(FieldValue::Int(self.count))
            } else {
                Err(ReflectError::UnknownField(name.to_owned(), "Dummy"))
            }
        }
        fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), ReflectError> {
            if name != "count" {
                return Err(ReflectError::UnknownField(name.to_owned(), "Dummy"));
            }
            match value {
                FieldValue::Int(n) => {
                    self.count = n;
                    Ok(())
                }
                other => Err(ReflectError::WrongShape(format!("{other:?}"))),
            }
        }
        fn unset_field(&mut self, name: &str) -> Result<(), ReflectError> {
            if name != "count" {
                return Err(ReflectError::UnknownField(name.to_owned(), "Dummy"));
            }
            self.count = 0;
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
            Box::new(Self { count: self.count })
        }
    }

    impl Instantiate for Dummy {
        fn instantiate_uninitialized() -> Self {
            Self::default()
        }
    }

    // ── 1. registry instantiates by class name ──────────────────────────

    #[test]
    fn registry_instantiates_by_class_name() {
        let mut registry = ClassRegistry::new();
        registry.register::<Dummy>();
        let boxed = registry.instantiate("Dummy").unwrap();
        assert_eq!(boxed.class_name(), "Dummy");
    }

    // ── 2. registry reports unknown classes as absent ───────────────────

    #[test]
    fn registry_unknown_class_is_none() {
        let registry = ClassRegistry::new();
        assert!(registry.instantiate("Nope").is_none());
        assert!(!registry.contains("Nope"));
    }

    // ── 3. set_field then get_field round-trips ──────────────────────────

    #[test]
    fn field_access_round_trip() {
        let mut dummy = Dummy::default();
        dummy.set_field("count", FieldValue::Int(7)).unwrap();
        assert_eq!(dummy.get_field("count").unwrap(), FieldValue::Int(7));
    }

    // ── 4. coerce int -> float ───────────────────────────────────────────

    #[test]
    fn coerce_int_to_float() {
        let coerced = coerce_scalar("x", &FieldValue::Int(3), ScalarKind::Float).unwrap();
        assert_eq!(coerced, FieldValue::Float(3.0));
    }

    // ── 5. coerce non-integral float -> int fails ────────────────────────

    #[test]
    fn coerce_fractional_float_to_int_fails() {
        let err = coerce_scalar("x", &FieldValue::Float(3.5), ScalarKind::Int);
        assert!(matches!(err, Err(ReflectError::TypeConversion { .. })));
    }

    // ── 6. coerce string -> int parses ───────────────────────────────────

    #[test]
    fn coerce_string_to_int_parses() {
        let coerced = coerce_scalar("x", &FieldValue::Str("42".to_owned()), ScalarKind::Int).unwrap();
        assert_eq!(coerced, FieldValue::Int(42));
    }

    // ── 7. coerce non-numeric string -> int fails ────────────────────────

    #[test]
    fn coerce_non_numeric_string_fails() {
        let err = coerce_scalar("x", &FieldValue::Str("nope".to_owned()), ScalarKind::Int);
        assert!(err.is_err());
    }

    // ── 8. composite shape is rejected for scalar coercion ───────────────

    #[test]
    fn coerce_rejects_composite() {
        let err = coerce_scalar("x", &FieldValue::Unresolved(RecordId::new_v4()), ScalarKind::Int);
        assert!(err.is_err());
    }

    // ── 9. default record_id is None and survives clone_box once set ────

    #[derive(Default, Clone)]
    struct WithUuid {
        uuid: Option<RecordId>,
    }

    impl FieldAccess for WithUuid {
        fn class_name(&self) -> &'static str {
            "WithUuid"
        }
        fn field_names(&self) -> &'static [&'static str] {
            &[]
        }
        fn declared_type(&self, _name: &str) -> Option<FieldType> {
            None
        }
        fn is_initialized(&self, _name: &str) -> bool {
            false
        }
        fn get_field(&self, name: &str) -> Result<FieldValue, ReflectError> {
            Err(ReflectError::UnknownField(name.to_owned(), "WithUuid"))
        }
        fn set_field(&mut self, name: &str, _value: FieldValue) -> Result<(), ReflectError> {
            Err(ReflectError::UnknownField(name.to_owned(), "WithUuid"))
        }
        fn unset_field(&mut self, name: &str) -> Result<(), ReflectError> {
            Err(ReflectError::UnknownField(name.to_owned(), "WithUuid"))
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
            self.uuid
        }
        fn set_record_id(&mut self, id: RecordId) {
            self.uuid = Some(id);
        }
    }

    #[test]
    fn default_record_id_is_none() {
        assert!(Dummy::default().record_id().is_none());
    }

    #[test]
    fn record_id_survives_clone_box() {
        let mut value = WithUuid::default();
        let id = RecordId::new_v4();
        value.set_record_id(id);
        let cloned = value.clone_box();
        assert_eq!(cloned.record_id(), Some(id));
    }
}
