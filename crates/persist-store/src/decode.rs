// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The decoder: turns a data-JSON document plus a class name
//! back into a live [`FieldAccess`] value, wiring reference markers to lazy
//! proxies where the field's declared type admits one and resolving them
//! eagerly otherwise.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Weak;

use persist_events::{EventBus, EventContext, EventKind};
use persist_proxy::ProxyLoader;
use persist_reflect::{FieldAccess, FieldType, FieldValue, ReflectError};
use persist_uuid::RecordId;
use serde_json::Value;

use crate::registry::ClassRegistry;

/// Errors raised while decoding a record's data JSON.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// A field assignment failed (unknown field, wrong shape, bad coercion).
    #[error(transparent)]
    Reflect(#[from] ReflectError),
    /// A field declared concrete (or not admitting a proxy) pointed at a
    /// record that no longer exists or has expired.
    #[error("dangling reference to {0}")]
    Dangling(RecordId),
    /// The data file's root value was not a JSON object.
    #[error("data file is not a JSON object")]
    NotAnObject,
}

/// Supplies the decoder with eager loads for fields that do not admit a
/// lazy proxy Implemented by [`crate::Storage`].
pub trait DecodeHost {
    /// Eagerly load `target`, failing with [`DecodeError::Dangling`] if it
    /// does not exist or has expired.
    fn load_eager(&self, target: RecordId) -> Result<Box<dyn FieldAccess>, DecodeError>;
}

/// A stand-in class fabricated for a `className` the caller has not
/// registered Holds every decoded field generically;
/// none of its fields admit proxy wiring, since an unregistered class
/// carries no declared field types for the admissibility rule to consult —
/// every reference inside a fabricated record is therefore resolved
/// eagerly rather than proxied.
pub struct DynamicRecord {
    class_name: &'static str,
    field_names: &'static [&'static str],
    fields: HashMap<String, FieldValue>,
    record_id: Option<RecordId>,
}

impl Clone for DynamicRecord {
    fn clone(&self) -> Self {
        Self {
            class_name: self.class_name,
            field_names: self.field_names,
            fields: self.fields.clone(),
            record_id: self.record_id,
        }
    }
}

impl FieldAccess for DynamicRecord {
    fn class_name(&self) -> &'static str {
        self.class_name
    }

    fn field_names(&self) -> &'static [&'static str] {
        self.field_names
    }

    fn declared_type(&self, _name: &str) -> Option<FieldType> {
        None
    }

    fn is_initialized(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(|v| !v.is_null())
    }

    fn get_field(&self, name: &str) -> Result<FieldValue, ReflectError> {
        self.fields
            .get(name)
            .cloned()
            .ok_or_else(|| ReflectError::UnknownField(name.to_owned(), self.class_name))
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), ReflectError> {
        self.fields.insert(name.to_owned(), value);
        Ok(())
    }

    fn unset_field(&mut self, name: &str) -> Result<(), ReflectError> {
        self.fields.insert(name.to_owned(), FieldValue::Null);
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

    fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    fn set_record_id(&mut self, id: RecordId) {
        self.record_id = Some(id);
    }
}

/// Decodes data-JSON documents into live [`FieldAccess`] values.
pub struct Decoder<'a> {
    registry: &'a ClassRegistry,
    rename_map: &'a HashMap<String, String>,
    events: &'a EventBus,
    alias_cache: RefCell<HashMap<String, &'static str>>,
}

impl<'a> Decoder<'a> {
    /// Build a decoder over `registry`, consulting `rename_map` before
    /// falling back to class fabrication
    #[must_use]
    pub fn new(registry: &'a ClassRegistry, rename_map: &'a HashMap<String, String>, events: &'a EventBus) -> Self {
        Self {
            registry,
            rename_map,
            events,
            alias_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Decode `data` (the parsed data-JSON document) for `id`, whose
    /// persisted class is `class_name`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] on a malformed document, an unassignable
    /// field, or a dangling eager reference.
    pub fn decode(
        &self,
        id: RecordId,
        class_name: &str,
        data: &Value,
        reserved_reference_name: &str,
        loader: &Weak<dyn ProxyLoader>,
        host: &dyn DecodeHost,
    ) -> Result<Box<dyn FieldAccess>, DecodeError> {
        let resolved = self.rename_map.get(class_name).map_or(class_name, String::as_str);
        let object = data.as_object().ok_or(DecodeError::NotAnObject)?;

        if let Some(mut node) = self.registry.instantiate(resolved) {
            for (field, raw) in object {
                let Some(declared) = node.declared_type(field) else {
                    tracing::debug!(class = resolved, field, "ignoring field absent from declared schema");
                    continue;
                };
                self.assign_typed_field(resolved, node.as_mut(), field, declared, raw, reserved_reference_name, loader, host)?;
            }
            return Ok(node);
        }

        let alias = self.fabricate_alias(resolved);
        self.events.dispatch(EventKind::ClassAliasCreated, || {
            EventContext::for_record(id).with_class_name(alias).with_detail(resolved.to_owned())
        });

        let mut fields = HashMap::with_capacity(object.len());
        let mut names = Vec::with_capacity(object.len());
        for (field, raw) in object {
            names.push(intern(field));
            let value = self.decode_dynamic_value(raw, reserved_reference_name, host)?;
            fields.insert(field.clone(), value);
        }
        let field_names: &'static [&'static str] = Box::leak(names.into_boxed_slice());
        Ok(Box::new(DynamicRecord {
            class_name: alias,
            field_names,
            fields,
            record_id: None,
        }))
    }

    fn fabricate_alias(&self, class_name: &str) -> &'static str {
        if let Some(existing) = self.alias_cache.borrow().get(class_name) {
            return existing;
        }
        let leaked = intern(class_name);
        self.alias_cache.borrow_mut().insert(class_name.to_owned(), leaked);
        leaked
    }

    #[allow(clippy::too_many_arguments)]
    fn assign_typed_field(
        &self,
        class_name: &str,
        node: &mut dyn FieldAccess,
        field: &str,
        declared: FieldType,
        raw: &Value,
        reserved_reference_name: &str,
        loader: &Weak<dyn ProxyLoader>,
        host: &dyn DecodeHost,
    ) -> Result<(), DecodeError> {
        if let Some(target) = reference_marker(raw, reserved_reference_name) {
            let admits_proxy = matches!(declared, FieldType::ProxyOrAny) && self.registry.admits_proxy(class_name, field);
            if admits_proxy {
                node.set_field(field, FieldValue::Unresolved(target))?;
                self.registry.wire(class_name, node, field, loader.clone())?;
            } else {
                let loaded = host.load_eager(target)?;
                node.set_field(field, FieldValue::Composite(loaded))?;
            }
            return Ok(());
        }

        match raw {
            Value::Array(items) => {
                let values = items.iter().map(|item| decode_container_value(item, reserved_reference_name)).collect();
                node.set_field(field, FieldValue::Array(values))?;
            }
            other => {
                node.set_field(field, json_to_naive(other))?;
            }
        }
        Ok(())
    }

    fn decode_dynamic_value(&self, raw: &Value, reserved_reference_name: &str, host: &dyn DecodeHost) -> Result<FieldValue, DecodeError> {
        if let Some(target) = reference_marker(raw, reserved_reference_name) {
            return Ok(FieldValue::Composite(host.load_eager(target)?));
        }
        match raw {
            Value::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.decode_dynamic_value(item, reserved_reference_name, host))
                    .collect::<Result<_, _>>()?;
                Ok(FieldValue::Array(values))
            }
            Value::Object(map) => {
                let entries = map
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), self.decode_dynamic_value(value, reserved_reference_name, host)?)))
                    .collect::<Result<_, DecodeError>>()?;
                Ok(FieldValue::Map(entries))
            }
            other => Ok(json_to_naive(other)),
        }
    }
}

fn intern(text: &str) -> &'static str {
    Box::leak(text.to_owned().into_boxed_str())
}

/// `raw` is a reference marker iff it is a JSON object with exactly one
/// field, named `reserved_reference_name`, whose value parses as a UUID.
fn reference_marker(raw: &Value, reserved_reference_name: &str) -> Option<RecordId> {
    let object = raw.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let (key, value) = object.iter().next()?;
    if key != reserved_reference_name {
        return None;
    }
    RecordId::parse(value.as_str()?).ok()
}

/// Decode one cell of a `FieldType::Container` field: a reference marker
/// becomes [`FieldValue::Unresolved`] rather than the literal
/// single-field map `json_to_naive` would otherwise produce, and nested
/// arrays/objects recurse so a marker buried inside them is still caught
/// (spec.md §4.8 step 3's "possibly nested container" rule). Container
/// cells never load eagerly or wire a proxy — they stay `Unresolved`
/// until something re-resolves them explicitly.
fn decode_container_value(value: &Value, reserved_reference_name: &str) -> FieldValue {
    if let Some(target) = reference_marker(value, reserved_reference_name) {
        return FieldValue::Unresolved(target);
    }
    match value {
        Value::Array(items) => FieldValue::Array(items.iter().map(|item| decode_container_value(item, reserved_reference_name)).collect()),
        Value::Object(map) => {
            FieldValue::Map(map.iter().map(|(k, v)| (k.clone(), decode_container_value(v, reserved_reference_name))).collect())
        }
        other => json_to_naive(other),
    }
}

fn json_to_naive(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => n.as_i64().map_or_else(
            || FieldValue::Float(n.as_f64().unwrap_or_default()),
            FieldValue::Int,
        ),
        Value::String(s) => FieldValue::Str(s.clone()),
        Value::Array(items) => FieldValue::Array(items.iter().map(json_to_naive).collect()),
        Value::Object(map) => FieldValue::Map(map.iter().map(|(k, v)| (k.clone(), json_to_naive(v))).collect()),
    }
}
