// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A schema-less [`FieldAccess`] over an arbitrary JSON object, so `put`
//! can hand the store a node without a registered Rust type, and `get`
//! can render whatever the decoder hands back (a registered type this
//! binary knows nothing about, or the store's own `DynamicRecord`
//! fallback) back out as JSON.

use std::any::Any;

use persist_reflect::{FieldAccess, FieldValue, ReflectError};
use persist_uuid::RecordId;
use serde_json::{Map, Value};

/// Holds one JSON object's fields as a live [`FieldAccess`], preserving
/// insertion order. A top-level `{ "__reference": "<uuid>" }` value inside
/// the input is read back as [`FieldValue::Unresolved`] rather than a
/// literal nested object, so re-`put`-ting a previously exported record
/// reconstructs its reference markers instead of double-wrapping them.
#[derive(Clone, Debug, Default)]
pub struct RawRecord {
    class_name: &'static str,
    // Each name is leaked once, on first insertion, so `field_names` can
    // hand out a `&'static [&'static str]` like every other `FieldAccess`
    // implementor without re-leaking (and thus re-borrowing past `self`'s
    // own lifetime) on every call.
    names: Vec<&'static str>,
    fields: Vec<FieldValue>,
    record_id: Option<RecordId>,
}

fn leak_str(s: &str) -> &'static str {
    Box::leak(s.to_owned().into_boxed_str())
}

impl RawRecord {
    /// Build a record named `class_name` from a parsed JSON object.
    pub fn from_object(class_name: &str, object: &Map<String, Value>) -> Self {
        let mut names = Vec::with_capacity(object.len());
        let mut fields = Vec::with_capacity(object.len());
        for (key, value) in object {
            names.push(leak_str(key));
            fields.push(json_to_field_value(value));
        }
        Self {
            class_name: leak_str(class_name),
            names,
            fields,
            record_id: None,
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| *n == name)
    }

    /// Render this record back to a JSON object, e.g. for `get --raw`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let map = self
            .names
            .iter()
            .zip(&self.fields)
            .map(|(name, value)| ((*name).to_owned(), field_value_to_json(value)))
            .collect();
        Value::Object(map)
    }
}

fn json_to_field_value(value: &Value) -> FieldValue {
    if let Some(target) = reference_marker(value) {
        return FieldValue::Unresolved(target);
    }
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => n
            .as_i64()
            .map_or_else(|| FieldValue::Float(n.as_f64().unwrap_or_default()), FieldValue::Int),
        Value::String(s) => FieldValue::Str(s.clone()),
        Value::Array(items) => FieldValue::Array(items.iter().map(json_to_field_value).collect()),
        Value::Object(map) => {
            FieldValue::Map(map.iter().map(|(k, v)| (k.clone(), json_to_field_value(v))).collect())
        }
    }
}

fn reference_marker(value: &Value) -> Option<RecordId> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let (key, value) = object.iter().next()?;
    if key != "__reference" {
        return None;
    }
    RecordId::parse(value.as_str()?).ok()
}

/// Render a decoded [`FieldValue`] back to JSON, e.g. for `get --raw`.
/// [`FieldValue::Composite`] recurses through the child's own fields;
/// [`FieldValue::Unresolved`] re-emits the reference marker shape.
#[must_use]
pub fn field_value_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Bool(*b),
        FieldValue::Int(i) => Value::from(*i),
        FieldValue::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        FieldValue::Str(s) => Value::String(s.clone()),
        FieldValue::Array(items) => Value::Array(items.iter().map(field_value_to_json).collect()),
        FieldValue::Map(entries) => {
            Value::Object(entries.iter().map(|(k, v)| (k.clone(), field_value_to_json(v))).collect())
        }
        FieldValue::Unresolved(id) => {
            let mut map = Map::new();
            map.insert("__reference".to_owned(), Value::String(id.to_string()));
            Value::Object(map)
        }
        FieldValue::Composite(child) => composite_to_json(child.as_ref()),
    }
}

/// Render any [`FieldAccess`] node's initialized fields to a JSON object,
/// e.g. the `Box<dyn FieldAccess>` returned by `Storage::load` for `get`.
#[must_use]
pub fn composite_to_json_public(node: &dyn FieldAccess) -> Value {
    composite_to_json(node)
}

fn composite_to_json(node: &dyn FieldAccess) -> Value {
    let mut map = Map::new();
    for name in node.field_names() {
        if !node.is_initialized(name) {
            continue;
        }
        if let Ok(value) = node.get_field(name) {
            map.insert((*name).to_owned(), field_value_to_json(&value));
        }
    }
    Value::Object(map)
}

impl FieldAccess for RawRecord {
    fn class_name(&self) -> &'static str {
        self.class_name
    }

    fn field_names(&self) -> &'static [&'static str] {
        // The `Vec` itself is re-leaked per call (cheap: CLI invocations are
        // short-lived and touch each record's field list only a handful of
        // times), but every element was already leaked once in
        // `from_object`/`set_field`, so this is a genuine `&'static` slice
        // rather than one that merely borrows from `self`.
        Box::leak(self.names.clone().into_boxed_slice())
    }

    fn declared_type(&self, _name: &str) -> Option<persist_reflect::FieldType> {
        None
    }

    fn is_initialized(&self, name: &str) -> bool {
        self.index_of(name).is_some_and(|i| !self.fields[i].is_null())
    }

    fn get_field(&self, name: &str) -> Result<FieldValue, ReflectError> {
        self.index_of(name)
            .map(|i| self.fields[i].clone())
            .ok_or_else(|| ReflectError::UnknownField(name.to_owned(), self.class_name))
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), ReflectError> {
        if let Some(i) = self.index_of(name) {
            self.fields[i] = value;
        } else {
            self.names.push(leak_str(name));
            self.fields.push(value);
        }
        Ok(())
    }

    fn unset_field(&mut self, name: &str) -> Result<(), ReflectError> {
        if let Some(i) = self.index_of(name) {
            self.fields[i] = FieldValue::Null;
            Ok(())
        } else {
            Err(ReflectError::UnknownField(name.to_owned(), self.class_name))
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── 1. a flat object round-trips through FieldAccess and back to JSON ─

    #[test]
    fn flat_object_round_trips() {
        let input = json!({ "name": "bolt", "count": 3 });
        let record = RawRecord::from_object("Widget", input.as_object().expect("object"));
        assert_eq!(record.get_field("name").expect("field"), FieldValue::Str("bolt".to_owned()));
        assert_eq!(record.to_json(), input);
    }

    // ── 2. a reference-marker-shaped field becomes Unresolved, not a map ──

    #[test]
    fn reference_marker_becomes_unresolved() {
        let target = RecordId::new_v4();
        let input = json!({ "parent": { "__reference": target.to_string() } });
        let record = RawRecord::from_object("Widget", input.as_object().expect("object"));
        assert_eq!(record.get_field("parent").expect("field"), FieldValue::Unresolved(target));
    }

    // ── 3. set_field on an unknown name appends rather than erroring ─────

    #[test]
    fn set_field_appends_new_names() {
        let mut record = RawRecord::from_object("Widget", &Map::new());
        record.set_field("added", FieldValue::Int(1)).expect("sets");
        assert_eq!(record.get_field("added").expect("field"), FieldValue::Int(1));
    }
}
