// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reusable sample graphs for the cycle, fan-out, and deep-nesting
//! scenarios, generalized from the `Leaf`/`Parent` fixtures inlined in
//! `persist_graph`'s own tests into one depth- and reference-configurable
//! type so `persist-store`'s integration tests don't redefine them.

use std::any::Any;

use persist_reflect::{FieldAccess, FieldType, FieldValue, Instantiate, ReflectError, ScalarKind};
use persist_uuid::RecordId;

/// A node with a name, an optional eagerly-nested `child` (for deep-chain
/// nesting-depth scenarios), and a list of `refs` pointing at other
/// records by id (for self-reference, A↔B cycle, and fan-out scenarios,
/// which all need a real [`persist_uuid::RecordId`] assigned by a store
/// before the edge can be drawn).
#[derive(Debug, Clone, Default)]
pub struct GraphNode {
    name: String,
    child: Option<Box<GraphNode>>,
    refs: Vec<RecordId>,
    uuid: Option<RecordId>,
}

impl GraphNode {
    /// A childless, reference-less node.
    #[must_use]
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A chain of `depth` nested nodes, each embedding the next as its
    /// `child`
    #[must_use]
    pub fn chain(depth: usize) -> Self {
        let mut node = Self::leaf(format!("depth-{depth}"));
        if depth > 0 {
            node.child = Some(Box::new(Self::chain(depth - 1)));
        }
        node
    }

    /// This node, pointing at `refs` by id. Used to wire up a
    /// self-reference (`refs == [self_id]`), an A↔B cycle (two nodes each
    /// referencing the other's id), or a fan-out (one node referencing
    /// many others), once every participant has already been stored once
    /// and its id is known.
    #[must_use]
    pub fn with_refs(name: impl Into<String>, refs: Vec<RecordId>) -> Self {
        Self {
            name: name.into(),
            refs,
            ..Self::default()
        }
    }
}

impl Instantiate for GraphNode {
    fn instantiate_uninitialized() -> Self {
        Self::default()
    }
}

impl FieldAccess for GraphNode {
    fn class_name(&self) -> &'static str {
        "GraphNode"
    }

    fn field_names(&self) -> &'static [&'static str] {
        &["child", "name", "refs"]
    }

    fn declared_type(&self, name: &str) -> Option<FieldType> {
        match name {
            "name" => Some(FieldType::Scalar(ScalarKind::Str)),
            "child" => Some(FieldType::Concrete),
            "refs" => Some(FieldType::Container),
            _ => None,
        }
    }

    fn is_initialized(&self, name: &str) -> bool {
        match name {
            "name" => true,
            "child" => self.child.is_some(),
            "refs" => !self.refs.is_empty(),
            _ => false,
        }
    }

    fn get_field(&self, name: &str) -> Result<FieldValue, ReflectError> {
        match name {
            "name" => Ok(FieldValue::Str(self.name.clone())),
            "child" => Ok(self
                .child
                .as_ref()
                .map_or(FieldValue::Null, |child| FieldValue::Composite(Box::new((**child).clone())))),
            "refs" => Ok(FieldValue::Array(self.refs.iter().copied().map(FieldValue::Unresolved).collect())),
            other => Err(ReflectError::UnknownField(other.to_owned(), "GraphNode")),
        }
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), ReflectError> {
        match (name, value) {
            ("name", FieldValue::Str(s)) => {
                self.name = s;
                Ok(())
            }
            ("child", FieldValue::Composite(boxed)) => {
                let concrete =
                    boxed.into_any_box().downcast::<Self>().map_err(|_| ReflectError::WrongShape("child".to_owned()))?;
                self.child = Some(concrete);
                Ok(())
            }
            ("child", FieldValue::Null) => {
                self.child = None;
                Ok(())
            }
            ("refs", FieldValue::Array(items)) => {
                self.refs = items
                    .into_iter()
                    .map(|item| match item {
                        FieldValue::Unresolved(id) => Ok(id),
                        _ => Err(ReflectError::WrongShape("refs".to_owned())),
                    })
                    .collect::<Result<_, _>>()?;
                Ok(())
            }
            (other, _) => Err(ReflectError::UnknownField(other.to_owned(), "GraphNode")),
        }
    }

    fn unset_field(&mut self, name: &str) -> Result<(), ReflectError> {
        match name {
            "name" => {
                self.name.clear();
                Ok(())
            }
            "child" => {
                self.child = None;
                Ok(())
            }
            "refs" => {
                self.refs.clear();
                Ok(())
            }
            other => Err(ReflectError::UnknownField(other.to_owned(), "GraphNode")),
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
        self.uuid
    }

    fn set_record_id(&mut self, id: RecordId) {
        self.uuid = Some(id);
    }
}
