//! Decoded JSON annotated with object-type tags.
//!
//! # Design
//! A `Node` mirrors a JSON value; arrays and objects may carry a tag naming
//! their object type. Tagging walks the whole subtree depth-first before the
//! node is handed out, following the type's subtype declaration. Tags are
//! stable: a node that already carries a different tag keeps it and is not
//! descended into, so tagging twice with the same type changes nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::catalog::{Subtypes, TypeCatalog, ERROR_TYPE};
use crate::error::{CatalogError, Error};

/// Body of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    /// Null, bool, number or string.
    Scalar(Value),
    Array(Vec<Node>),
    Object(BTreeMap<String, Node>),
}

/// A JSON value that may carry an object-type tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    tag: Option<Arc<str>>,
    value: NodeValue,
}

impl Node {
    /// Untagged tree built from `value`.
    pub fn from_json(value: Value) -> Self {
        let value = match value {
            Value::Array(items) => NodeValue::Array(items.into_iter().map(Node::from_json).collect()),
            Value::Object(map) => NodeValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Node::from_json(v)))
                    .collect(),
            ),
            scalar => NodeValue::Scalar(scalar),
        };
        Self { tag: None, value }
    }

    /// Plain JSON copy, tags dropped.
    pub fn to_json(&self) -> Value {
        match &self.value {
            NodeValue::Scalar(v) => v.clone(),
            NodeValue::Array(items) => Value::Array(items.iter().map(Node::to_json).collect()),
            NodeValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn value(&self) -> &NodeValue {
        &self.value
    }

    pub fn is_structured(&self) -> bool {
        !matches!(self.value, NodeValue::Scalar(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, NodeValue::Scalar(Value::Null))
    }

    /// Field of an object node.
    pub fn get(&self, key: &str) -> Option<&Node> {
        match &self.value {
            NodeValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Element of an array node.
    pub fn at(&self, index: usize) -> Option<&Node> {
        match &self.value {
            NodeValue::Array(items) => items.get(index),
            _ => None,
        }
    }

    /// Elements of an array node; empty for anything else.
    pub fn items(&self) -> &[Node] {
        match &self.value {
            NodeValue::Array(items) => items,
            _ => &[],
        }
    }

    /// Fields of an object node.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Node)> {
        let map = match &self.value {
            NodeValue::Object(map) => Some(map),
            _ => None,
        };
        map.into_iter()
            .flat_map(|m| m.iter().map(|(k, v)| (k.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        match &self.value {
            NodeValue::Array(items) => items.len(),
            NodeValue::Object(map) => map.len(),
            NodeValue::Scalar(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            NodeValue::Scalar(v) => v.as_str(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            NodeValue::Scalar(v) => v.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match &self.value {
            NodeValue::Scalar(v) => v.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            NodeValue::Scalar(v) => v.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.value {
            NodeValue::Scalar(v) => v.as_bool(),
            _ => None,
        }
    }
}

/// Tag `node` as `type_name` and recurse through its subtype declaration.
pub fn tag(mut node: Node, type_name: &str, catalog: &TypeCatalog) -> Result<Node, CatalogError> {
    tag_in_place(&mut node, type_name, catalog)?;
    Ok(node)
}

/// In-place variant of [`tag`].
pub fn tag_in_place(node: &mut Node, type_name: &str, catalog: &TypeCatalog) -> Result<(), CatalogError> {
    let decl = catalog.resolve(type_name)?;
    if !node.is_structured() {
        return Ok(());
    }
    match &node.tag {
        Some(existing) if existing.as_ref() != type_name => {
            tracing::trace!(existing = %existing, requested = type_name, "keeping existing tag");
            return Ok(());
        }
        Some(_) => {}
        None => node.tag = Some(Arc::clone(&decl.name)),
    }

    match (&decl.subtypes, &mut node.value) {
        (Subtypes::Leaf, _) => {}
        (Subtypes::Each(sub), NodeValue::Array(items)) => {
            for item in items {
                tag_in_place(item, sub, catalog)?;
            }
        }
        (Subtypes::Fields(fields), NodeValue::Object(map)) => {
            for (field, sub) in fields {
                if let Some(child) = map.get_mut(field) {
                    if !child.is_null() {
                        tag_in_place(child, sub, catalog)?;
                    }
                }
            }
        }
        // Shape does not match the declaration (e.g. an object where a list
        // was declared): nothing to descend into.
        _ => {}
    }
    Ok(())
}

/// Type a decoded value should be tagged with: the built-in error type when
/// it is an object carrying `errors`, otherwise the declared type.
pub fn effective_type<'a>(value: &Value, declared: Option<&'a str>) -> Option<&'a str> {
    match value {
        Value::Object(map) if map.contains_key("errors") => Some(ERROR_TYPE),
        _ => declared,
    }
}

/// Parse `body` as JSON and tag it with its effective type.
pub fn decode(body: &str, declared: Option<&str>, catalog: &TypeCatalog) -> Result<Node, Error> {
    let value: Value = serde_json::from_str(body).map_err(|source| Error::Decode {
        source,
        body: body.to_string(),
    })?;
    decode_value(value, declared, catalog)
}

/// Tag an already-parsed value with its effective type.
pub fn decode_value(value: Value, declared: Option<&str>, catalog: &TypeCatalog) -> Result<Node, Error> {
    let ty = effective_type(&value, declared);
    let node = Node::from_json(value);
    match ty {
        Some(ty) => tag(node, ty, catalog).map_err(|err| {
            tracing::error!(error = %err, "object catalog defect while tagging");
            Error::Catalog(err)
        }),
        None => Ok(node),
    }
}
