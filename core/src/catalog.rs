//! Endpoint and object catalogs.
//!
//! # Design
//! Both catalogs are declarative JSON, parsed once and shared read-only
//! behind `Arc`. The built-in tables are embedded with `include_str!` and
//! memoized in a `LazyLock`, including their load error, so a broken table
//! fails every client build the same way.
//!
//! Subtype declarations are checked when the object catalog is loaded: a
//! declaration that is neither a type name nor a field-to-type map is a
//! `CatalogError::MalformedSubtypes`. Unknown type names are only detected
//! when the tagger reaches them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CatalogError;
use crate::http::HttpMethod;
use crate::validate::RuleSetDecl;

/// Name of the type forced onto any response carrying an `errors` field.
pub const ERROR_TYPE: &str = "error";

static BUILTIN_ENDPOINTS: LazyLock<Result<Arc<EndpointCatalog>, CatalogError>> =
    LazyLock::new(|| {
        EndpointCatalog::from_json_str(include_str!("../catalog/endpoints.json")).map(Arc::new)
    });

static BUILTIN_TYPES: LazyLock<Result<Arc<TypeCatalog>, CatalogError>> = LazyLock::new(|| {
    TypeCatalog::from_json_str(include_str!("../catalog/objects.json")).map(Arc::new)
});

/// One declared remote operation, as written in the catalog.
///
/// `method` and `path` are optional here so that a malformed entry can be
/// loaded and reported when the endpoint is first used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointDecl {
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub args: RuleSetDecl,
    #[serde(default, rename = "type")]
    pub result_type: Option<String>,
    #[serde(default)]
    pub multipart: bool,
    #[serde(default)]
    pub defaults: Map<String, Value>,
    #[serde(default)]
    pub stream: bool,
}

/// Immutable endpoint table keyed by endpoint name.
#[derive(Debug, Clone, Default)]
pub struct EndpointCatalog {
    entries: HashMap<String, EndpointDecl>,
}

impl EndpointCatalog {
    /// The embedded catalog shipped with the crate.
    pub fn builtin() -> Result<Arc<Self>, CatalogError> {
        BUILTIN_ENDPOINTS.clone()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let entries: HashMap<String, EndpointDecl> =
            serde_json::from_str(raw).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Ok(Self { entries })
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, EndpointDecl)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&EndpointDecl> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Behavioural family of an object type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    #[default]
    Plain,
    /// Paginated listing exposing `next_cursor` / `previous_cursor`.
    Cursor,
    /// API-level error body.
    Error,
}

/// How a type's children are tagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subtypes {
    /// No recursion.
    Leaf,
    /// Every element of the (array) value gets this type.
    Each(String),
    /// Listed fields get their declared type.
    Fields(BTreeMap<String, String>),
}

impl Subtypes {
    fn from_json(type_name: &str, raw: &Value) -> Result<Self, CatalogError> {
        match raw {
            Value::Null => Ok(Subtypes::Leaf),
            Value::String(name) => Ok(Subtypes::Each(name.clone())),
            Value::Object(fields) => fields
                .iter()
                .map(|(field, sub)| match sub {
                    Value::String(name) => Ok((field.clone(), name.clone())),
                    _ => Err(CatalogError::MalformedSubtypes {
                        type_name: type_name.to_string(),
                    }),
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Subtypes::Fields),
            _ => Err(CatalogError::MalformedSubtypes {
                type_name: type_name.to_string(),
            }),
        }
    }
}

/// An object type: its tag, family, and subtype declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDecl {
    pub name: Arc<str>,
    pub kind: ObjectKind,
    pub subtypes: Subtypes,
}

#[derive(Deserialize)]
struct RawTypeDecl {
    #[serde(default)]
    kind: ObjectKind,
    #[serde(default)]
    subtypes: Value,
}

/// Immutable object-type table keyed by type name. Always contains the
/// built-in `error` type.
#[derive(Debug, Clone)]
pub struct TypeCatalog {
    types: HashMap<String, Arc<TypeDecl>>,
}

impl TypeCatalog {
    /// The embedded catalog shipped with the crate.
    pub fn builtin() -> Result<Arc<Self>, CatalogError> {
        BUILTIN_TYPES.clone()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let decls: HashMap<String, RawTypeDecl> =
            serde_json::from_str(raw).map_err(|e| CatalogError::Parse(e.to_string()))?;
        let types = decls
            .into_iter()
            .map(|(name, raw)| {
                let subtypes = Subtypes::from_json(&name, &raw.subtypes)?;
                Ok(TypeDecl {
                    name: Arc::from(name.as_str()),
                    kind: raw.kind,
                    subtypes,
                })
            })
            .collect::<Result<Vec<_>, CatalogError>>()?;
        Ok(Self::from_decls(types))
    }

    pub fn from_decls(decls: impl IntoIterator<Item = TypeDecl>) -> Self {
        let mut types: HashMap<String, Arc<TypeDecl>> = decls
            .into_iter()
            .map(|decl| (decl.name.to_string(), Arc::new(decl)))
            .collect();
        types.entry(ERROR_TYPE.to_string()).or_insert_with(|| {
            Arc::new(TypeDecl {
                name: Arc::from(ERROR_TYPE),
                kind: ObjectKind::Error,
                subtypes: Subtypes::Leaf,
            })
        });
        Self { types }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TypeDecl>> {
        self.types.get(name)
    }

    /// Like `get`, but an unknown name is a catalog error.
    pub fn resolve(&self, name: &str) -> Result<&Arc<TypeDecl>, CatalogError> {
        self.types
            .get(name)
            .ok_or_else(|| CatalogError::UnknownType(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalogs_load() {
        let endpoints = EndpointCatalog::builtin().unwrap();
        assert!(endpoints.get("get_followers").is_some());
        let types = TypeCatalog::builtin().unwrap();
        assert_eq!(types.resolve("user_cursor").unwrap().kind, ObjectKind::Cursor);
    }

    #[test]
    fn builtin_endpoint_types_exist() {
        let endpoints = EndpointCatalog::builtin().unwrap();
        let types = TypeCatalog::builtin().unwrap();
        for name in endpoints.names() {
            if let Some(ty) = &endpoints.get(name).unwrap().result_type {
                assert!(types.get(ty).is_some(), "{name}: unknown type {ty}");
            }
        }
    }

    #[test]
    fn subtype_forms_are_parsed() {
        let types = TypeCatalog::from_json_str(
            r#"{
                "user": {},
                "user_list": {"subtypes": "user"},
                "user_cursor": {"kind": "cursor", "subtypes": {"users": "user_list"}}
            }"#,
        )
        .unwrap();
        assert_eq!(types.resolve("user").unwrap().subtypes, Subtypes::Leaf);
        assert_eq!(
            types.resolve("user_list").unwrap().subtypes,
            Subtypes::Each("user".to_string())
        );
        assert_eq!(
            types.resolve("user_cursor").unwrap().subtypes,
            Subtypes::Fields(BTreeMap::from([(
                "users".to_string(),
                "user_list".to_string()
            )]))
        );
    }

    #[test]
    fn error_type_is_always_present() {
        let types = TypeCatalog::from_json_str("{}").unwrap();
        assert_eq!(types.resolve(ERROR_TYPE).unwrap().kind, ObjectKind::Error);
    }

    #[test]
    fn malformed_subtypes_are_rejected() {
        let err = TypeCatalog::from_json_str(r#"{"broken": {"subtypes": 7}}"#).unwrap_err();
        assert_eq!(
            err,
            CatalogError::MalformedSubtypes {
                type_name: "broken".to_string()
            }
        );
        let err =
            TypeCatalog::from_json_str(r#"{"broken": {"subtypes": {"a": ["x"]}}}"#).unwrap_err();
        assert!(matches!(err, CatalogError::MalformedSubtypes { .. }));
    }

    #[test]
    fn unknown_type_is_reported() {
        let types = TypeCatalog::from_json_str("{}").unwrap();
        assert_eq!(
            types.resolve("tweet").unwrap_err(),
            CatalogError::UnknownType("tweet".to_string())
        );
    }

    #[test]
    fn endpoint_without_method_still_loads() {
        let catalog = EndpointCatalog::from_json_str(r#"{"half": {"path": "x"}}"#).unwrap();
        assert!(catalog.get("half").unwrap().method.is_none());
    }
}
