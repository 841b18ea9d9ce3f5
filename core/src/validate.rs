//! Argument validation and coercion against per-endpoint rule sets.
//!
//! # Design
//! A `RuleSet` is two disjoint maps (required, optional) from argument name
//! to `ArgKind`. Validation checks required names first, then coerces every
//! non-internal argument through its kind. Coercion is a pure function that
//! returns `None` for values outside the kind's domain; the validator turns
//! that into `ValidationError::InvalidValue`.
//!
//! Coerced values replace the raw ones in the output map. List kinds collapse
//! to a single comma-joined string, which re-validates to itself unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::args::{ArgValue, Args};
use crate::error::{CatalogError, ValidationError};

/// Names starting with this prefix are dispatcher options, never API
/// parameters.
pub const INTERNAL_PREFIX: char = '_';

static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?[0-9]+$").unwrap());
static INTEGER_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ \t]*-?[0-9]+([ \t]*,[ \t]*-?[0-9]+)*[ \t]*$").unwrap());
static STRING_LIST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^,]+(,[^,]+)*$").unwrap());
static BASE64: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+/]*={0,2}$").unwrap());

pub fn is_internal(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX)
}

/// Target representation of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    Any,
    Boolean,
    Integer,
    Number,
    String,
    IntegerList,
    StringList,
    Date,
    Base64,
    File,
    Table,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ArgKind::Any => "any",
            ArgKind::Boolean => "boolean",
            ArgKind::Integer => "integer",
            ArgKind::Number => "number",
            ArgKind::String => "string",
            ArgKind::IntegerList => "integer_list",
            ArgKind::StringList => "string_list",
            ArgKind::Date => "date",
            ArgKind::Base64 => "base64",
            ArgKind::File => "file",
            ArgKind::Table => "table",
        };
        f.write_str(label)
    }
}

/// Rule set as written in a catalog: two maps of name to kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSetDecl {
    #[serde(default)]
    pub required: BTreeMap<String, ArgKind>,
    #[serde(default)]
    pub optional: BTreeMap<String, ArgKind>,
}

/// Validated rule set. Every name appears in exactly one of the two maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    required: BTreeMap<String, ArgKind>,
    optional: BTreeMap<String, ArgKind>,
}

impl RuleSet {
    pub fn new(
        endpoint: &str,
        required: BTreeMap<String, ArgKind>,
        optional: BTreeMap<String, ArgKind>,
    ) -> Result<Self, CatalogError> {
        if let Some(name) = required.keys().find(|name| optional.contains_key(*name)) {
            return Err(CatalogError::DuplicateRule {
                endpoint: endpoint.to_string(),
                name: name.clone(),
            });
        }
        Ok(Self { required, optional })
    }

    pub fn from_decl(endpoint: &str, decl: &RuleSetDecl) -> Result<Self, CatalogError> {
        Self::new(endpoint, decl.required.clone(), decl.optional.clone())
    }

    /// Kind for `name`; optional rules are consulted first.
    pub fn kind_of(&self, name: &str) -> Option<ArgKind> {
        self.optional
            .get(name)
            .or_else(|| self.required.get(name))
            .copied()
    }

    pub fn required_names(&self) -> Vec<String> {
        self.required.keys().cloned().collect()
    }

    /// All recognised names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .required
            .keys()
            .chain(self.optional.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Validate and coerce `args` for `endpoint`.
///
/// `defaults` only counts toward required-argument presence; merging happens
/// in the request builder. Internal (`_`-prefixed) keys are copied through
/// untouched.
pub fn validate(
    args: &Args,
    rules: &RuleSet,
    endpoint: &str,
    defaults: &Args,
) -> Result<Args, ValidationError> {
    let missing: Vec<String> = rules
        .required
        .keys()
        .filter(|name| !args.contains_key(*name) && !defaults.contains_key(*name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingRequired {
            endpoint: endpoint.to_string(),
            missing,
            required: rules.required_names(),
        });
    }

    let mut coerced = Args::new();
    for (name, value) in args {
        if is_internal(name) {
            coerced.insert(name.clone(), value.clone());
            continue;
        }
        let kind = rules
            .kind_of(name)
            .ok_or_else(|| ValidationError::UnknownArgument {
                endpoint: endpoint.to_string(),
                name: name.clone(),
                valid: rules.names(),
            })?;
        let value = coerce(kind, value).ok_or_else(|| ValidationError::InvalidValue {
            endpoint: endpoint.to_string(),
            name: name.clone(),
            kind,
        })?;
        coerced.insert(name.clone(), value);
    }
    Ok(coerced)
}

/// Coerce a single value to `kind`. `None` means the value is outside the
/// kind's domain.
pub fn coerce(kind: ArgKind, value: &ArgValue) -> Option<ArgValue> {
    match kind {
        ArgKind::Any => Some(value.clone()),
        ArgKind::Boolean => to_bool(value).map(ArgValue::Bool),
        ArgKind::Integer => to_integer(value),
        ArgKind::Number => match value {
            ArgValue::Int(_) => Some(value.clone()),
            ArgValue::Float(f) if f.is_finite() => Some(value.clone()),
            ArgValue::Str(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(ArgValue::Float),
            _ => None,
        },
        ArgKind::String => match value {
            ArgValue::Str(_) => Some(value.clone()),
            ArgValue::Int(n) => Some(ArgValue::Str(n.to_string())),
            ArgValue::Float(f) => Some(ArgValue::Str(f.to_string())),
            _ => None,
        },
        ArgKind::IntegerList => match value {
            ArgValue::List(items) => join_list(items, |item| match to_integer(item)? {
                ArgValue::Int(n) => Some(n.to_string()),
                ArgValue::Str(s) => Some(s),
                _ => None,
            }),
            ArgValue::Str(s) if INTEGER_LIST.is_match(s) => Some(value.clone()),
            ArgValue::Int(n) => Some(ArgValue::Str(n.to_string())),
            _ => None,
        },
        ArgKind::StringList => match value {
            ArgValue::List(items) => join_list(items, |item| match item {
                ArgValue::Str(s) if !s.is_empty() && !s.contains(',') => Some(s.clone()),
                ArgValue::Int(n) => Some(n.to_string()),
                _ => None,
            }),
            ArgValue::Str(s) if STRING_LIST.is_match(s) => Some(value.clone()),
            ArgValue::Int(n) => Some(ArgValue::Str(n.to_string())),
            _ => None,
        },
        ArgKind::Date => match value {
            ArgValue::Str(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|date| ArgValue::Str(date.format("%Y-%m-%d").to_string())),
            ArgValue::Int(secs) => DateTime::from_timestamp(*secs, 0)
                .map(|at| ArgValue::Str(at.format("%Y-%m-%d").to_string())),
            _ => None,
        },
        ArgKind::Base64 => match value {
            ArgValue::Str(s) if s.len() % 4 == 0 && BASE64.is_match(s) => Some(value.clone()),
            _ => None,
        },
        ArgKind::File => match value {
            ArgValue::File(file) if !file.filename.is_empty() && file.is_header_safe() => {
                Some(value.clone())
            }
            _ => None,
        },
        ArgKind::Table => match value {
            ArgValue::Table(_) => Some(value.clone()),
            _ => None,
        },
    }
}

fn to_bool(value: &ArgValue) -> Option<bool> {
    match value {
        ArgValue::Bool(b) => Some(*b),
        ArgValue::Int(0) => Some(false),
        ArgValue::Int(1) => Some(true),
        ArgValue::Str(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_integer(value: &ArgValue) -> Option<ArgValue> {
    match value {
        ArgValue::Int(_) => Some(value.clone()),
        ArgValue::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
            Some(ArgValue::Int(*f as i64))
        }
        ArgValue::Str(s) if INTEGER.is_match(s) => Some(value.clone()),
        _ => None,
    }
}

fn join_list(items: &[ArgValue], render: impl Fn(&ArgValue) -> Option<String>) -> Option<ArgValue> {
    if items.is_empty() {
        return None;
    }
    let parts = items.iter().map(render).collect::<Option<Vec<_>>>()?;
    Some(ArgValue::Str(parts.join(",")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Attachment;

    fn rules() -> RuleSet {
        RuleSet::new(
            "get_users",
            BTreeMap::from([("user_id".to_string(), ArgKind::IntegerList)]),
            BTreeMap::from([
                ("include_entities".to_string(), ArgKind::Boolean),
                ("screen_name".to_string(), ArgKind::StringList),
            ]),
        )
        .unwrap()
    }

    #[test]
    fn missing_required_argument_is_rejected() {
        let err = validate(&crate::args! { "include_entities" => true }, &rules(), "get_users", &Args::new())
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingRequired {
                endpoint: "get_users".to_string(),
                missing: vec!["user_id".to_string()],
                required: vec!["user_id".to_string()],
            }
        );
    }

    #[test]
    fn default_satisfies_required_argument() {
        let defaults = crate::args! { "user_id" => "12" };
        let out = validate(&Args::new(), &rules(), "get_users", &defaults).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_argument_lists_valid_names() {
        let err = validate(
            &crate::args! { "user_id" => 1, "bogus" => 1 },
            &rules(),
            "get_users",
            &Args::new(),
        )
        .unwrap_err();
        match err {
            ValidationError::UnknownArgument { name, valid, .. } => {
                assert_eq!(name, "bogus");
                assert_eq!(valid, vec!["include_entities", "screen_name", "user_id"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn invalid_value_names_argument_and_kind() {
        let err = validate(
            &crate::args! { "user_id" => 1, "include_entities" => "maybe" },
            &rules(),
            "get_users",
            &Args::new(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidValue {
                endpoint: "get_users".to_string(),
                name: "include_entities".to_string(),
                kind: ArgKind::Boolean,
            }
        );
    }

    #[test]
    fn internal_options_bypass_validation() {
        let out = validate(
            &crate::args! { "user_id" => 1, "_async" => true, "_anything" => vec![1.5] },
            &rules(),
            "get_users",
            &Args::new(),
        )
        .unwrap();
        assert_eq!(out["_async"], ArgValue::Bool(true));
        assert_eq!(out["_anything"], ArgValue::List(vec![ArgValue::Float(1.5)]));
    }

    #[test]
    fn integer_list_joins_and_is_idempotent() {
        let joined = coerce(ArgKind::IntegerList, &ArgValue::from(vec![1, 2, 3])).unwrap();
        assert_eq!(joined, ArgValue::Str("1,2,3".to_string()));
        let again = coerce(ArgKind::IntegerList, &joined).unwrap();
        assert_eq!(again, joined);
    }

    #[test]
    fn integer_list_accepts_scalar_and_rejects_words() {
        assert_eq!(
            coerce(ArgKind::IntegerList, &ArgValue::Int(7)),
            Some(ArgValue::Str("7".to_string()))
        );
        assert_eq!(coerce(ArgKind::IntegerList, &ArgValue::from("1,a,3")), None);
        assert_eq!(coerce(ArgKind::IntegerList, &ArgValue::List(vec![])), None);
    }

    #[test]
    fn string_list_joins_names() {
        let joined = coerce(ArgKind::StringList, &ArgValue::from(vec!["jack", "biz"])).unwrap();
        assert_eq!(joined, ArgValue::Str("jack,biz".to_string()));
        assert_eq!(coerce(ArgKind::StringList, &joined), Some(joined.clone()));
        assert_eq!(coerce(ArgKind::StringList, &ArgValue::from("a,,b")), None);
    }

    #[test]
    fn integer_accepts_numeric_strings_and_integral_floats() {
        assert_eq!(
            coerce(ArgKind::Integer, &ArgValue::from("9007199254740993")),
            Some(ArgValue::Str("9007199254740993".to_string()))
        );
        assert_eq!(coerce(ArgKind::Integer, &ArgValue::Float(3.0)), Some(ArgValue::Int(3)));
        assert_eq!(coerce(ArgKind::Integer, &ArgValue::Float(3.5)), None);
        assert_eq!(coerce(ArgKind::Integer, &ArgValue::from("12a")), None);
    }

    #[test]
    fn integers_are_ascii_digits_only() {
        assert_eq!(coerce(ArgKind::Integer, &ArgValue::from("١٢٣")), None);
        assert_eq!(coerce(ArgKind::Integer, &ArgValue::from("１２")), None);
        assert_eq!(coerce(ArgKind::IntegerList, &ArgValue::from("١,٢")), None);
        assert_eq!(
            coerce(ArgKind::IntegerList, &ArgValue::from("1, 2")),
            Some(ArgValue::from("1, 2"))
        );
    }

    #[test]
    fn number_rejects_non_finite_values() {
        for text in ["NaN", "inf", "-infinity"] {
            assert_eq!(coerce(ArgKind::Number, &ArgValue::from(text)), None, "{text}");
        }
        assert_eq!(coerce(ArgKind::Number, &ArgValue::Float(f64::NAN)), None);
        assert_eq!(coerce(ArgKind::Number, &ArgValue::from(" 1.5")), Some(ArgValue::Float(1.5)));
    }

    #[test]
    fn boolean_accepts_flags() {
        assert_eq!(coerce(ArgKind::Boolean, &ArgValue::from("1")), Some(ArgValue::Bool(true)));
        assert_eq!(coerce(ArgKind::Boolean, &ArgValue::Int(0)), Some(ArgValue::Bool(false)));
        assert_eq!(coerce(ArgKind::Boolean, &ArgValue::Int(2)), None);
    }

    #[test]
    fn date_accepts_iso_and_timestamps() {
        assert_eq!(
            coerce(ArgKind::Date, &ArgValue::from("2014-02-28")),
            Some(ArgValue::Str("2014-02-28".to_string()))
        );
        assert_eq!(coerce(ArgKind::Date, &ArgValue::from("2014-02-30")), None);
        assert_eq!(
            coerce(ArgKind::Date, &ArgValue::Int(0)),
            Some(ArgValue::Str("1970-01-01".to_string()))
        );
    }

    #[test]
    fn base64_checks_length_and_alphabet() {
        assert!(coerce(ArgKind::Base64, &ArgValue::from("aGVsbG8=")).is_some());
        assert!(coerce(ArgKind::Base64, &ArgValue::from("aGVsbG8")).is_none());
        assert!(coerce(ArgKind::Base64, &ArgValue::from("aGV$bG8=")).is_none());
    }

    #[test]
    fn file_requires_attachment() {
        let file = ArgValue::File(Attachment::new("cat.png", vec![0x89, 0x50]));
        assert_eq!(coerce(ArgKind::File, &file), Some(file.clone()));
        assert_eq!(coerce(ArgKind::File, &ArgValue::from("cat.png")), None);
        let unnamed = ArgValue::File(Attachment::new("", vec![1]));
        assert_eq!(coerce(ArgKind::File, &unnamed), None);
        let split = ArgValue::File(Attachment::new("a.png\r\nX-Injected: 1", vec![1]));
        assert_eq!(coerce(ArgKind::File, &split), None);
        let typed = Attachment::new("a.png", vec![1]).with_content_type("image/png\nX: 1");
        assert_eq!(coerce(ArgKind::File, &ArgValue::File(typed)), None);
    }

    #[test]
    fn duplicate_rule_is_a_catalog_error() {
        let err = RuleSet::new(
            "show",
            BTreeMap::from([("id".to_string(), ArgKind::Integer)]),
            BTreeMap::from([("id".to_string(), ArgKind::String)]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            CatalogError::DuplicateRule {
                endpoint: "show".to_string(),
                name: "id".to_string(),
            }
        );
    }
}
