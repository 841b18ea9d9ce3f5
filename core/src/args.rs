//! Caller-supplied argument values.
//!
//! Arguments are a flat map from name to `ArgValue`. Names starting with `_`
//! are flow-control options for the dispatcher and are never sent.

use std::collections::BTreeMap;

use serde_json::Value;

/// Argument map keyed by parameter name.
pub type Args = BTreeMap<String, ArgValue>;

/// A file payload for multipart endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Filename and content type can be written into a part header as-is.
    pub fn is_header_safe(&self) -> bool {
        let clean = |text: &str| !text.contains(['\r', '\n']);
        clean(&self.filename) && self.content_type.as_deref().is_none_or(clean)
    }
}

/// A single argument value, before or after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ArgValue>),
    File(Attachment),
    Table(BTreeMap<String, ArgValue>),
}

impl ArgValue {
    /// Truthiness of internal options such as `_async`: anything but `false`.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, ArgValue::Bool(false))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(n) => Some(*n),
            ArgValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Convert a JSON value. `null` has no argument form and yields `None`;
    /// `null` entries inside arrays and objects are skipped.
    pub fn from_json(value: &Value) -> Option<ArgValue> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(ArgValue::Bool(*b)),
            Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => Some(ArgValue::Int(i)),
                // Above i64::MAX: keep the digits exact.
                (None, Some(u)) => Some(ArgValue::Str(u.to_string())),
                (None, None) => n.as_f64().map(ArgValue::Float),
            },
            Value::String(s) => Some(ArgValue::Str(s.clone())),
            Value::Array(items) => Some(ArgValue::List(
                items.iter().filter_map(ArgValue::from_json).collect(),
            )),
            Value::Object(map) => Some(ArgValue::Table(
                map.iter()
                    .filter_map(|(k, v)| ArgValue::from_json(v).map(|v| (k.clone(), v)))
                    .collect(),
            )),
        }
    }

    /// JSON form of the value. Attachments become `{filename, size}` since
    /// their bytes have no JSON representation.
    pub fn to_json(&self) -> Value {
        match self {
            ArgValue::Bool(b) => Value::Bool(*b),
            ArgValue::Int(n) => Value::from(*n),
            ArgValue::Float(f) => Value::from(*f),
            ArgValue::Str(s) => Value::String(s.clone()),
            ArgValue::List(items) => Value::Array(items.iter().map(ArgValue::to_json).collect()),
            ArgValue::File(file) => serde_json::json!({
                "filename": file.filename,
                "size": file.data.len(),
            }),
            ArgValue::Table(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Build an `Args` map from a JSON object, skipping `null` members.
pub fn args_from_json(value: &Value) -> Option<Args> {
    match ArgValue::from_json(value)? {
        ArgValue::Table(map) => Some(map),
        _ => None,
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        ArgValue::Int(i64::from(v))
    }
}

impl From<u32> for ArgValue {
    fn from(v: u32) -> Self {
        ArgValue::Int(i64::from(v))
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl From<Attachment> for ArgValue {
    fn from(v: Attachment) -> Self {
        ArgValue::File(v)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(v: Vec<T>) -> Self {
        ArgValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Build an [`Args`] map: `args! { "screen_name" => "jack", "count" => 5 }`.
#[macro_export]
macro_rules! args {
    () => { $crate::Args::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Args::new();
        $( map.insert(::std::string::String::from($key), $crate::ArgValue::from($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_keeps_large_unsigned_ids_exact() {
        let args = args_from_json(&json!({"id": 18446744073709551615u64, "lat": 1.5})).unwrap();
        assert_eq!(args["id"], ArgValue::Str("18446744073709551615".to_string()));
        assert_eq!(args["lat"], ArgValue::Float(1.5));
        assert_eq!(
            crate::validate::coerce(crate::validate::ArgKind::Integer, &args["id"]),
            Some(ArgValue::Str("18446744073709551615".to_string()))
        );
    }

    #[test]
    fn from_json_skips_nulls() {
        let args = args_from_json(&json!({"a": 1, "b": null, "c": [1, null, "x"]})).unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args["a"], ArgValue::Int(1));
        assert_eq!(
            args["c"],
            ArgValue::List(vec![ArgValue::Int(1), ArgValue::Str("x".to_string())])
        );
    }

    #[test]
    fn non_object_json_is_not_an_argument_map() {
        assert!(args_from_json(&json!([1, 2])).is_none());
        assert!(args_from_json(&json!(null)).is_none());
    }

    #[test]
    fn args_macro_converts_values() {
        let args = crate::args! { "id" => 42, "name" => "jack", "ids" => vec![1, 2] };
        assert_eq!(args["id"], ArgValue::Int(42));
        assert_eq!(args["name"], ArgValue::Str("jack".to_string()));
        assert_eq!(args["ids"], ArgValue::List(vec![ArgValue::Int(1), ArgValue::Int(2)]));
    }

    #[test]
    fn only_false_is_falsy() {
        assert!(!ArgValue::Bool(false).is_truthy());
        assert!(ArgValue::Bool(true).is_truthy());
        assert!(ArgValue::Int(0).is_truthy());
    }

    #[test]
    fn attachment_to_json_omits_bytes() {
        let value = ArgValue::File(Attachment::new("a.png", vec![1, 2, 3]));
        assert_eq!(value.to_json(), json!({"filename": "a.png", "size": 3}));
    }
}
