//! Request construction from an endpoint template and coerced arguments.
//!
//! # Design
//! `build` is pure: defaults are overlaid with the caller's arguments, `:name`
//! placeholders in the path are replaced (and removed from the parameter
//! map), and whatever remains becomes form parameters or a multipart body.
//! A placeholder with no value means the catalog and its rules disagree, so
//! it is reported as a `CatalogError`, not a validation error.

use std::sync::LazyLock;

use regex::Regex;

use crate::args::{ArgValue, Args, Attachment};
use crate::error::CatalogError;
use crate::http::{Body, HttpMethod, HttpRequest};
use crate::validate::is_internal;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// The static half of a request: everything except the call's arguments.
#[derive(Debug, Clone, Copy)]
pub struct RequestTemplate<'a> {
    pub method: HttpMethod,
    pub path: &'a str,
    pub defaults: &'a Args,
    pub multipart: bool,
}

/// Defaults overlaid with every non-internal argument.
pub fn merge_args(defaults: &Args, args: &Args) -> Args {
    let mut merged = defaults.clone();
    for (name, value) in args {
        if !is_internal(name) {
            merged.insert(name.clone(), value.clone());
        }
    }
    merged
}

/// Build the concrete request for `template` under `base_url`, appending
/// `suffix` (e.g. `.json`) to the substituted path.
pub fn build(
    base_url: &str,
    suffix: &str,
    template: &RequestTemplate<'_>,
    args: &Args,
) -> Result<HttpRequest, CatalogError> {
    let mut params = merge_args(template.defaults, args);
    let path = substitute_path(template.path, &mut params)?;
    let url = format!(
        "{}/{}{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/'),
        suffix
    );

    let body = if template.multipart {
        encode_multipart(&params, &new_boundary())?
    } else if params.is_empty() {
        Body::Empty
    } else {
        Body::Form(
            params
                .iter()
                .map(|(name, value)| Ok((name.clone(), render_value(name, value)?)))
                .collect::<Result<Vec<_>, CatalogError>>()?,
        )
    };

    Ok(HttpRequest {
        method: template.method,
        url,
        headers: Vec::new(),
        body,
    })
}

/// Replace every `:name` token with its percent-encoded value, consuming the
/// value from `params`.
pub fn substitute_path(path: &str, params: &mut Args) -> Result<String, CatalogError> {
    let mut out = String::with_capacity(path.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(path) {
        let (Some(whole), Some(token)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = params
            .remove(token.as_str())
            .ok_or_else(|| CatalogError::MissingPathToken {
                path: path.to_string(),
                token: token.as_str().to_string(),
            })?;
        out.push_str(&path[last..whole.start()]);
        out.push_str(&urlencoding::encode(&render_value(token.as_str(), &value)?));
        last = whole.end();
    }
    out.push_str(&path[last..]);
    Ok(out)
}

/// Wire form of a scalar or list value.
pub fn render_value(name: &str, value: &ArgValue) -> Result<String, CatalogError> {
    Ok(match value {
        ArgValue::Bool(b) => b.to_string(),
        ArgValue::Int(n) => n.to_string(),
        ArgValue::Float(f) => f.to_string(),
        ArgValue::Str(s) => s.clone(),
        ArgValue::List(items) => items
            .iter()
            .map(|item| render_value(name, item))
            .collect::<Result<Vec<_>, _>>()?
            .join(","),
        ArgValue::Table(_) => value.to_json().to_string(),
        ArgValue::File(_) => {
            return Err(CatalogError::UnsupportedValue {
                name: name.to_string(),
                reason: "file attachments require a multipart endpoint".to_string(),
            })
        }
    })
}

fn new_boundary() -> String {
    format!("chirp-{}", uuid::Uuid::new_v4().simple())
}

/// Encode `params` as multipart/form-data: attachments become file parts,
/// everything else a plain field.
pub fn encode_multipart(params: &Args, boundary: &str) -> Result<Body, CatalogError> {
    let mut bytes = Vec::new();
    for (name, value) in params {
        bytes.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match value {
            ArgValue::File(file) => write_file_part(&mut bytes, name, file),
            other => {
                let text = render_value(name, other)?;
                bytes.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                bytes.extend_from_slice(text.as_bytes());
            }
        }
        bytes.extend_from_slice(b"\r\n");
    }
    bytes.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(Body::Multipart {
        boundary: boundary.to_string(),
        bytes,
    })
}

fn write_file_part(bytes: &mut Vec<u8>, name: &str, file: &Attachment) {
    let content_type = file
        .content_type
        .as_deref()
        .map(header_quoted)
        .unwrap_or_else(|| "application/octet-stream".to_string());
    bytes.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{}\"\r\nContent-Type: {content_type}\r\n\r\n",
            header_quoted(&file.filename)
        )
        .as_bytes(),
    );
    bytes.extend_from_slice(&file.data);
}

/// Percent-encode the characters that would end a quoted header value or
/// the header line itself.
fn header_quoted(text: &str) -> String {
    text.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "http://localhost:3000/1.1";

    fn template<'a>(path: &'a str, method: HttpMethod, defaults: &'a Args) -> RequestTemplate<'a> {
        RequestTemplate {
            method,
            path,
            defaults,
            multipart: false,
        }
    }

    #[test]
    fn placeholder_is_substituted_and_consumed() {
        let defaults = Args::new();
        let req = build(
            BASE,
            "",
            &template("users/:id", HttpMethod::Get, &defaults),
            &crate::args! { "id" => "42", "foo" => "bar" },
        )
        .unwrap();
        assert!(req.url.ends_with("users/42"));
        assert_eq!(req.body, Body::Form(vec![("foo".to_string(), "bar".to_string())]));
    }

    #[test]
    fn missing_placeholder_names_token() {
        let defaults = Args::new();
        let err = build(
            BASE,
            "",
            &template("users/:id", HttpMethod::Get, &defaults),
            &crate::args! { "foo" => "bar" },
        )
        .unwrap_err();
        assert_eq!(
            err,
            CatalogError::MissingPathToken {
                path: "users/:id".to_string(),
                token: "id".to_string(),
            }
        );
    }

    #[test]
    fn suffix_and_base_are_joined() {
        let defaults = Args::new();
        let req = build(
            "http://localhost:3000/1.1/",
            ".json",
            &template("statuses/show/:id", HttpMethod::Get, &defaults),
            &crate::args! { "id" => 20 },
        )
        .unwrap();
        assert_eq!(req.url, "http://localhost:3000/1.1/statuses/show/20.json");
        assert_eq!(req.body, Body::Empty);
    }

    #[test]
    fn arguments_override_defaults() {
        let defaults = crate::args! { "cursor" => -1, "stringify_ids" => true };
        let req = build(
            BASE,
            ".json",
            &template("followers/ids", HttpMethod::Get, &defaults),
            &crate::args! { "cursor" => 1500, "_async" => true },
        )
        .unwrap();
        assert_eq!(
            req.body,
            Body::Form(vec![
                ("cursor".to_string(), "1500".to_string()),
                ("stringify_ids".to_string(), "true".to_string()),
            ])
        );
    }

    #[test]
    fn placeholder_values_are_percent_encoded() {
        let mut params = crate::args! { "name" => "a b/c" };
        let path = substitute_path("lists/:name/members", &mut params).unwrap();
        assert_eq!(path, "lists/a%20b%2Fc/members");
        assert!(params.is_empty());
    }

    #[test]
    fn file_in_form_body_is_rejected() {
        let defaults = Args::new();
        let err = build(
            BASE,
            "",
            &template("media/upload", HttpMethod::Post, &defaults),
            &crate::args! { "media" => Attachment::new("a.png", vec![1]) },
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedValue { ref name, .. } if name == "media"));
    }

    #[test]
    fn multipart_emits_file_and_field_parts() {
        let params = crate::args! {
            "media" => Attachment::new("cat.png", b"PNG".to_vec()).with_content_type("image/png"),
            "additional_owners" => "7,8",
        };
        let Body::Multipart { boundary, bytes } = encode_multipart(&params, "BOUND").unwrap() else {
            panic!("expected multipart body");
        };
        assert_eq!(boundary, "BOUND");
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "--BOUND\r\n\
             Content-Disposition: form-data; name=\"additional_owners\"\r\n\r\n\
             7,8\r\n\
             --BOUND\r\n\
             Content-Disposition: form-data; name=\"media\"; filename=\"cat.png\"\r\n\
             Content-Type: image/png\r\n\r\n\
             PNG\r\n\
             --BOUND--\r\n"
        );
    }

    #[test]
    fn multipart_filename_cannot_break_the_part_header() {
        let params = crate::args! {
            "media" => Attachment::new("a\".png\r\nX-Injected: 1", b"x".to_vec())
                .with_content_type("image/png\r\nX-Other: 2"),
        };
        let Body::Multipart { bytes, .. } = encode_multipart(&params, "B").unwrap() else {
            panic!("expected multipart body");
        };
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("filename=\"a%22.png%0D%0AX-Injected: 1\"\r\n"));
        assert!(text.contains("Content-Type: image/png%0D%0AX-Other: 2\r\n"));
        assert!(!text.lines().any(|line| line.starts_with("X-")));
    }

    #[test]
    fn multipart_template_uses_generated_boundary() {
        let defaults = Args::new();
        let req = build(
            BASE,
            ".json",
            &RequestTemplate {
                method: HttpMethod::Post,
                path: "media/upload",
                defaults: &defaults,
                multipart: true,
            },
            &crate::args! { "media" => Attachment::new("a.bin", vec![0u8]) },
        )
        .unwrap();
        match req.body {
            Body::Multipart { boundary, .. } => assert!(boundary.starts_with("chirp-")),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn tables_render_as_json() {
        let value = ArgValue::Table(crate::args! { "a" => 1 });
        assert_eq!(render_value("meta", &value).unwrap(), r#"{"a":1}"#);
    }
}
