//! HTTP exchange types described as plain data.
//!
//! # Design
//! The request builder produces an `HttpRequest` without touching the network
//! and a `Transport` turns it into an `HttpResponse`. Parameters stay as
//! ordered key/value pairs until the last moment: GET and DELETE carry them in
//! the query string, POST and PUT in a form body. Multipart bodies are fully
//! encoded by the builder so a transport only ever ships bytes.
//!
//! All fields use owned types so values can move to worker threads and
//! across the C boundary without lifetime concerns.

use serde::{Deserialize, Serialize};

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether parameters travel in the query string rather than a body.
    pub fn uses_query(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Delete)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request parameters or payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Empty,
    /// Form parameters, serialized by the transport.
    Form(Vec<(String, String)>),
    /// A fully encoded multipart/form-data payload.
    Multipart { boundary: String, bytes: Vec<u8> },
}

impl Body {
    /// Form parameters, if any.
    pub fn params(&self) -> &[(String, String)] {
        match self {
            Body::Form(params) => params,
            _ => &[],
        }
    }
}

/// Percent-encode `pairs` as `k=v&k=v`.
pub fn encode_form(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// An HTTP request described as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// URL without the query string.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl HttpRequest {
    /// URL to put on the wire: form parameters of GET/DELETE requests are
    /// appended as a query string.
    pub fn target_url(&self) -> String {
        match &self.body {
            Body::Form(params) if self.method.uses_query() && !params.is_empty() => {
                format!("{}?{}", self.url, encode_form(params))
            }
            _ => self.url.clone(),
        }
    }

    /// Content type and bytes of the body to send, if the request has one.
    pub fn payload(&self) -> Option<(String, Vec<u8>)> {
        match &self.body {
            Body::Empty => None,
            Body::Form(_) if self.method.uses_query() => None,
            Body::Form(params) => Some((
                "application/x-www-form-urlencoded".to_string(),
                encode_form(params).into_bytes(),
            )),
            Body::Multipart { boundary, bytes } => Some((
                format!("multipart/form-data; boundary={boundary}"),
                bytes.clone(),
            )),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        RateLimit::from_headers(&self.headers)
    }
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Rate-limit window reported by the `x-rate-limit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    /// Unix time at which the window resets.
    pub reset: i64,
}

impl RateLimit {
    pub fn from_headers(headers: &[(String, String)]) -> Option<Self> {
        let parse = |name: &str| find_header(headers, name).map(str::trim);
        Some(Self {
            limit: parse("x-rate-limit-limit")?.parse().ok()?,
            remaining: parse("x-rate-limit-remaining")?.parse().ok()?,
            reset: parse("x-rate-limit-reset")?.parse().ok()?,
        })
    }
}
