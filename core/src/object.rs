//! Result objects returned by the client.
//!
//! # Design
//! Results form a closed sum: a plain tagged `Resource` or a paginated
//! `Cursor`. Type-specific behaviour lives in capability traits rather than on
//! the node itself: every result can be fetched again through `Refetch` when
//! it came from a GET call, and cursors add `Paginated` navigation on top.
//!
//! A result remembers its call as an immutable snapshot of the arguments used
//! plus a handle to the owning client, never as a live closure.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::args::{ArgValue, Args};
use crate::catalog::{ObjectKind, TypeCatalog};
use crate::client::Client;
use crate::error::Error;
use crate::http::{HttpResponse, RateLimit};
use crate::tag::{self, Node};

/// Snapshot of the call that produced a result.
#[derive(Clone)]
pub struct CallSource {
    client: Client,
    args: Arc<Args>,
}

impl CallSource {
    pub(crate) fn new(client: Client, args: Args) -> Self {
        Self {
            client,
            args: Arc::new(args),
        }
    }

    /// Arguments of the original call, defaults included.
    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Shallow merge: `overrides` replace same-named arguments.
    pub fn merged(&self, overrides: Args) -> Args {
        let mut args = (*self.args).clone();
        args.extend(overrides);
        args
    }
}

impl fmt::Debug for CallSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSource").field("args", &self.args).finish()
    }
}

/// A tagged response value with its exchange metadata.
#[derive(Debug, Clone)]
pub struct Resource {
    node: Node,
    status: u16,
    headers: Vec<(String, String)>,
    endpoint: Arc<str>,
    source: Option<CallSource>,
}

impl Resource {
    pub(crate) fn new(
        node: Node,
        status: u16,
        headers: Vec<(String, String)>,
        endpoint: Arc<str>,
        source: Option<CallSource>,
    ) -> Self {
        Self {
            node,
            status,
            headers,
            endpoint,
            source,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn into_node(self) -> Node {
        self.node
    }
}

/// A paginated listing. `0` in either direction means there is no page.
#[derive(Debug, Clone)]
pub struct Cursor {
    resource: Resource,
    next_cursor: i64,
    previous_cursor: i64,
    next_cursor_str: String,
    previous_cursor_str: String,
}

impl Cursor {
    pub(crate) fn from_resource(resource: Resource) -> Self {
        let (next_cursor, next_cursor_str) = read_cursor(&resource.node, "next_cursor");
        let (previous_cursor, previous_cursor_str) = read_cursor(&resource.node, "previous_cursor");
        Self {
            resource,
            next_cursor,
            previous_cursor,
            next_cursor_str,
            previous_cursor_str,
        }
    }

    pub fn next_cursor_str(&self) -> &str {
        &self.next_cursor_str
    }

    pub fn previous_cursor_str(&self) -> &str {
        &self.previous_cursor_str
    }

    pub fn node(&self) -> &Node {
        &self.resource.node
    }

    fn page(&self, cursor: &str) -> Result<Option<ApiObject>, Error> {
        let overrides = Args::from([("cursor".to_string(), ArgValue::Str(cursor.to_string()))]);
        self.refetch(overrides).map(Some)
    }
}

/// Numeric and string forms of a cursor field. The string form wins when both
/// are present since it is exact for 64-bit values.
fn read_cursor(node: &Node, field: &str) -> (i64, String) {
    let from_str = node
        .get(&format!("{field}_str"))
        .and_then(Node::as_str)
        .map(str::to_string);
    let number = node.get(field).and_then(Node::as_i64);
    match (number, from_str) {
        (_, Some(s)) => (s.parse().unwrap_or_else(|_| number.unwrap_or(0)), s),
        (Some(n), None) => (n, n.to_string()),
        (None, None) => (0, "0".to_string()),
    }
}

/// A decoded, tagged result.
#[derive(Debug, Clone)]
pub enum ApiObject {
    Resource(Resource),
    Cursor(Cursor),
}

impl ApiObject {
    /// Interpret a completed exchange: decode and tag the body, then turn
    /// error-typed bodies and non-2xx statuses into errors.
    pub(crate) fn from_response(
        response: HttpResponse,
        declared: Option<&str>,
        types: &TypeCatalog,
        endpoint: Arc<str>,
        source: Option<CallSource>,
    ) -> Result<ApiObject, Error> {
        let HttpResponse {
            status,
            headers,
            body,
        } = response;
        let success = (200..300).contains(&status);
        let value: Value = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(_) if !success => return Err(Error::Http { status, body, headers }),
            Err(source) => return Err(Error::Decode { source, body }),
        };
        let node = tag::decode_value(value, declared, types)?;
        let kind = node
            .tag()
            .and_then(|name| types.get(name))
            .map(|decl| decl.kind);
        if kind == Some(ObjectKind::Error) {
            return Err(ApiFailure::from_node(node, status, headers).into());
        }
        if !success {
            return Err(Error::Http { status, body, headers });
        }
        let resource = Resource::new(node, status, headers, endpoint, source);
        Ok(match kind {
            Some(ObjectKind::Cursor) => ApiObject::Cursor(Cursor::from_resource(resource)),
            _ => ApiObject::Resource(resource),
        })
    }

    fn resource(&self) -> &Resource {
        match self {
            ApiObject::Resource(r) => r,
            ApiObject::Cursor(c) => &c.resource,
        }
    }

    pub fn node(&self) -> &Node {
        &self.resource().node
    }

    /// Type tag of the top-level value, if it is structured and typed.
    pub fn tag(&self) -> Option<&str> {
        self.node().tag()
    }

    /// Field of the top-level object.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.node().get(key)
    }

    /// Untagged JSON copy.
    pub fn to_json(&self) -> Value {
        self.node().to_json()
    }

    pub fn status(&self) -> u16 {
        self.resource().status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.resource().headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::http::find_header(self.headers(), name)
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        RateLimit::from_headers(self.headers())
    }

    /// Endpoint that produced this result.
    pub fn endpoint(&self) -> &str {
        &self.resource().endpoint
    }

    pub fn as_cursor(&self) -> Option<&Cursor> {
        match self {
            ApiObject::Cursor(c) => Some(c),
            ApiObject::Resource(_) => None,
        }
    }

    pub fn into_cursor(self) -> Option<Cursor> {
        match self {
            ApiObject::Cursor(c) => Some(c),
            ApiObject::Resource(_) => None,
        }
    }

    pub fn into_node(self) -> Node {
        match self {
            ApiObject::Resource(r) => r.node,
            ApiObject::Cursor(c) => c.resource.node,
        }
    }
}

/// Results that can repeat the call that produced them.
pub trait Refetch {
    /// Name of the producing endpoint.
    fn endpoint_name(&self) -> &str;

    /// The captured call, present only for GET results.
    fn call_source(&self) -> Option<&CallSource>;

    /// Call the same endpoint again with `overrides` shallow-merged over the
    /// original arguments.
    fn refetch(&self, overrides: Args) -> Result<ApiObject, Error> {
        let source = self.call_source().ok_or_else(|| Error::NotRepeatable {
            endpoint: self.endpoint_name().to_string(),
        })?;
        source
            .client()
            .call(self.endpoint_name(), source.merged(overrides))
    }
}

impl Refetch for Resource {
    fn endpoint_name(&self) -> &str {
        &self.endpoint
    }

    fn call_source(&self) -> Option<&CallSource> {
        self.source.as_ref()
    }
}

impl Refetch for Cursor {
    fn endpoint_name(&self) -> &str {
        &self.resource.endpoint
    }

    fn call_source(&self) -> Option<&CallSource> {
        self.resource.source.as_ref()
    }
}

impl Refetch for ApiObject {
    fn endpoint_name(&self) -> &str {
        &self.resource().endpoint
    }

    fn call_source(&self) -> Option<&CallSource> {
        self.resource().source.as_ref()
    }
}

/// Forward/backward navigation over cursored listings.
pub trait Paginated: Refetch {
    fn next_cursor(&self) -> i64;
    fn previous_cursor(&self) -> i64;

    fn has_next(&self) -> bool {
        self.next_cursor() != 0
    }

    fn has_previous(&self) -> bool {
        self.previous_cursor() != 0
    }

    /// The following page, or `None` at the end of the listing.
    fn next_page(&self) -> Result<Option<ApiObject>, Error>;

    /// The preceding page, or `None` at the start of the listing.
    fn previous_page(&self) -> Result<Option<ApiObject>, Error>;
}

impl Paginated for Cursor {
    fn next_cursor(&self) -> i64 {
        self.next_cursor
    }

    fn previous_cursor(&self) -> i64 {
        self.previous_cursor
    }

    fn next_page(&self) -> Result<Option<ApiObject>, Error> {
        if !self.has_next() {
            return Ok(None);
        }
        self.page(&self.next_cursor_str)
    }

    fn previous_page(&self) -> Result<Option<ApiObject>, Error> {
        if !self.has_previous() {
            return Ok(None);
        }
        self.page(&self.previous_cursor_str)
    }
}

/// One entry of an API error body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiErrorEntry {
    pub code: Option<i64>,
    pub message: String,
}

/// A completed exchange whose body reports a remote-side failure.
#[derive(Debug, Clone)]
pub struct ApiFailure {
    pub errors: Vec<ApiErrorEntry>,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// The decoded body, tagged with the error type.
    pub node: Node,
}

impl ApiFailure {
    pub(crate) fn from_node(node: Node, status: u16, headers: Vec<(String, String)>) -> Self {
        let errors = match node.get("errors") {
            Some(list) if !list.items().is_empty() => list
                .items()
                .iter()
                .map(|entry| ApiErrorEntry {
                    code: entry.get("code").and_then(Node::as_i64),
                    message: entry
                        .get("message")
                        .and_then(Node::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect(),
            Some(single) => single
                .as_str()
                .map(|message| {
                    vec![ApiErrorEntry {
                        code: None,
                        message: message.to_string(),
                    }]
                })
                .unwrap_or_default(),
            None => Vec::new(),
        };
        Self {
            errors,
            status,
            headers,
            node,
        }
    }

    /// Code of the first error carrying one.
    pub fn code(&self) -> Option<i64> {
        self.errors.iter().find_map(|e| e.code)
    }

    pub fn message(&self) -> Option<&str> {
        self.errors.first().map(|e| e.message.as_str())
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        RateLimit::from_headers(&self.headers)
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "API error (HTTP {})", self.status);
        }
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| match e.code {
                Some(code) => format!("[{code}] {}", e.message),
                None => e.message.clone(),
            })
            .collect();
        write!(f, "API error (HTTP {}): {}", self.status, parts.join("; "))
    }
}

/// An undecoded response, for callers that defer decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub body: String,
    /// Declared result type of the endpoint.
    pub type_name: Option<String>,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub endpoint: String,
}

impl RawResponse {
    pub fn rate_limit(&self) -> Option<RateLimit> {
        RateLimit::from_headers(&self.headers)
    }
}
