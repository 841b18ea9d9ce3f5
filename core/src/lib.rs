//! Typed client core for a paginated, rate-limited REST API with streaming.
//!
//! # Overview
//! Endpoints and object types are declared in static catalogs. A call runs
//! the same pipeline for every endpoint: the arguments are validated and
//! coerced against the endpoint's rules, a request is built from its path
//! template, signed, and executed, and the JSON body is decoded and tagged
//! with its object type. Results are navigable objects; cursored listings
//! page forward and backward, and GET results can be fetched again with new
//! arguments.
//!
//! # Design
//! - Request building and response interpretation are pure; only the
//!   `Transport` touches the network, so tests can swap it out.
//! - Calls are blocking by default. `call_async` hands the exchange to a
//!   small worker pool and returns an `ApiFuture` that can be peeked without
//!   blocking, waited on, or cancelled.
//! - Streaming endpoints yield a `StreamHandle` that splits the connection's
//!   bytes into records on demand.
//! - Every failure is a value: validation, catalog, transport, API-level,
//!   HTTP and decode errors all come back as `Err(Error)`.

pub mod args;
pub mod auth;
pub mod catalog;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod object;
pub mod request;
pub mod stream;
pub mod tag;
pub mod transport;
pub mod validate;

pub use args::{args_from_json, ArgValue, Args, Attachment};
pub use auth::{Anonymous, BearerToken, RequestSigner};
pub use catalog::{EndpointCatalog, ObjectKind, TypeCatalog};
pub use client::{Client, ClientBuilder, Endpoint, Outcome};
pub use config::ClientConfig;
pub use engine::{ApiFuture, Engine, JobId};
pub use error::{AuthError, CatalogError, Error, TransportError, TransportErrorKind, ValidationError};
pub use http::{Body, HttpMethod, HttpRequest, HttpResponse, RateLimit};
pub use object::{ApiErrorEntry, ApiFailure, ApiObject, CallSource, Cursor, Paginated, RawResponse, Refetch, Resource};
pub use stream::{FrameDecoder, Framing, StreamHandle, StreamRead};
pub use tag::Node;
pub use transport::{StreamSink, Transport, UreqTransport};
pub use validate::ArgKind;
