//! The API client: one call path per catalog endpoint.
//!
//! # Design
//! Endpoints are compiled on first use into a `CompiledEndpoint` (checked
//! method and path, disjoint rule set, coerced defaults) and cached in a
//! registry behind a `RwLock`. A call then runs validate → build → sign →
//! transport → decode/tag, either inline or with the transport step on the
//! async engine and decoding deferred into the future's transform.
//!
//! `Client` is a cheap handle over shared state. Results of GET calls keep a
//! clone of it, together with the arguments used, so they can be fetched
//! again or paginated.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::args::{ArgValue, Args};
use crate::auth::{Anonymous, RequestSigner};
use crate::catalog::{EndpointCatalog, EndpointDecl, TypeCatalog};
use crate::config::ClientConfig;
use crate::engine::{ApiFuture, Engine};
use crate::error::{CatalogError, Error};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::object::{ApiObject, CallSource, RawResponse};
use crate::request::{self, RequestTemplate};
use crate::stream::{Framing, StreamHandle};
use crate::transport::{Transport, UreqTransport};
use crate::validate::{self, coerce, RuleSet};

/// Internal option: return the undecoded body.
pub const RAW_OPTION: &str = "_raw";
/// Internal option: return a future instead of blocking.
pub const ASYNC_OPTION: &str = "_async";

/// A catalog entry checked and prepared for calls.
#[derive(Debug, Clone)]
pub struct CompiledEndpoint {
    pub name: Arc<str>,
    pub method: HttpMethod,
    pub path: String,
    pub rules: RuleSet,
    pub result_type: Option<String>,
    pub multipart: bool,
    /// Coerced defaults, limited to arguments the rules know.
    pub defaults: Args,
    pub stream: bool,
}

impl CompiledEndpoint {
    pub fn compile(name: &str, decl: &EndpointDecl) -> Result<Self, CatalogError> {
        let malformed = |reason: &str| CatalogError::MalformedEndpoint {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let method = decl.method.ok_or_else(|| malformed("no method"))?;
        let path = decl
            .path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| malformed("no path"))?;
        let rules = RuleSet::from_decl(name, &decl.args)?;

        let mut defaults = Args::new();
        for (key, raw) in &decl.defaults {
            let Some(kind) = rules.kind_of(key) else {
                tracing::warn!(endpoint = name, argument = %key, "dropping default for unknown argument");
                continue;
            };
            let Some(value) = ArgValue::from_json(raw) else {
                continue;
            };
            let value = coerce(kind, &value).ok_or_else(|| CatalogError::InvalidDefault {
                endpoint: name.to_string(),
                name: key.clone(),
            })?;
            defaults.insert(key.clone(), value);
        }

        Ok(Self {
            name: Arc::from(name),
            method,
            path: path.to_string(),
            rules,
            result_type: decl.result_type.clone(),
            multipart: decl.multipart,
            defaults,
            stream: decl.stream,
        })
    }

    fn template(&self) -> RequestTemplate<'_> {
        RequestTemplate {
            method: self.method,
            path: &self.path,
            defaults: &self.defaults,
            multipart: self.multipart,
        }
    }
}

/// What `invoke` produced, depending on the internal options and the
/// endpoint's stream flag.
#[derive(Debug)]
pub enum Outcome {
    Object(ApiObject),
    Raw(RawResponse),
    Pending(ApiFuture<ApiObject>),
    PendingRaw(ApiFuture<RawResponse>),
    Stream(StreamHandle),
}

struct ClientInner {
    config: ClientConfig,
    endpoints: Arc<EndpointCatalog>,
    types: Arc<TypeCatalog>,
    signer: Box<dyn RequestSigner>,
    transport: Arc<dyn Transport>,
    engine: Engine,
    registry: RwLock<HashMap<String, Arc<CompiledEndpoint>>>,
}

/// Typed client for the catalogued REST API.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.config.base_url)
            .field("stream_url", &self.inner.config.stream_url)
            .finish()
    }
}

/// Builder for [`Client`]. Unset parts fall back to the built-in catalogs,
/// an anonymous signer and a `ureq` transport.
#[derive(Default)]
pub struct ClientBuilder {
    config: Option<ClientConfig>,
    signer: Option<Box<dyn RequestSigner>>,
    transport: Option<Arc<dyn Transport>>,
    endpoints: Option<Arc<EndpointCatalog>>,
    types: Option<Arc<TypeCatalog>>,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn signer(mut self, signer: impl RequestSigner + 'static) -> Self {
        self.signer = Some(Box::new(signer));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn endpoints(mut self, endpoints: EndpointCatalog) -> Self {
        self.endpoints = Some(Arc::new(endpoints));
        self
    }

    pub fn types(mut self, types: TypeCatalog) -> Self {
        self.types = Some(Arc::new(types));
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        let config = self.config.unwrap_or_default();
        let endpoints = match self.endpoints {
            Some(endpoints) => endpoints,
            None => EndpointCatalog::builtin()?,
        };
        let types = match self.types {
            Some(types) => types,
            None => TypeCatalog::builtin()?,
        };
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(UreqTransport::new(
                config.connect_timeout(),
                config.request_timeout(),
                config.user_agent.clone(),
            ))
        });
        let engine = Engine::new(Arc::clone(&transport), config.workers);
        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                endpoints,
                types,
                signer: self.signer.unwrap_or_else(|| Box::new(Anonymous)),
                transport,
                engine,
                registry: RwLock::new(HashMap::new()),
            }),
        })
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Client with the built-in catalogs and no credentials.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn types(&self) -> &Arc<TypeCatalog> {
        &self.inner.types
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Callable for `name`, compiled on first access and cached.
    pub fn endpoint(&self, name: &str) -> Result<Endpoint, Error> {
        Ok(Endpoint {
            client: self.clone(),
            compiled: self.compiled(name)?,
        })
    }

    fn compiled(&self, name: &str) -> Result<Arc<CompiledEndpoint>, CatalogError> {
        {
            let registry = self
                .inner
                .registry
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(found) = registry.get(name) {
                return Ok(Arc::clone(found));
            }
        }
        let compiled = self
            .inner
            .endpoints
            .get(name)
            .ok_or_else(|| CatalogError::UnknownEndpoint(name.to_string()))
            .and_then(|decl| CompiledEndpoint::compile(name, decl))
            .map_err(|err| {
                tracing::error!(endpoint = name, error = %err, "cannot compile endpoint");
                err
            })?;
        let mut registry = self
            .inner
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(Arc::clone(
            registry
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(compiled)),
        ))
    }

    /// Blocking call returning a decoded, tagged result.
    pub fn call(&self, name: &str, args: Args) -> Result<ApiObject, Error> {
        self.endpoint(name)?.call(args)
    }

    /// Blocking call returning the undecoded body.
    pub fn call_raw(&self, name: &str, args: Args) -> Result<RawResponse, Error> {
        self.endpoint(name)?.call_raw(args)
    }

    /// Dispatch on the engine. Failures before dispatch resolve the future
    /// immediately.
    pub fn call_async(&self, name: &str, args: Args) -> ApiFuture<ApiObject> {
        match self.endpoint(name) {
            Ok(endpoint) => endpoint.call_async(args),
            Err(err) => ApiFuture::ready(Err(err)),
        }
    }

    pub fn call_raw_async(&self, name: &str, args: Args) -> ApiFuture<RawResponse> {
        match self.endpoint(name) {
            Ok(endpoint) => endpoint.call_raw_async(args),
            Err(err) => ApiFuture::ready(Err(err)),
        }
    }

    /// Open a streaming connection.
    pub fn stream(&self, name: &str, args: Args) -> Result<StreamHandle, Error> {
        self.endpoint(name)?.stream(args)
    }

    /// Dispatch according to the `_raw` / `_async` options in `args`.
    pub fn invoke(&self, name: &str, args: Args) -> Result<Outcome, Error> {
        self.endpoint(name)?.invoke(args)
    }

    /// Decode a response previously obtained with `call_raw`.
    pub fn parse_raw(&self, raw: RawResponse) -> Result<ApiObject, Error> {
        let response = HttpResponse {
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
        };
        ApiObject::from_response(
            response,
            raw.type_name.as_deref(),
            &self.inner.types,
            Arc::from(raw.endpoint),
            None,
        )
    }

    /// Stop the async workers and cancel open streams. Later async calls
    /// start a fresh pool.
    pub fn shutdown(&self) {
        self.inner.engine.shutdown();
    }
}

/// A compiled endpoint bound to its client.
#[derive(Debug, Clone)]
pub struct Endpoint {
    client: Client,
    compiled: Arc<CompiledEndpoint>,
}

impl Endpoint {
    pub fn descriptor(&self) -> &CompiledEndpoint {
        &self.compiled
    }

    /// Validate, build and sign. Also returns the argument snapshot a GET
    /// result keeps for `refetch`.
    fn prepare(&self, args: &Args) -> Result<(HttpRequest, Args), Error> {
        let ep = &self.compiled;
        let config = &self.client.inner.config;
        let validated = validate::validate(args, &ep.rules, &ep.name, &ep.defaults)?;
        let base = if ep.stream {
            &config.stream_url
        } else {
            &config.base_url
        };
        let mut request = request::build(base, &config.format_suffix, &ep.template(), &validated)
            .map_err(|err| {
                tracing::error!(endpoint = %ep.name, error = %err, "cannot build request");
                err
            })?;
        let auth = self.client.inner.signer.sign(&request)?;
        request.headers.extend(auth);
        let snapshot = request::merge_args(&ep.defaults, &validated);
        Ok((request, snapshot))
    }

    fn source(&self, snapshot: Args) -> Option<CallSource> {
        (self.compiled.method == HttpMethod::Get).then(|| CallSource::new(self.client.clone(), snapshot))
    }

    fn raw(&self, response: HttpResponse) -> RawResponse {
        RawResponse {
            body: response.body,
            type_name: self.compiled.result_type.clone(),
            status: response.status,
            headers: response.headers,
            endpoint: self.compiled.name.to_string(),
        }
    }

    pub fn call(&self, args: Args) -> Result<ApiObject, Error> {
        let (request, snapshot) = self.prepare(&args)?;
        tracing::debug!(endpoint = %self.compiled.name, method = %request.method, url = %request.url, "calling endpoint");
        let response = self.client.inner.transport.execute(&request)?;
        ApiObject::from_response(
            response,
            self.compiled.result_type.as_deref(),
            &self.client.inner.types,
            Arc::clone(&self.compiled.name),
            self.source(snapshot),
        )
    }

    pub fn call_raw(&self, args: Args) -> Result<RawResponse, Error> {
        let (request, _) = self.prepare(&args)?;
        tracing::debug!(endpoint = %self.compiled.name, method = %request.method, url = %request.url, "calling endpoint (raw)");
        let response = self.client.inner.transport.execute(&request)?;
        Ok(self.raw(response))
    }

    pub fn call_async(&self, args: Args) -> ApiFuture<ApiObject> {
        let (request, snapshot) = match self.prepare(&args) {
            Ok(prepared) => prepared,
            Err(err) => return ApiFuture::ready(Err(err)),
        };
        let future = match self.client.inner.engine.dispatch(request) {
            Ok(future) => future,
            Err(err) => return ApiFuture::ready(Err(err)),
        };
        let declared = self.compiled.result_type.clone();
        let types = Arc::clone(&self.client.inner.types);
        let name = Arc::clone(&self.compiled.name);
        let source = self.source(snapshot);
        future.map(move |response| ApiObject::from_response(response, declared.as_deref(), &types, name, source))
    }

    pub fn call_raw_async(&self, args: Args) -> ApiFuture<RawResponse> {
        let request = match self.prepare(&args) {
            Ok((request, _)) => request,
            Err(err) => return ApiFuture::ready(Err(err)),
        };
        let future = match self.client.inner.engine.dispatch(request) {
            Ok(future) => future,
            Err(err) => return ApiFuture::ready(Err(err)),
        };
        let this = self.clone();
        future.map(move |response| Ok(this.raw(response)))
    }

    /// Open a streaming connection. `delimited=length` selects
    /// length-prefixed framing for this stream.
    pub fn stream(&self, args: Args) -> Result<StreamHandle, Error> {
        let (request, _) = self.prepare(&args)?;
        let config = &self.client.inner.config;
        let framing = match args.get("delimited").and_then(ArgValue::as_str) {
            Some("length") => Framing::Length,
            _ => config.framing,
        };
        let (connection, sink) = self.client.inner.engine.open_stream(request)?;
        Ok(StreamHandle::new(
            connection,
            sink,
            framing,
            self.compiled.result_type.clone(),
            Arc::clone(&self.client.inner.types),
            Arc::clone(&self.compiled.name),
            config.stream_poll(),
        ))
    }

    /// Dispatch according to `_raw` / `_async` and the stream flag.
    pub fn invoke(&self, args: Args) -> Result<Outcome, Error> {
        if self.compiled.stream {
            return self.stream(args).map(Outcome::Stream);
        }
        let flag = |name: &str| args.get(name).is_some_and(ArgValue::is_truthy);
        let (raw, run_async) = (flag(RAW_OPTION), flag(ASYNC_OPTION));
        Ok(match (run_async, raw) {
            (true, true) => Outcome::PendingRaw(self.call_raw_async(args)),
            (true, false) => Outcome::Pending(self.call_async(args)),
            (false, true) => Outcome::Raw(self.call_raw(args)?),
            (false, false) => Outcome::Object(self.call(args)?),
        })
    }
}
