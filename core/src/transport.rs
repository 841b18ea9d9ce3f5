//! HTTP transport: one exchange per call, or one long-lived stream.
//!
//! # Design
//! The core builds `HttpRequest` values and interprets `HttpResponse` values;
//! a `Transport` only moves bytes. A completed exchange with a 4xx/5xx status
//! is a normal `Ok` response here. Only failures to complete the exchange
//! (DNS, connect, reset, timeout) are `TransportError`s.
//!
//! Streaming connections push body chunks into a shared `StreamSink` as they
//! arrive and return once the connection closes. The sink's cancel flag is
//! checked between reads, so a cancelled stream stops at the next chunk.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{TransportError, TransportErrorKind};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};

const READ_CHUNK: usize = 8 * 1024;

/// Performs HTTP exchanges for the client and the async engine.
pub trait Transport: Send + Sync + 'static {
    /// Perform exactly one request/response exchange.
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Open a streaming connection and feed its body into `sink` until the
    /// connection closes or the sink is cancelled.
    ///
    /// Returns the response head. For a non-2xx status the body is read in
    /// full and returned instead of being streamed.
    fn open_stream(&self, request: &HttpRequest, sink: &StreamSink) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Default)]
struct SinkState {
    head: Option<(u16, Vec<(String, String)>)>,
    body: Vec<u8>,
}

/// Incrementally filled buffers of an open streaming connection.
#[derive(Debug, Default)]
pub struct StreamSink {
    state: Mutex<SinkState>,
    cancelled: Arc<AtomicBool>,
}

impl StreamSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the status line and headers once they are known.
    pub fn set_head(&self, status: u16, headers: Vec<(String, String)>) {
        self.state().head = Some((status, headers));
    }

    pub fn push(&self, bytes: &[u8]) {
        self.state().body.extend_from_slice(bytes);
    }

    /// Drain every body byte received since the last call.
    pub fn take_body(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().body)
    }

    pub fn status(&self) -> Option<u16> {
        self.state().head.as_ref().map(|(status, _)| *status)
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.state()
            .head
            .as_ref()
            .map(|(_, headers)| headers.clone())
            .unwrap_or_default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Flag shared with the future that owns this connection.
    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

/// Blocking transport backed by a `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
    stream_agent: ureq::Agent,
    user_agent: String,
}

impl UreqTransport {
    /// `request_timeout` bounds one-shot exchanges only; streams have no
    /// overall deadline.
    pub fn new(connect_timeout: Duration, request_timeout: Duration, user_agent: impl Into<String>) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(connect_timeout))
            .timeout_global(Some(request_timeout))
            .build()
            .new_agent();
        let stream_agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(connect_timeout))
            .build()
            .new_agent();
        Self {
            agent,
            stream_agent,
            user_agent: user_agent.into(),
        }
    }

    fn send(&self, agent: &ureq::Agent, request: &HttpRequest) -> Result<ureq::http::Response<ureq::Body>, ureq::Error> {
        let url = request.target_url();
        tracing::debug!(method = %request.method, url = %url, "sending request");
        let payload = request.payload();
        match request.method {
            HttpMethod::Get => self.with_headers(agent.get(&url), request).call(),
            HttpMethod::Delete => self.with_headers(agent.delete(&url), request).call(),
            HttpMethod::Post => {
                let builder = self.with_headers(agent.post(&url), request);
                match payload {
                    Some((content_type, bytes)) => builder.content_type(content_type).send(&bytes[..]),
                    None => builder.send_empty(),
                }
            }
            HttpMethod::Put => {
                let builder = self.with_headers(agent.put(&url), request);
                match payload {
                    Some((content_type, bytes)) => builder.content_type(content_type).send(&bytes[..]),
                    None => builder.send_empty(),
                }
            }
        }
    }

    fn with_headers<B>(&self, mut builder: ureq::RequestBuilder<B>, request: &HttpRequest) -> ureq::RequestBuilder<B> {
        builder = builder.header("User-Agent", &self.user_agent);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

impl Transport for UreqTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut response = self.send(&self.agent, request).map_err(map_ureq_error)?;
        let status = response.status().as_u16();
        let headers = collect_headers(&response);
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(map_ureq_error)?;
        Ok(HttpResponse { status, headers, body })
    }

    fn open_stream(&self, request: &HttpRequest, sink: &StreamSink) -> Result<HttpResponse, TransportError> {
        let mut response = self.send(&self.stream_agent, request).map_err(map_ureq_error)?;
        let status = response.status().as_u16();
        let headers = collect_headers(&response);
        sink.set_head(status, headers.clone());

        if !(200..300).contains(&status) {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Ok(HttpResponse { status, headers, body });
        }

        let mut reader = response.into_body().into_reader();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if sink.is_cancelled() {
                tracing::debug!(url = %request.url, "stream cancelled");
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => sink.push(&buf[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::new(TransportErrorKind::Io, err.to_string())),
            }
        }
        Ok(HttpResponse {
            status,
            headers,
            body: String::new(),
        })
    }
}

fn collect_headers(response: &ureq::http::Response<ureq::Body>) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn map_ureq_error(err: ureq::Error) -> TransportError {
    let kind = match &err {
        ureq::Error::HostNotFound => TransportErrorKind::Dns,
        ureq::Error::ConnectionFailed => TransportErrorKind::Connect,
        ureq::Error::Timeout(_) => TransportErrorKind::Timeout,
        ureq::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => TransportErrorKind::Connect,
        ureq::Error::Io(_) => TransportErrorKind::Io,
        _ => TransportErrorKind::Other,
    };
    TransportError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_hands_out_each_chunk_once() {
        let sink = StreamSink::new();
        sink.push(b"{\"a\":1}\r\n");
        sink.push(b"{\"b\"");
        assert_eq!(sink.take_body(), b"{\"a\":1}\r\n{\"b\"".to_vec());
        assert!(sink.take_body().is_empty());
    }

    #[test]
    fn sink_head_is_visible_after_set() {
        let sink = StreamSink::new();
        assert_eq!(sink.status(), None);
        sink.set_head(200, vec![("content-type".to_string(), "application/json".to_string())]);
        assert_eq!(sink.status(), Some(200));
        assert_eq!(sink.headers().len(), 1);
    }

    #[test]
    fn cancel_flag_is_sticky() {
        let sink = StreamSink::new();
        assert!(!sink.is_cancelled());
        sink.cancel();
        sink.cancel();
        assert!(sink.is_cancelled());
    }

    #[test]
    fn unreachable_host_is_a_transport_error() {
        let transport = UreqTransport::new(Duration::from_millis(500), Duration::from_secs(2), "chirp-test");
        let request = HttpRequest {
            method: HttpMethod::Get,
            url: "http://127.0.0.1:1/nothing.json".to_string(),
            headers: Vec::new(),
            body: crate::http::Body::Empty,
        };
        let err = transport.execute(&request).unwrap_err();
        assert!(matches!(
            err.kind,
            TransportErrorKind::Connect | TransportErrorKind::Io | TransportErrorKind::Timeout | TransportErrorKind::Other
        ));
    }
}
