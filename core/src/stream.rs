//! Incremental record extraction from a streaming connection.
//!
//! # Design
//! The connection runs on its own thread and appends raw bytes to a shared
//! sink. A `StreamHandle` pulls those bytes on demand, splits them into frames
//! with a `FrameDecoder`, and decodes and tags every frame before queueing it.
//! Reading never blocks: `next_record` returns `StreamRead::WouldBlock` when
//! nothing is queued, which only means "not yet", never "finished".
//!
//! Two framings are supported. `Lines` splits at every CRLF and skips empty
//! keep-alive lines. `Length` additionally treats a line holding only a
//! decimal integer as the byte count of the record that follows.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::TypeCatalog;
use crate::engine::ApiFuture;
use crate::error::Error;
use crate::http::HttpResponse;
use crate::object::ApiObject;
use crate::transport::StreamSink;

const CRLF: &[u8] = b"\r\n";

/// How records are delimited on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    #[default]
    Lines,
    Length,
}

/// Splits a byte stream into records, buffering any partial tail.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    framing: Framing,
    buffer: Vec<u8>,
    expected: Option<usize>,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            expected: None,
        }
    }

    /// Bytes received but not yet part of a complete record.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Append `bytes` and return every record completed by them, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            if let Some(len) = self.expected {
                if self.buffer.len() < len {
                    break;
                }
                let record: Vec<u8> = self.buffer.drain(..len).collect();
                self.expected = None;
                let record = trim(&record);
                if !record.is_empty() {
                    frames.push(record.to_vec());
                }
                continue;
            }

            let Some(end) = find_crlf(&self.buffer) else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..end + CRLF.len()).take(end).collect();
            let line = trim(&line);
            if line.is_empty() {
                tracing::trace!("keep-alive line");
                continue;
            }
            if self.framing == Framing::Length {
                if let Some(len) = parse_length(line) {
                    tracing::trace!(len, "length prefix");
                    self.expected = Some(len);
                    continue;
                }
            }
            frames.push(line.to_vec());
        }
        frames
    }

    /// The unterminated tail once the connection is closed, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.expected = None;
        let tail = std::mem::take(&mut self.buffer);
        let tail = trim(&tail);
        (!tail.is_empty()).then(|| tail.to_vec())
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(CRLF.len()).position(|w| w == CRLF)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn parse_length(line: &[u8]) -> Option<usize> {
    if line.is_empty() || !line.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(line).ok()?.parse().ok()
}

/// Result of a non-blocking read.
#[derive(Debug)]
pub enum StreamRead {
    Record(Result<ApiObject, Error>),
    /// Nothing is queued right now. The stream may still be active.
    WouldBlock,
}

/// An open streaming call yielding tagged records.
pub struct StreamHandle {
    connection: Option<ApiFuture<HttpResponse>>,
    sink: Arc<StreamSink>,
    decoder: FrameDecoder,
    queue: VecDeque<Result<ApiObject, Error>>,
    record_type: Option<String>,
    types: Arc<TypeCatalog>,
    endpoint: Arc<str>,
    poll_interval: Duration,
}

impl StreamHandle {
    pub(crate) fn new(
        connection: ApiFuture<HttpResponse>,
        sink: Arc<StreamSink>,
        framing: Framing,
        record_type: Option<String>,
        types: Arc<TypeCatalog>,
        endpoint: Arc<str>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            connection: Some(connection),
            sink,
            decoder: FrameDecoder::new(framing),
            queue: VecDeque::new(),
            record_type,
            types,
            endpoint,
            poll_interval,
        }
    }

    /// Id of the underlying connection job.
    pub fn id(&self) -> u64 {
        self.connection.as_ref().map_or(0, ApiFuture::id)
    }

    pub fn status(&self) -> Option<u16> {
        self.sink.status()
    }

    /// Response headers, once the connection has answered.
    pub fn headers(&self) -> Vec<(String, String)> {
        self.sink.headers()
    }

    /// True until the connection closes, errors, or is cancelled.
    pub fn is_active(&mut self) -> bool {
        match self.connection.as_mut() {
            Some(connection) => connection.peek().is_none(),
            None => false,
        }
    }

    /// Cancel the connection. Records already received stay readable.
    pub fn close(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            let _ = connection.cancel();
        }
        self.sink.cancel();
    }

    /// Closed and fully delivered.
    pub fn is_finished(&self) -> bool {
        self.connection.is_none() && self.queue.is_empty()
    }

    /// Dequeue one record without blocking.
    pub fn next_record(&mut self) -> StreamRead {
        if self.queue.is_empty() {
            self.fill();
        }
        match self.queue.pop_front() {
            Some(record) => StreamRead::Record(record),
            None => StreamRead::WouldBlock,
        }
    }

    /// Blocking iterator over the remaining records, polling at the
    /// configured interval until the connection is closed and drained.
    pub fn records(&mut self) -> Records<'_> {
        Records { handle: self }
    }

    fn fill(&mut self) {
        // Check for closure before draining: the connection thread pushes its
        // last bytes before it completes.
        let closed = self.connection.as_mut().is_some_and(|c| c.peek().is_some());

        let bytes = self.sink.take_body();
        if !bytes.is_empty() {
            for frame in self.decoder.push(&bytes) {
                self.queue_frame(&frame);
            }
        }

        if closed {
            if let Some(tail) = self.decoder.finish() {
                self.queue_frame(&tail);
            }
            let outcome = self.connection.take().map(ApiFuture::into_result);
            if let Some(err) = outcome.and_then(|r| self.closing_error(r)) {
                self.queue.push_back(Err(err));
            }
        }
    }

    fn queue_frame(&mut self, frame: &[u8]) {
        let response = HttpResponse {
            status: self.sink.status().unwrap_or(200),
            headers: self.sink.headers(),
            body: String::from_utf8_lossy(frame).into_owned(),
        };
        let record = ApiObject::from_response(
            response,
            self.record_type.as_deref(),
            &self.types,
            Arc::clone(&self.endpoint),
            None,
        );
        self.queue.push_back(record);
    }

    /// The error to report for a connection that ended, if any.
    fn closing_error(&self, outcome: Result<HttpResponse, Error>) -> Option<Error> {
        match outcome {
            Ok(response) if response.is_success() => None,
            Ok(response) => ApiObject::from_response(
                response,
                self.record_type.as_deref(),
                &self.types,
                Arc::clone(&self.endpoint),
                None,
            )
            .err(),
            Err(Error::Cancelled) => None,
            Err(err) => Some(err),
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("endpoint", &self.endpoint)
            .field("queued", &self.queue.len())
            .field("open", &self.connection.is_some())
            .finish()
    }
}

/// Blocking iterator returned by [`StreamHandle::records`].
pub struct Records<'a> {
    handle: &'a mut StreamHandle,
}

impl Iterator for Records<'_> {
    type Item = Result<ApiObject, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.handle.next_record() {
                StreamRead::Record(record) => return Some(record),
                StreamRead::WouldBlock if self.handle.is_finished() => return None,
                StreamRead::WouldBlock => std::thread::sleep(self.handle.poll_interval),
            }
        }
    }
}
