//! Background execution of transport calls.
//!
//! # Design
//! A fixed pool of named worker threads is started on the first dispatch and
//! pulls jobs from one shared queue. Every finished job posts
//! `(job id, result)` to a single completion channel. Futures drain that
//! channel into a per-id result store when they are polled: `peek` only ever
//! uses `try_lock`/`try_recv`, `wait` blocks in short `recv_timeout` slices
//! so several waiters can share the receiver.
//!
//! The store also tracks ids whose future was cancelled or dropped while
//! pending. Their late completions are discarded on arrival. Both live under
//! one mutex so a cancel can never race a completion into a leaked entry.
//!
//! Streaming connections get a dedicated thread each instead of a pool slot,
//! since they stay open indefinitely, but complete through the same channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, TransportError, TransportErrorKind};
use crate::http::{HttpRequest, HttpResponse};
use crate::transport::{StreamSink, Transport};

/// Correlation id linking a dispatched job to its completion.
pub type JobId = u64;

type Outcome = Result<HttpResponse, TransportError>;
type Transform<T> = Box<dyn FnOnce(Outcome) -> Result<T, Error> + Send>;

const WAIT_SLICE: Duration = Duration::from_millis(50);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Job {
    id: JobId,
    request: HttpRequest,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct Store {
    results: HashMap<JobId, Outcome>,
    discarded: HashSet<JobId>,
}

/// State shared by the engine, its workers and every future it hands out.
pub(crate) struct EngineShared {
    transport: Arc<dyn Transport>,
    completion_tx: Sender<(JobId, Outcome)>,
    completion_rx: Mutex<Receiver<(JobId, Outcome)>>,
    store: Mutex<Store>,
    streams: Mutex<HashMap<JobId, Arc<StreamSink>>>,
    next_id: AtomicU64,
}

impl EngineShared {
    fn complete(&self, id: JobId, outcome: Outcome) {
        // The receiver lives as long as `self`, so this cannot fail.
        let _ = self.completion_tx.send((id, outcome));
    }

    fn store(&self, id: JobId, outcome: Outcome) {
        let mut store = lock(&self.store);
        if store.discarded.remove(&id) {
            tracing::warn!(job = id, "discarding completion of cancelled job");
            return;
        }
        store.results.insert(id, outcome);
    }

    fn take(&self, id: JobId) -> Option<Outcome> {
        lock(&self.store).results.remove(&id)
    }

    fn drain(&self, rx: &Receiver<(JobId, Outcome)>) {
        while let Ok((id, outcome)) = rx.try_recv() {
            self.store(id, outcome);
        }
    }

    /// Non-blocking check for `id`.
    fn poll(&self, id: JobId) -> Option<Outcome> {
        if let Some(outcome) = self.take(id) {
            return Some(outcome);
        }
        match self.completion_rx.try_lock() {
            Ok(rx) => self.drain(&rx),
            Err(TryLockError::Poisoned(poisoned)) => self.drain(&poisoned.into_inner()),
            // Another thread is draining; it will store our result for us.
            Err(TryLockError::WouldBlock) => {}
        }
        self.take(id)
    }

    /// Block until `id` has completed.
    fn wait(&self, id: JobId) -> Outcome {
        loop {
            if let Some(outcome) = self.take(id) {
                return outcome;
            }
            let rx = lock(&self.completion_rx);
            if let Some(outcome) = self.take(id) {
                return outcome;
            }
            match rx.recv_timeout(WAIT_SLICE) {
                Ok((done, outcome)) => {
                    drop(rx);
                    self.store(done, outcome);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::new(TransportErrorKind::Aborted, "engine is gone"));
                }
            }
        }
    }

    /// Give up on `id`. Returns the result if it already arrived.
    fn cancel(&self, id: JobId, flag: &AtomicBool) -> Option<Outcome> {
        {
            let rx = lock(&self.completion_rx);
            self.drain(&rx);
        }
        let mut store = lock(&self.store);
        if let Some(outcome) = store.results.remove(&id) {
            return Some(outcome);
        }
        store.discarded.insert(id);
        drop(store);
        flag.store(true, Ordering::SeqCst);
        tracing::debug!(job = id, "job cancelled");
        None
    }

    fn abandon(&self, id: JobId, flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
        let mut store = lock(&self.store);
        if store.results.remove(&id).is_none() {
            store.discarded.insert(id);
        }
    }
}

struct Pool {
    sender: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
}

impl Pool {
    fn start(shared: &Arc<EngineShared>, size: usize) -> Result<Self, Error> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let queue = Arc::new(Mutex::new(receiver));
        let stopping = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let shared = Arc::clone(shared);
            let queue = Arc::clone(&queue);
            let stopping = Arc::clone(&stopping);
            let handle = thread::Builder::new()
                .name(format!("chirp-worker-{index}"))
                .spawn(move || worker_loop(&shared, &queue, &stopping))
                .map_err(|e| Error::Engine(format!("failed to spawn worker: {e}")))?;
            workers.push(handle);
        }
        tracing::info!(workers = size, "async engine started");
        Ok(Self {
            sender,
            workers,
            stopping,
        })
    }
}

fn worker_loop(shared: &EngineShared, queue: &Mutex<Receiver<Job>>, stopping: &AtomicBool) {
    loop {
        let job = lock(queue).recv();
        let Ok(job) = job else {
            break;
        };
        let outcome = if stopping.load(Ordering::SeqCst) {
            Err(TransportError::new(TransportErrorKind::Aborted, "engine shut down before the request ran"))
        } else if job.cancel.load(Ordering::SeqCst) {
            Err(TransportError::new(TransportErrorKind::Aborted, "cancelled before the request ran"))
        } else {
            tracing::debug!(job = job.id, method = %job.request.method, url = %job.request.url, "executing job");
            shared.transport.execute(&job.request)
        };
        shared.complete(job.id, outcome);
    }
}

/// Worker pool plus completion bookkeeping.
pub struct Engine {
    shared: Arc<EngineShared>,
    pool: Mutex<Option<Pool>>,
    workers: usize,
}

impl Engine {
    /// No threads are started until the first dispatch.
    pub fn new(transport: Arc<dyn Transport>, workers: usize) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel();
        Self {
            shared: Arc::new(EngineShared {
                transport,
                completion_tx,
                completion_rx: Mutex::new(completion_rx),
                store: Mutex::new(Store::default()),
                streams: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            pool: Mutex::new(None),
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Whether the worker pool is currently up.
    pub fn is_running(&self) -> bool {
        lock(&self.pool).is_some()
    }

    fn next_id(&self) -> JobId {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue `request` and return immediately.
    pub fn dispatch(&self, request: HttpRequest) -> Result<ApiFuture<HttpResponse>, Error> {
        let id = self.next_id();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut pool = lock(&self.pool);
        if pool.is_none() {
            *pool = Some(Pool::start(&self.shared, self.workers)?);
        }
        let Some(running) = pool.as_ref() else {
            return Err(Error::Engine("worker pool unavailable".to_string()));
        };
        tracing::debug!(job = id, method = %request.method, url = %request.url, "dispatching job");
        running
            .sender
            .send(Job {
                id,
                request,
                cancel: Arc::clone(&cancel),
            })
            .map_err(|_| Error::Engine("job queue closed".to_string()))?;
        Ok(ApiFuture::pending(
            id,
            Arc::clone(&self.shared),
            cancel,
            Box::new(|outcome| outcome.map_err(Error::from)),
        ))
    }

    /// Open a streaming connection on its own thread. The future resolves
    /// when the connection closes.
    pub fn open_stream(&self, request: HttpRequest) -> Result<(ApiFuture<HttpResponse>, Arc<StreamSink>), Error> {
        let id = self.next_id();
        let sink = Arc::new(StreamSink::new());
        lock(&self.shared.streams).insert(id, Arc::clone(&sink));

        let shared = Arc::clone(&self.shared);
        let thread_sink = Arc::clone(&sink);
        tracing::debug!(job = id, method = %request.method, url = %request.url, "opening stream");
        let spawned = thread::Builder::new()
            .name(format!("chirp-stream-{id}"))
            .spawn(move || {
                let outcome = shared.transport.open_stream(&request, &thread_sink);
                lock(&shared.streams).remove(&id);
                shared.complete(id, outcome);
            });
        if let Err(e) = spawned {
            lock(&self.shared.streams).remove(&id);
            return Err(Error::Engine(format!("failed to spawn stream thread: {e}")));
        }

        let future = ApiFuture::pending(
            id,
            Arc::clone(&self.shared),
            sink.cancel_flag(),
            Box::new(|outcome| outcome.map_err(Error::from)),
        );
        Ok((future, sink))
    }

    /// Stop the pool: workers exit after failing any still-queued job with
    /// an `Aborted` transport error, and every open stream is cancelled.
    /// The next dispatch starts a fresh pool.
    pub fn shutdown(&self) {
        for sink in lock(&self.shared.streams).values() {
            sink.cancel();
        }
        let Some(pool) = lock(&self.pool).take() else {
            return;
        };
        pool.stopping.store(true, Ordering::SeqCst);
        drop(pool.sender);
        for worker in pool.workers {
            if worker.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
        tracing::info!("async engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to the eventual result of an asynchronous call.
///
/// Resolves exactly once; every later read returns the memoized value.
/// Dropping a pending future abandons the job.
pub struct ApiFuture<T> {
    id: JobId,
    shared: Option<Arc<EngineShared>>,
    cancel: Arc<AtomicBool>,
    transform: Option<Transform<T>>,
    resolved: Option<Result<T, Error>>,
}

impl<T> ApiFuture<T> {
    fn pending(id: JobId, shared: Arc<EngineShared>, cancel: Arc<AtomicBool>, transform: Transform<T>) -> Self {
        Self {
            id,
            shared: Some(shared),
            cancel,
            transform: Some(transform),
            resolved: None,
        }
    }

    /// A future that is already resolved, e.g. by a validation failure.
    pub fn ready(value: Result<T, Error>) -> Self {
        Self {
            id: 0,
            shared: None,
            cancel: Arc::new(AtomicBool::new(false)),
            transform: None,
            resolved: Some(value),
        }
    }

    /// Correlation id; `0` for futures that never reached the engine.
    pub fn id(&self) -> JobId {
        self.id
    }

    fn apply(&mut self, outcome: Outcome) -> Result<T, Error> {
        match self.transform.take() {
            Some(transform) => transform(outcome),
            None => Err(Error::Engine("future resolved twice".to_string())),
        }
    }

    fn unresolvable() -> Result<T, Error> {
        Err(Error::Engine("future has no engine".to_string()))
    }

    /// Non-blocking: the result if it is available.
    pub fn peek(&mut self) -> Option<&Result<T, Error>> {
        if self.resolved.is_none() {
            let outcome = self.shared.as_ref().and_then(|shared| shared.poll(self.id));
            if let Some(outcome) = outcome {
                let value = self.apply(outcome);
                self.resolved = Some(value);
            }
        }
        self.resolved.as_ref()
    }

    pub fn is_ready(&mut self) -> bool {
        self.peek().is_some()
    }

    /// Block until the result is available.
    pub fn wait(&mut self) -> &Result<T, Error> {
        let value = match self.resolved.take() {
            Some(value) => value,
            None => match self.shared.clone() {
                Some(shared) => {
                    let outcome = shared.wait(self.id);
                    self.apply(outcome)
                }
                None => Self::unresolvable(),
            },
        };
        self.resolved.insert(value)
    }

    /// Cancel a pending call. A call that already finished keeps its real
    /// result; only a still-pending one resolves to `Error::Cancelled`.
    ///
    /// A queued call never reaches the transport. A one-shot request that a
    /// worker has already sent cannot be interrupted: the worker stays busy
    /// until the response arrives or `request_timeout_ms` elapses, and the
    /// late result is discarded. Streaming calls stop at the next chunk.
    pub fn cancel(&mut self) -> &Result<T, Error> {
        let value = match self.resolved.take() {
            Some(value) => value,
            None => match self.shared.clone() {
                Some(shared) => match shared.cancel(self.id, &self.cancel) {
                    Some(outcome) => self.apply(outcome),
                    None => {
                        self.transform = None;
                        Err(Error::Cancelled)
                    }
                },
                None => Self::unresolvable(),
            },
        };
        self.resolved.insert(value)
    }

    /// Block and take ownership of the result.
    pub fn into_result(mut self) -> Result<T, Error> {
        self.wait();
        self.resolved.take().unwrap_or_else(Self::unresolvable)
    }

    /// Chain a fallible transformation onto the result.
    pub fn map<U>(mut self, f: impl FnOnce(T) -> Result<U, Error> + Send + 'static) -> ApiFuture<U>
    where
        T: 'static,
        U: 'static,
    {
        let (resolved, transform): (Option<Result<U, Error>>, Option<Transform<U>>) =
            match (self.resolved.take(), self.transform.take()) {
                (Some(value), _) => (Some(value.and_then(f)), None),
                (None, Some(inner)) => {
                    let chained: Transform<U> = Box::new(move |outcome| inner(outcome).and_then(f));
                    (None, Some(chained))
                }
                (None, None) => (Some(Self::unresolvable().and_then(f)), None),
            };
        ApiFuture {
            id: self.id,
            shared: self.shared.clone(),
            cancel: Arc::clone(&self.cancel),
            transform,
            resolved,
        }
    }
}

impl<T> Drop for ApiFuture<T> {
    fn drop(&mut self) {
        if self.transform.is_some() {
            if let Some(shared) = &self.shared {
                tracing::debug!(job = self.id, "pending future dropped");
                shared.abandon(self.id, &self.cancel);
            }
        }
    }
}

impl<T> std::fmt::Debug for ApiFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiFuture")
            .field("id", &self.id)
            .field("resolved", &self.resolved.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_future_is_resolved_without_an_engine() {
        let mut future = ApiFuture::ready(Ok::<_, Error>(7));
        assert_eq!(future.id(), 0);
        assert!(matches!(future.peek(), Some(Ok(7))));
        assert!(matches!(future.cancel(), Ok(7)));
        assert_eq!(future.into_result().unwrap(), 7);
    }

    #[test]
    fn map_applies_to_resolved_value() {
        let future = ApiFuture::ready(Ok::<_, Error>(2)).map(|n| Ok(n * 10));
        assert_eq!(future.into_result().unwrap(), 20);
    }

    #[test]
    fn map_propagates_errors() {
        let future = ApiFuture::<i32>::ready(Err(Error::Cancelled)).map(|n| Ok(n + 1));
        assert!(matches!(future.into_result(), Err(Error::Cancelled)));
    }
}
