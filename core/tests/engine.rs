//! Engine behaviour with a transport whose requests only finish when the test
//! releases them, so completion order is fully under test control.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chirp_core::{
    ApiFuture, Body, Engine, Error, HttpMethod, HttpRequest, HttpResponse, StreamSink, Transport,
    TransportError, TransportErrorKind,
};

#[derive(Default)]
struct GatedTransport {
    open: Mutex<HashSet<String>>,
    changed: Condvar,
    started: AtomicUsize,
}

impl GatedTransport {
    fn release(&self, url: &str) {
        self.open.lock().unwrap().insert(url.to_string());
        self.changed.notify_all();
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl Transport for GatedTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !open.contains(&request.url) {
            open = self.changed.wait(open).unwrap();
        }
        Ok(HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: request.url.clone(),
        })
    }

    fn open_stream(&self, _request: &HttpRequest, _sink: &StreamSink) -> Result<HttpResponse, TransportError> {
        Err(TransportError::new(TransportErrorKind::Other, "streams are not gated"))
    }
}

fn setup(workers: usize) -> (Arc<GatedTransport>, Arc<Engine>) {
    let transport = Arc::new(GatedTransport::default());
    let engine = Arc::new(Engine::new(transport.clone(), workers));
    (transport, engine)
}

fn get(url: &str) -> HttpRequest {
    HttpRequest {
        method: HttpMethod::Get,
        url: url.to_string(),
        headers: Vec::new(),
        body: Body::Empty,
    }
}

fn body(future: &mut ApiFuture<HttpResponse>) -> String {
    match future.wait() {
        Ok(response) => response.body.clone(),
        Err(err) => panic!("unexpected error: {err}"),
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached in time");
}

#[test]
fn engine_starts_lazily() {
    let (transport, engine) = setup(2);
    assert!(!engine.is_running());

    let mut future = engine.dispatch(get("a")).unwrap();
    assert!(engine.is_running());
    transport.release("a");
    assert_eq!(body(&mut future), "a");
}

#[test]
fn peek_is_pending_until_the_job_completes() {
    let (transport, engine) = setup(1);
    let mut future = engine.dispatch(get("a")).unwrap();
    assert_ne!(future.id(), 0);

    wait_until(|| transport.started() == 1);
    assert!(future.peek().is_none());
    assert!(!future.is_ready());

    transport.release("a");
    wait_until(|| future.is_ready());
    assert_eq!(body(&mut future), "a");
    // Memoized: later reads never go back to the engine.
    assert!(matches!(future.peek(), Some(Ok(r)) if r.body == "a"));
    assert_eq!(future.into_result().unwrap().body, "a");
}

#[test]
fn results_resolve_independently_of_dispatch_order() {
    let (transport, engine) = setup(2);
    let mut first = engine.dispatch(get("first")).unwrap();
    let mut second = engine.dispatch(get("second")).unwrap();
    assert_ne!(first.id(), second.id());

    transport.release("second");
    assert_eq!(body(&mut second), "second");
    assert!(first.peek().is_none());

    transport.release("first");
    assert_eq!(body(&mut first), "first");
}

#[test]
fn concurrent_waiters_each_get_their_own_result() {
    let (transport, engine) = setup(4);
    let names = ["w0", "w1", "w2", "w3"];
    let waiters: Vec<_> = names
        .iter()
        .map(|name| {
            let mut future = engine.dispatch(get(name)).unwrap();
            std::thread::spawn(move || body(&mut future))
        })
        .collect();

    for name in names.iter().rev() {
        transport.release(name);
    }
    let results: Vec<String> = waiters.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(results, names);
}

#[test]
fn cancel_resolves_a_pending_future_as_cancelled() {
    let (transport, engine) = setup(1);
    let mut doomed = engine.dispatch(get("doomed")).unwrap();
    wait_until(|| transport.started() == 1);

    assert!(matches!(doomed.cancel(), Err(Error::Cancelled)));
    // Resolution is final.
    assert!(matches!(doomed.peek(), Some(Err(Error::Cancelled))));
    assert!(matches!(doomed.wait(), Err(Error::Cancelled)));

    // The late completion is discarded and does not disturb other jobs.
    transport.release("doomed");
    let mut next = engine.dispatch(get("next")).unwrap();
    transport.release("next");
    assert_eq!(body(&mut next), "next");
    assert!(matches!(doomed.peek(), Some(Err(Error::Cancelled))));
}

#[test]
fn cancelled_in_flight_request_holds_its_worker_until_it_returns() {
    let (transport, engine) = setup(1);
    let mut slow = engine.dispatch(get("slow")).unwrap();
    wait_until(|| transport.started() == 1);
    assert!(matches!(slow.cancel(), Err(Error::Cancelled)));

    let mut next = engine.dispatch(get("next")).unwrap();
    transport.release("next");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(transport.started(), 1);
    assert!(next.peek().is_none());

    transport.release("slow");
    assert_eq!(body(&mut next), "next");
    assert!(matches!(slow.peek(), Some(Err(Error::Cancelled))));
}

#[test]
fn cancel_after_completion_returns_the_real_result() {
    let (transport, engine) = setup(1);
    let mut first = engine.dispatch(get("first")).unwrap();
    let mut second = engine.dispatch(get("second")).unwrap();
    transport.release("first");
    transport.release("second");

    // One worker runs jobs in order, so by now `first` has completed too.
    assert_eq!(body(&mut second), "second");
    match first.cancel() {
        Ok(response) => assert_eq!(response.body, "first"),
        Err(err) => panic!("cancel after completion failed: {err}"),
    }
}

#[test]
fn queued_job_cancelled_before_it_runs_never_reaches_the_transport() {
    let (transport, engine) = setup(1);
    let mut blocker = engine.dispatch(get("blocker")).unwrap();
    let mut queued = engine.dispatch(get("queued")).unwrap();
    wait_until(|| transport.started() == 1);

    assert!(matches!(queued.cancel(), Err(Error::Cancelled)));
    transport.release("blocker");
    assert_eq!(body(&mut blocker), "blocker");

    let mut after = engine.dispatch(get("after")).unwrap();
    transport.release("after");
    assert_eq!(body(&mut after), "after");
    assert_eq!(transport.started(), 2);
}

#[test]
fn dropping_a_pending_future_is_harmless() {
    let (transport, engine) = setup(1);
    drop(engine.dispatch(get("dropped")).unwrap());
    transport.release("dropped");

    let mut kept = engine.dispatch(get("kept")).unwrap();
    transport.release("kept");
    assert_eq!(body(&mut kept), "kept");
}

#[test]
fn shutdown_aborts_queued_jobs_and_restarts_lazily() {
    let (transport, engine) = setup(1);
    let mut running = engine.dispatch(get("running")).unwrap();
    let mut queued = engine.dispatch(get("queued")).unwrap();
    wait_until(|| transport.started() == 1);

    let stopper = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || engine.shutdown())
    };
    wait_until(|| !engine.is_running());
    std::thread::sleep(Duration::from_millis(20));
    transport.release("running");
    stopper.join().unwrap();

    assert_eq!(body(&mut running), "running");
    match queued.wait() {
        Err(Error::Transport(err)) => assert_eq!(err.kind, TransportErrorKind::Aborted),
        other => panic!("expected an aborted job, got {other:?}"),
    }
    assert_eq!(transport.started(), 1);

    let mut fresh = engine.dispatch(get("fresh")).unwrap();
    assert!(engine.is_running());
    transport.release("fresh");
    assert_eq!(body(&mut fresh), "fresh");
}
