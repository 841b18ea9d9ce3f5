//! C-ABI wrapper around `chirp-core`.
//!
//! # Overview
//! Exposes the client's synchronous, asynchronous and streaming call paths
//! through `extern "C"` functions. Arguments go in as a JSON object, results
//! come back as JSON text plus the object's type tag.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - One `FfiCallResult` envelope carries successes, pending reads and
//!   errors alike; `error_code` says which.
//! - The C caller owns all returned pointers and must call the matching
//!   `chirp_*_free` function to release them.

pub mod types;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};

use chirp_core::{args_from_json, Args, BearerToken, Client, ClientConfig, StreamRead};

use types::*;

/// Borrow a C string as UTF-8. Null maps to `None`.
fn read_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Parse the JSON argument object; null means no arguments.
fn read_args(ptr: *const c_char) -> Result<Args, String> {
    if ptr.is_null() {
        return Ok(Args::new());
    }
    let text = read_str(ptr).ok_or_else(|| "not valid UTF-8".to_string())?;
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    args_from_json(&value).ok_or_else(|| "expected a JSON object".to_string())
}

// ---------------------------------------------------------------------------
// Client lifecycle
// ---------------------------------------------------------------------------

/// Create a client.
///
/// `config_json` is a partial `ClientConfig` document; null selects the
/// defaults. `bearer_token` may be null for unsigned requests. Returns null
/// on invalid configuration, an unusable token, or an internal panic.
/// Free with `chirp_client_free`.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_client_new(
    config_json: *const c_char,
    bearer_token: *const c_char,
) -> *mut FfiClient {
    catch_unwind(AssertUnwindSafe(|| {
        let config = if config_json.is_null() {
            ClientConfig::default()
        } else {
            match read_str(config_json).and_then(|text| serde_json::from_str(text).ok()) {
                Some(config) => config,
                None => return std::ptr::null_mut(),
            }
        };
        let mut builder = Client::builder().config(config);
        if let Some(token) = read_str(bearer_token) {
            match BearerToken::new(token) {
                Ok(signer) => builder = builder.signer(signer),
                Err(_) => return std::ptr::null_mut(),
            }
        }
        match builder.build() {
            Ok(client) => Box::into_raw(Box::new(FfiClient { inner: client })),
            Err(_) => std::ptr::null_mut(),
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Free a client, stopping its worker pool. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_client_free(client: *mut FfiClient) {
    if !client.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let client = unsafe { Box::from_raw(client) };
            client.inner.shutdown();
        }));
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// Call `endpoint` synchronously with the JSON object `args_json`.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_call(
    client: *const FfiClient,
    endpoint: *const c_char,
    args_json: *const c_char,
) -> *mut FfiCallResult {
    catch_unwind(AssertUnwindSafe(|| {
        if client.is_null() {
            return FfiCallResult::null_arg("client");
        }
        let Some(endpoint) = read_str(endpoint) else {
            return FfiCallResult::null_arg("endpoint");
        };
        let args = match read_args(args_json) {
            Ok(args) => args,
            Err(reason) => return FfiCallResult::invalid_args(&reason),
        };
        let client = unsafe { &*client };
        FfiCallResult::from_outcome(&client.inner.call(endpoint, args))
    }))
    .unwrap_or_else(|_| FfiCallResult::panic("panic in chirp_call"))
}

/// Start an asynchronous call. Returns null only for null or malformed
/// inputs; every other failure is reported through the future.
/// Free with `chirp_future_free`.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_call_async(
    client: *const FfiClient,
    endpoint: *const c_char,
    args_json: *const c_char,
) -> *mut FfiFuture {
    catch_unwind(AssertUnwindSafe(|| {
        if client.is_null() {
            return std::ptr::null_mut();
        }
        let Some(endpoint) = read_str(endpoint) else {
            return std::ptr::null_mut();
        };
        let Ok(args) = read_args(args_json) else {
            return std::ptr::null_mut();
        };
        let client = unsafe { &*client };
        let future = client.inner.call_async(endpoint, args);
        Box::into_raw(Box::new(FfiFuture { inner: future }))
    }))
    .unwrap_or(std::ptr::null_mut())
}

// ---------------------------------------------------------------------------
// Futures
// ---------------------------------------------------------------------------

/// Non-blocking read: `Pending` until the call has resolved.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_future_peek(future: *mut FfiFuture) -> *mut FfiCallResult {
    catch_unwind(AssertUnwindSafe(|| {
        if future.is_null() {
            return FfiCallResult::null_arg("future");
        }
        let future = unsafe { &mut *future };
        match future.inner.peek() {
            Some(outcome) => FfiCallResult::from_outcome(outcome),
            None => FfiCallResult::pending(),
        }
    }))
    .unwrap_or_else(|_| FfiCallResult::panic("panic in chirp_future_peek"))
}

/// Block until the call resolves.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_future_wait(future: *mut FfiFuture) -> *mut FfiCallResult {
    catch_unwind(AssertUnwindSafe(|| {
        if future.is_null() {
            return FfiCallResult::null_arg("future");
        }
        let future = unsafe { &mut *future };
        FfiCallResult::from_outcome(future.inner.wait())
    }))
    .unwrap_or_else(|_| FfiCallResult::panic("panic in chirp_future_wait"))
}

/// Cancel the call. A call that already finished reports its real result.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_future_cancel(future: *mut FfiFuture) -> *mut FfiCallResult {
    catch_unwind(AssertUnwindSafe(|| {
        if future.is_null() {
            return FfiCallResult::null_arg("future");
        }
        let future = unsafe { &mut *future };
        FfiCallResult::from_outcome(future.inner.cancel())
    }))
    .unwrap_or_else(|_| FfiCallResult::panic("panic in chirp_future_cancel"))
}

/// Free a future. An unresolved call is abandoned. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_future_free(future: *mut FfiFuture) {
    if !future.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(future) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Open a stream on a streaming endpoint.
///
/// Returns null on failure; when `error_out` is non-null it then receives
/// an `FfiCallResult` describing the failure, to be freed by the caller.
/// Free the stream with `chirp_stream_free`.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_stream_open(
    client: *const FfiClient,
    endpoint: *const c_char,
    args_json: *const c_char,
    error_out: *mut *mut FfiCallResult,
) -> *mut FfiStream {
    let report = |result: *mut FfiCallResult| {
        if error_out.is_null() {
            chirp_free_result(result);
        } else {
            unsafe { *error_out = result };
        }
        std::ptr::null_mut()
    };
    catch_unwind(AssertUnwindSafe(|| {
        if client.is_null() {
            return report(FfiCallResult::null_arg("client"));
        }
        let Some(endpoint) = read_str(endpoint) else {
            return report(FfiCallResult::null_arg("endpoint"));
        };
        let args = match read_args(args_json) {
            Ok(args) => args,
            Err(reason) => return report(FfiCallResult::invalid_args(&reason)),
        };
        let client = unsafe { &*client };
        match client.inner.stream(endpoint, args) {
            Ok(stream) => Box::into_raw(Box::new(FfiStream { inner: stream })),
            Err(err) => report(FfiCallResult::from_error(&err)),
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Next record without blocking: `Pending` when nothing is queued yet,
/// `Closed` once the connection has ended and every record was delivered.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_stream_next(stream: *mut FfiStream) -> *mut FfiCallResult {
    catch_unwind(AssertUnwindSafe(|| {
        if stream.is_null() {
            return FfiCallResult::null_arg("stream");
        }
        let stream = unsafe { &mut *stream };
        match stream.inner.next_record() {
            StreamRead::Record(record) => FfiCallResult::from_outcome(&record),
            StreamRead::WouldBlock if stream.inner.is_finished() => FfiCallResult::closed(),
            StreamRead::WouldBlock => FfiCallResult::pending(),
        }
    }))
    .unwrap_or_else(|_| FfiCallResult::panic("panic in chirp_stream_next"))
}

/// Whether the connection is still open.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_stream_is_active(stream: *mut FfiStream) -> bool {
    if stream.is_null() {
        return false;
    }
    catch_unwind(AssertUnwindSafe(|| {
        let stream = unsafe { &mut *stream };
        stream.inner.is_active()
    }))
    .unwrap_or(false)
}

/// Close the connection. Records already received can still be read.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_stream_close(stream: *mut FfiStream) {
    if !stream.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let stream = unsafe { &mut *stream };
            stream.inner.close();
        }));
    }
}

/// Close and free a stream. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_stream_free(stream: *mut FfiStream) {
    if !stream.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let mut stream = unsafe { Box::from_raw(stream) };
            stream.inner.close();
        }));
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Free an `FfiCallResult`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_free_result(result: *mut FfiCallResult) {
    if result.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let result = unsafe { Box::from_raw(result) };
        for ptr in [result.error_message, result.type_tag, result.json] {
            if !ptr.is_null() {
                drop(unsafe { CString::from_raw(ptr) });
            }
        }
    }));
}

/// Free a C string allocated by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn chirp_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { CString::from_raw(s) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    /// A client aimed at a closed local port, so nothing reaches the network.
    fn offline_client() -> *mut FfiClient {
        let config = CString::new(
            r#"{"base_url": "http://127.0.0.1:9", "stream_url": "http://127.0.0.1:9", "connect_timeout_ms": 200}"#,
        )
        .unwrap();
        let client = chirp_client_new(config.as_ptr(), std::ptr::null());
        assert!(!client.is_null());
        client
    }

    fn message(result: &FfiCallResult) -> String {
        unsafe { CStr::from_ptr(result.error_message) }
            .to_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn client_new_with_defaults_and_free() {
        let client = chirp_client_new(std::ptr::null(), std::ptr::null());
        assert!(!client.is_null());
        chirp_client_free(client);
    }

    #[test]
    fn client_new_rejects_bad_config_json() {
        let config = CString::new("{not json").unwrap();
        assert!(chirp_client_new(config.as_ptr(), std::ptr::null()).is_null());
    }

    #[test]
    fn client_new_rejects_unusable_token() {
        let token = CString::new("   ").unwrap();
        assert!(chirp_client_new(std::ptr::null(), token.as_ptr()).is_null());
    }

    #[test]
    fn client_free_null_is_safe() {
        chirp_client_free(std::ptr::null_mut());
    }

    #[test]
    fn call_null_client_returns_null_arg() {
        let endpoint = CString::new("get_user").unwrap();
        let result = chirp_call(std::ptr::null(), endpoint.as_ptr(), std::ptr::null());
        let r = unsafe { &*result };
        assert_eq!(r.error_code, FfiErrorCode::NullArg);
        assert_eq!(message(r), "null argument: client");
        chirp_free_result(result);
    }

    #[test]
    fn call_unknown_endpoint_is_catalog_error() {
        let client = offline_client();
        let endpoint = CString::new("no_such_endpoint").unwrap();
        let result = chirp_call(client, endpoint.as_ptr(), std::ptr::null());
        let r = unsafe { &*result };
        assert_eq!(r.error_code, FfiErrorCode::Catalog);
        assert!(r.json.is_null());
        chirp_free_result(result);
        chirp_client_free(client);
    }

    #[test]
    fn call_missing_required_is_validation_error() {
        let client = offline_client();
        let endpoint = CString::new("get_tweet").unwrap();
        let args = CString::new("{}").unwrap();
        let result = chirp_call(client, endpoint.as_ptr(), args.as_ptr());
        let r = unsafe { &*result };
        assert_eq!(r.error_code, FfiErrorCode::Validation);
        assert!(message(r).contains("get_tweet"));
        assert_eq!(r.http_status, 0);
        chirp_free_result(result);
        chirp_client_free(client);
    }

    #[test]
    fn call_rejects_non_object_args() {
        let client = offline_client();
        let endpoint = CString::new("get_user").unwrap();
        let args = CString::new("[1, 2]").unwrap();
        let result = chirp_call(client, endpoint.as_ptr(), args.as_ptr());
        let r = unsafe { &*result };
        assert_eq!(r.error_code, FfiErrorCode::InvalidArgs);
        chirp_free_result(result);
        chirp_client_free(client);
    }

    #[test]
    fn call_against_closed_port_is_transport_error() {
        let client = offline_client();
        let endpoint = CString::new("get_user").unwrap();
        let args = CString::new(r#"{"screen_name": "jack"}"#).unwrap();
        let result = chirp_call(client, endpoint.as_ptr(), args.as_ptr());
        let r = unsafe { &*result };
        assert_eq!(r.error_code, FfiErrorCode::Transport);
        chirp_free_result(result);
        chirp_client_free(client);
    }

    #[test]
    fn async_validation_failure_is_resolved_immediately() {
        let client = offline_client();
        let endpoint = CString::new("get_user").unwrap();
        let args = CString::new(r#"{"bogus": 1}"#).unwrap();
        let future = chirp_call_async(client, endpoint.as_ptr(), args.as_ptr());
        assert!(!future.is_null());

        let peeked = chirp_future_peek(future);
        assert_eq!(unsafe { &*peeked }.error_code, FfiErrorCode::Validation);
        chirp_free_result(peeked);

        let waited = chirp_future_wait(future);
        assert_eq!(unsafe { &*waited }.error_code, FfiErrorCode::Validation);
        chirp_free_result(waited);

        let cancelled = chirp_future_cancel(future);
        assert_eq!(unsafe { &*cancelled }.error_code, FfiErrorCode::Validation);
        chirp_free_result(cancelled);

        chirp_future_free(future);
        chirp_client_free(client);
    }

    #[test]
    fn async_null_inputs_return_null() {
        let endpoint = CString::new("get_user").unwrap();
        assert!(chirp_call_async(std::ptr::null(), endpoint.as_ptr(), std::ptr::null()).is_null());
        let client = offline_client();
        assert!(chirp_call_async(client, std::ptr::null(), std::ptr::null()).is_null());
        chirp_client_free(client);
    }

    #[test]
    fn future_null_handling() {
        let result = chirp_future_peek(std::ptr::null_mut());
        assert_eq!(unsafe { &*result }.error_code, FfiErrorCode::NullArg);
        chirp_free_result(result);
        chirp_future_free(std::ptr::null_mut());
    }

    #[test]
    fn stream_open_reports_errors_through_out_param() {
        let client = offline_client();
        let endpoint = CString::new("get_user").unwrap();
        let args = CString::new(r#"{"nope": true}"#).unwrap();
        let mut error: *mut FfiCallResult = std::ptr::null_mut();
        let stream = chirp_stream_open(client, endpoint.as_ptr(), args.as_ptr(), &mut error);
        assert!(stream.is_null());
        assert!(!error.is_null());
        assert_eq!(unsafe { &*error }.error_code, FfiErrorCode::Validation);
        chirp_free_result(error);
        chirp_client_free(client);
    }

    #[test]
    fn stream_to_closed_port_ends_with_transport_error() {
        let client = offline_client();
        let endpoint = CString::new("stream_sample").unwrap();
        let stream = chirp_stream_open(client, endpoint.as_ptr(), std::ptr::null(), std::ptr::null_mut());
        assert!(!stream.is_null());

        let mut codes = Vec::new();
        for _ in 0..500 {
            let result = chirp_stream_next(stream);
            let code = unsafe { &*result }.error_code;
            chirp_free_result(result);
            match code {
                FfiErrorCode::Pending => std::thread::sleep(std::time::Duration::from_millis(10)),
                FfiErrorCode::Closed => break,
                other => codes.push(other),
            }
        }
        assert_eq!(codes, vec![FfiErrorCode::Transport]);
        assert!(!chirp_stream_is_active(stream));

        chirp_stream_free(stream);
        chirp_client_free(client);
    }

    #[test]
    fn stream_null_handling() {
        assert!(!chirp_stream_is_active(std::ptr::null_mut()));
        chirp_stream_close(std::ptr::null_mut());
        chirp_stream_free(std::ptr::null_mut());
        let result = chirp_stream_next(std::ptr::null_mut());
        assert_eq!(unsafe { &*result }.error_code, FfiErrorCode::NullArg);
        chirp_free_result(result);
    }

    #[test]
    fn free_result_and_string_null_are_safe() {
        chirp_free_result(std::ptr::null_mut());
        chirp_free_string(std::ptr::null_mut());
    }
}
