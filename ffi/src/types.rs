//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Objects cross the boundary as JSON text plus a type tag, so C callers
//! need no knowledge of the tagged tree. Clients, futures and streams are
//! opaque boxes. Every outcome, success or failure, is an `FfiCallResult`.

use std::ffi::CString;
use std::os::raw::c_char;

use chirp_core::{ApiFuture, ApiObject, Error, StreamHandle};

/// Opaque handle to a `Client`.
pub struct FfiClient {
    pub(crate) inner: chirp_core::Client,
}

/// Opaque handle to an in-flight asynchronous call.
pub struct FfiFuture {
    pub(crate) inner: ApiFuture<ApiObject>,
}

/// Opaque handle to an open stream.
pub struct FfiStream {
    pub(crate) inner: StreamHandle,
}

/// Outcome category of an `FfiCallResult`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    /// Not resolved yet, or no stream record available right now.
    Pending = 1,
    /// The stream is closed and fully drained.
    Closed = 2,
    Validation = 3,
    Catalog = 4,
    Transport = 5,
    Api = 6,
    Http = 7,
    Decode = 8,
    Auth = 9,
    Cancelled = 10,
    NotRepeatable = 11,
    Engine = 12,
    InvalidArgs = 13,
    NullArg = 14,
    Panic = 15,
}

impl From<&Error> for FfiErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Validation(_) => FfiErrorCode::Validation,
            Error::Catalog(_) => FfiErrorCode::Catalog,
            Error::Transport(_) => FfiErrorCode::Transport,
            Error::Api(_) => FfiErrorCode::Api,
            Error::Http { .. } => FfiErrorCode::Http,
            Error::Decode { .. } => FfiErrorCode::Decode,
            Error::Auth(_) => FfiErrorCode::Auth,
            Error::Cancelled => FfiErrorCode::Cancelled,
            Error::NotRepeatable { .. } => FfiErrorCode::NotRepeatable,
            Error::Engine(_) => FfiErrorCode::Engine,
        }
    }
}

/// Result envelope for every call, future and stream read.
///
/// On success `json` holds the object and `type_tag` its tag (null for
/// untyped results). On failure `error_message` is set, and `http_status`
/// and `api_code` are filled in when the server answered (`0` otherwise).
/// Free with `chirp_free_result`.
#[repr(C)]
pub struct FfiCallResult {
    pub error_code: FfiErrorCode,
    pub error_message: *mut c_char,
    pub http_status: u16,
    pub api_code: i64,
    pub type_tag: *mut c_char,
    pub json: *mut c_char,
}

/// Heap C string; interior NULs are dropped rather than failing.
pub(crate) fn c_string(s: &str) -> *mut c_char {
    CString::new(s.replace('\0', ""))
        .unwrap_or_default()
        .into_raw()
}

impl FfiCallResult {
    fn boxed(self) -> *mut Self {
        Box::into_raw(Box::new(self))
    }

    fn empty(error_code: FfiErrorCode, message: Option<&str>) -> Self {
        FfiCallResult {
            error_code,
            error_message: message.map_or(std::ptr::null_mut(), c_string),
            http_status: 0,
            api_code: 0,
            type_tag: std::ptr::null_mut(),
            json: std::ptr::null_mut(),
        }
    }

    pub(crate) fn from_object(object: &ApiObject) -> *mut Self {
        FfiCallResult {
            http_status: object.status(),
            type_tag: object.tag().map_or(std::ptr::null_mut(), c_string),
            json: c_string(&object.to_json().to_string()),
            ..Self::empty(FfiErrorCode::Ok, None)
        }
        .boxed()
    }

    pub(crate) fn from_error(err: &Error) -> *mut Self {
        FfiCallResult {
            http_status: err.status().unwrap_or(0),
            api_code: err.api_code().unwrap_or(0),
            ..Self::empty(err.into(), Some(&err.to_string()))
        }
        .boxed()
    }

    pub(crate) fn from_outcome(outcome: &Result<ApiObject, Error>) -> *mut Self {
        match outcome {
            Ok(object) => Self::from_object(object),
            Err(err) => Self::from_error(err),
        }
    }

    pub(crate) fn pending() -> *mut Self {
        Self::empty(FfiErrorCode::Pending, None).boxed()
    }

    pub(crate) fn closed() -> *mut Self {
        Self::empty(FfiErrorCode::Closed, None).boxed()
    }

    pub(crate) fn invalid_args(reason: &str) -> *mut Self {
        Self::empty(FfiErrorCode::InvalidArgs, Some(&format!("invalid arguments: {reason}"))).boxed()
    }

    pub(crate) fn null_arg(name: &str) -> *mut Self {
        Self::empty(FfiErrorCode::NullArg, Some(&format!("null argument: {name}"))).boxed()
    }

    pub(crate) fn panic(msg: &str) -> *mut Self {
        Self::empty(FfiErrorCode::Panic, Some(msg)).boxed()
    }
}
