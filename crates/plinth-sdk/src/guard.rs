//! Panic guards for exported entry points.
//!
//! A plugin should never let a panic reach the host. Handlers generated by
//! [`export_handler!`](crate::export_handler) turn panics into a 500 response;
//! the host still catches anything that escapes, but that path loses the
//! plugin's own error message.

use std::panic::{catch_unwind, AssertUnwindSafe};

pub use plinth_abi::panic_message;
use plinth_abi::{PlinthBuffer, RequestEnvelope, ResponseEnvelope};

use crate::buffer::export_vec;

/// Run `f`, returning `default` if it panics.
pub fn guard_with_default<T>(op: &'static str, default: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            eprintln!("plinth plugin: panic in `{op}`: {}", panic_message(payload));
            default
        }
    }
}

/// Decode the host's request, run `handler`, and export the encoded response.
///
/// Malformed requests get a 400, panics a 500. The returned buffer is owned by
/// this library.
///
/// # Safety
///
/// `ptr` must be valid for reads of `len` bytes for the duration of the call.
pub unsafe fn handle_request<F>(ptr: *const u8, len: usize, handler: F) -> PlinthBuffer
where
    F: FnOnce(RequestEnvelope) -> ResponseEnvelope,
{
    let borrowed = PlinthBuffer { ptr, len, cap: 0 };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let Some(bytes) = (unsafe { borrowed.as_slice() }) else {
            return ResponseEnvelope::text(400, "null request buffer");
        };
        match RequestEnvelope::decode(bytes) {
            Ok(request) => handler(request),
            Err(e) => ResponseEnvelope::text(400, format!("malformed request envelope: {e}")),
        }
    }));

    let response = outcome.unwrap_or_else(|payload| {
        ResponseEnvelope::text(500, format!("handler panicked: {}", panic_message(payload)))
    });

    match response.encode() {
        Ok(bytes) => export_vec(bytes),
        Err(_) => export_vec(br#"{"status":500}"#.to_vec()),
    }
}
