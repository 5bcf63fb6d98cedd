//! C ABI for linking mediation-core as a static library from Android (NDK) or other C/C++ hosts.
//! Hosts that run their own HTTP stack use these to share the rate limiter and parser.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;

use crate::candidate::{AdFormat, AdUnitContext};
use crate::error::ParseError;
use crate::rate_limit::RateLimiter;
use crate::response::parse_response;

/// Bumped when a signature below changes.
pub const ABI_VERSION: u32 = 1;

/// Returns the ABI version. Used so the staticlib exports a C symbol and is linkable.
#[no_mangle]
pub extern "C" fn mediation_core_abi_version() -> u32 {
    ABI_VERSION
}

/// 0 banner, 1 interstitial, 2 rewarded, 3 native.
fn format_from_c(format: c_int) -> Option<AdFormat> {
    match format {
        0 => Some(AdFormat::Banner),
        1 => Some(AdFormat::Interstitial),
        2 => Some(AdFormat::Rewarded),
        3 => Some(AdFormat::Native),
        _ => None,
    }
}

/// Borrow a UTF-8 string from (ptr, len). Null ptr or len 0 reads as None.
unsafe fn opt_str<'a>(ptr: *const u8, len: usize) -> Result<Option<&'a str>, ()> {
    if ptr.is_null() || len == 0 {
        return Ok(None);
    }
    let bytes = slice::from_raw_parts(ptr, len);
    std::str::from_utf8(bytes).map(Some).map_err(|_| ())
}

/// Create a rate limiter. Returns opaque handle; free with mediation_rate_limiter_destroy.
#[no_mangle]
pub extern "C" fn mediation_rate_limiter_create() -> *mut c_void {
    Box::into_raw(Box::new(RateLimiter::new())) as *mut c_void
}

/// Destroy rate limiter. No-op if h is null.
#[no_mangle]
pub extern "C" fn mediation_rate_limiter_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut RateLimiter) };
}

/// Register a block for an ad unit. duration_ms <= 0 clears it. reason may be null.
/// Returns 0 on success, -1 on null handle / id or invalid UTF-8.
#[no_mangle]
pub extern "C" fn mediation_rate_limiter_register(
    h: *mut c_void,
    ad_unit_id: *const u8,
    ad_unit_id_len: usize,
    duration_ms: i64,
    reason: *const u8,
    reason_len: usize,
) -> c_int {
    if h.is_null() {
        return -1;
    }
    let limiter = unsafe { &*(h as *const RateLimiter) };
    let id = match unsafe { opt_str(ad_unit_id, ad_unit_id_len) } {
        Ok(Some(s)) => s,
        _ => return -1,
    };
    let reason = match unsafe { opt_str(reason, reason_len) } {
        Ok(r) => r,
        Err(()) => return -1,
    };
    limiter.register(id, Some(duration_ms), reason);
    0
}

/// Returns 1 if the ad unit is blocked, 0 if not, -1 on error.
#[no_mangle]
pub extern "C" fn mediation_rate_limiter_is_blocked(
    h: *mut c_void,
    ad_unit_id: *const u8,
    ad_unit_id_len: usize,
) -> c_int {
    if h.is_null() {
        return -1;
    }
    let limiter = unsafe { &*(h as *const RateLimiter) };
    match unsafe { opt_str(ad_unit_id, ad_unit_id_len) } {
        Ok(Some(id)) => limiter.is_blocked(id) as c_int,
        _ => -1,
    }
}

/// Milliseconds left on the block, 0 when not blocked, -1 on error.
#[no_mangle]
pub extern "C" fn mediation_rate_limiter_remaining_ms(
    h: *mut c_void,
    ad_unit_id: *const u8,
    ad_unit_id_len: usize,
) -> i64 {
    if h.is_null() {
        return -1;
    }
    let limiter = unsafe { &*(h as *const RateLimiter) };
    match unsafe { opt_str(ad_unit_id, ad_unit_id_len) } {
        Ok(Some(id)) => limiter
            .remaining(id)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0),
        _ => -1,
    }
}

/// Parse a response body. Returns the candidate count (>= 1), or the negated ErrorReason code
/// (-5 bad body, -6 bad header data, -7 warming up, -8 no fill), or -1 on bad arguments.
/// out_refresh_ms (may be null) receives the refresh hint for warming up and no fill.
#[no_mangle]
pub extern "C" fn mediation_parse_response(
    body: *const u8,
    body_len: usize,
    format: c_int,
    out_refresh_ms: *mut u64,
) -> c_int {
    match parse_candidates(body, body_len, format) {
        Ok(batch_len) => count_to_c(batch_len),
        Err(FfiParseError::Args) => -1,
        Err(FfiParseError::Parse(e)) => {
            if let ParseError::NoFill { refresh } | ParseError::WarmingUp { refresh } = &e {
                if !out_refresh_ms.is_null() {
                    unsafe {
                        *out_refresh_ms = refresh.as_millis() as u64;
                    }
                }
            }
            -e.reason().code()
        }
    }
}

/// Parse a response body and write its candidates to out_buf as a JSON array (UTF-8, not NUL-terminated).
/// Returns bytes written, the negated ErrorReason code on parse failure, or -1 on bad arguments / out_buf too small.
#[no_mangle]
pub extern "C" fn mediation_parse_response_json(
    body: *const u8,
    body_len: usize,
    format: c_int,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if body.is_null() || out_buf.is_null() {
        return -1;
    }
    let Some(format) = format_from_c(format) else {
        return -1;
    };
    let bytes = unsafe { slice::from_raw_parts(body, body_len) };
    let ctx = AdUnitContext::new("", format);
    let batch = match parse_response(bytes, &ctx).and_then(|p| p.batch) {
        Ok(b) => b,
        Err(e) => return -e.reason().code(),
    };
    let json = match serde_json::to_vec(&batch.candidates) {
        Ok(j) => j,
        Err(_) => return -1,
    };
    let written = count_to_c(json.len());
    if written < 0 || json.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(json.as_ptr(), json.len());
    }
    written
}

/// Counts past c_int::MAX come back as -1.
fn count_to_c(n: usize) -> c_int {
    c_int::try_from(n).unwrap_or(-1)
}

enum FfiParseError {
    Args,
    Parse(ParseError),
}

fn parse_candidates(body: *const u8, body_len: usize, format: c_int) -> Result<usize, FfiParseError> {
    if body.is_null() {
        return Err(FfiParseError::Args);
    }
    let format = format_from_c(format).ok_or(FfiParseError::Args)?;
    let bytes = unsafe { slice::from_raw_parts(body, body_len) };
    let ctx = AdUnitContext::new("", format);
    let parsed = parse_response(bytes, &ctx).map_err(FfiParseError::Parse)?;
    parsed
        .batch
        .map(|b| b.len())
        .map_err(FfiParseError::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    const BODY: &str = r#"{"ad-responses":[
        {"content":"<a/>","metadata":{"x-adtype":"html"}},
        {"content":"<b/>","metadata":{"x-adtype":"mraid"}}
    ]}"#;

    #[test]
    fn limiter_roundtrip() {
        let h = mediation_rate_limiter_create();
        let id = b"unit-1";
        assert_eq!(mediation_rate_limiter_is_blocked(h, id.as_ptr(), id.len()), 0);
        let reason = b"busy";
        assert_eq!(
            mediation_rate_limiter_register(h, id.as_ptr(), id.len(), 60_000, reason.as_ptr(), reason.len()),
            0
        );
        assert_eq!(mediation_rate_limiter_is_blocked(h, id.as_ptr(), id.len()), 1);
        assert!(mediation_rate_limiter_remaining_ms(h, id.as_ptr(), id.len()) > 0);
        assert_eq!(
            mediation_rate_limiter_register(h, id.as_ptr(), id.len(), 0, ptr::null(), 0),
            0
        );
        assert_eq!(mediation_rate_limiter_is_blocked(h, id.as_ptr(), id.len()), 0);
        assert_eq!(mediation_rate_limiter_remaining_ms(h, id.as_ptr(), id.len()), 0);
        mediation_rate_limiter_destroy(h);
    }

    #[test]
    fn null_arguments_rejected() {
        assert_eq!(mediation_rate_limiter_is_blocked(ptr::null_mut(), ptr::null(), 0), -1);
        let h = mediation_rate_limiter_create();
        assert_eq!(mediation_rate_limiter_is_blocked(h, ptr::null(), 0), -1);
        assert_eq!(
            mediation_rate_limiter_register(h, ptr::null(), 0, 10, ptr::null(), 0),
            -1
        );
        mediation_rate_limiter_destroy(h);
        mediation_rate_limiter_destroy(ptr::null_mut());
        assert_eq!(mediation_parse_response(ptr::null(), 0, 0, ptr::null_mut()), -1);
    }

    #[test]
    fn oversized_counts_are_an_error() {
        assert_eq!(count_to_c(3), 3);
        assert_eq!(count_to_c(c_int::MAX as usize), c_int::MAX);
        assert_eq!(count_to_c(c_int::MAX as usize + 1), -1);
        assert_eq!(count_to_c(usize::MAX), -1);
    }

    #[test]
    fn parse_counts_candidates() {
        let mut refresh = 0u64;
        let n = mediation_parse_response(BODY.as_ptr(), BODY.len(), 0, &mut refresh);
        assert_eq!(n, 2);
        assert_eq!(refresh, 0);
        assert_eq!(mediation_parse_response(BODY.as_ptr(), BODY.len(), 9, &mut refresh), -1);
    }

    #[test]
    fn parse_reports_no_fill_refresh() {
        let body = r#"{"ad-responses":[{"metadata":{"x-adtype":"clear","x-refreshtime":20}}]}"#;
        let mut refresh = 0u64;
        let n = mediation_parse_response(body.as_ptr(), body.len(), 1, &mut refresh);
        assert_eq!(n, -8);
        assert_eq!(refresh, 20_000);

        let garbage = b"not json";
        assert_eq!(
            mediation_parse_response(garbage.as_ptr(), garbage.len(), 1, ptr::null_mut()),
            -5
        );
    }

    #[test]
    fn parse_json_writes_candidates() {
        let mut out = vec![0u8; 8192];
        let n = mediation_parse_response_json(BODY.as_ptr(), BODY.len(), 3, out.as_mut_ptr(), out.len());
        assert!(n > 0);
        let v: serde_json::Value = serde_json::from_slice(&out[..n as usize]).unwrap();
        assert_eq!(v.as_array().unwrap().len(), 2);
        assert_eq!(v[1]["ad_type"], "mraid");
        assert_eq!(v[0]["format"], "native");

        let mut tiny = [0u8; 4];
        assert_eq!(
            mediation_parse_response_json(BODY.as_ptr(), BODY.len(), 3, tiny.as_mut_ptr(), tiny.len()),
            -1
        );
    }
}
