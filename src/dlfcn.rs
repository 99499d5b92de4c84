//! C ABI entry points.
//!
//! These are exported as `memdyld_dlopen` and friends so they never clash
//! with the host's libc, and registered under the Darwin names `_dlopen`,
//! `_dlsym`, `_dlclose` and `_dlerror` so that loaded images calling those
//! end up here. Handles are `Box<Image>` pointers.

use crate::dyld::dlopen::{self, DLOPEN_ERROR_PREFIX, DLSYM_ERROR_PREFIX};
use crate::dyld::{Image, LinkContext};
use libc::{c_char, c_int, c_void};
use macros::dyld_export;
use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::warn;

/// Load a dylib. Returns null and sets the `dlerror` message on failure.
///
/// The mode is accepted for compatibility and ignored: binding is always
/// immediate and symbols are never made global.
#[dyld_export]
pub fn dlopen(path: *const c_char, _mode: c_int) -> *mut c_void {
    dlopen::clear_error();
    if path.is_null() {
        dlopen::set_error(DLOPEN_ERROR_PREFIX, "null path");
        return std::ptr::null_mut();
    }
    // SAFETY: the caller passes a NUL-terminated path.
    let path = Path::new(OsStr::from_bytes(unsafe { CStr::from_ptr(path) }.to_bytes()));
    let ctx = LinkContext::from_env();
    match dlopen::open(path, &ctx) {
        Ok(image) => Box::into_raw(Box::new(image)) as *mut c_void,
        Err(e) => {
            warn!("dlopen: failed to load {}: {}", path.display(), e);
            dlopen::set_error(DLOPEN_ERROR_PREFIX, e);
            std::ptr::null_mut()
        }
    }
}

/// Look up `symbol` (without its leading underscore) in a handle returned
/// by [`memdyld_dlopen`].
#[dyld_export]
pub fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void {
    dlopen::clear_error();
    if handle.is_null() || symbol.is_null() {
        dlopen::set_error(DLSYM_ERROR_PREFIX, "null handle or symbol");
        return std::ptr::null_mut();
    }
    // SAFETY: non-null handles come from `memdyld_dlopen` and stay valid
    // until `memdyld_dlclose`.
    let image = unsafe { &*(handle as *const Image) };
    // SAFETY: the caller passes a NUL-terminated name.
    let name = unsafe { CStr::from_ptr(symbol) }.to_string_lossy();
    let ctx = LinkContext::from_env();
    match dlopen::symbol_address(image, &name, &ctx) {
        Ok(address) => address as *mut c_void,
        Err(e) => {
            dlopen::set_error(DLSYM_ERROR_PREFIX, e);
            std::ptr::null_mut()
        }
    }
}

/// Unload a handle. Always succeeds.
#[dyld_export]
pub fn dlclose(handle: *mut c_void) -> c_int {
    if !handle.is_null() {
        // SAFETY: the handle was produced by `Box::into_raw` in
        // `memdyld_dlopen` and is not used again by the caller.
        let image = unsafe { Box::from_raw(handle as *mut Image) };
        dlopen::close(*image);
    }
    0
}

/// The pending error message for this thread, or null.
#[dyld_export]
pub fn dlerror() -> *mut c_char {
    dlopen::take_error()
}

/// Lazy binding is resolved at load time, so the binder is never reached
/// through a stub. Imports of it bind here.
#[dyld_export("dyld_stub_binder")]
fn stub_binder() {}
