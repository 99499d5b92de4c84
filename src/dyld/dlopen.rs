//! Dynamic Loading API Implementation
//!
//! Rust-level open/lookup/close over [`Image`], plus the per-thread error
//! cell that backs the C `dlerror` contract.

use super::{Image, LinkContext};
use crate::mmap::MappedFile;
use crate::{Error, Result};
use std::cell::RefCell;
use std::ffi::CString;
use std::fmt::Display;
use std::path::Path;
use tracing::debug;

pub const DLOPEN_ERROR_PREFIX: &str = "Error happens during dlopen execution. ";
pub const DLSYM_ERROR_PREFIX: &str = "Error happens during dlsym execution. ";

/// Load the dylib at `path`, which must be absolute.
pub fn open(path: &Path, ctx: &LinkContext) -> Result<Image> {
    if !path.is_absolute() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not an absolute path", path.display()),
        )));
    }
    debug!("dlopen: loading {}", path.display());
    let file = MappedFile::open(path)?;
    let image = Image::load_from_memory(file.data(), ctx)?;
    debug!("dlopen: {} loaded at 0x{:x}", path.display(), image.base_address());
    Ok(image)
}

/// Address of the exported symbol `name`, given without its leading
/// underscore.
pub fn symbol_address(image: &Image, name: &str, ctx: &LinkContext) -> Result<usize> {
    let mangled = format!("_{}", name);
    let symbol = image
        .find_shallow_exported_symbol(&mangled)?
        .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;
    let address = image.exported_symbol_address(ctx, &symbol, false)?;
    debug!("dlsym: {} -> 0x{:x}", name, address);
    Ok(address)
}

/// Unload an image. Pointers into it dangle afterwards.
pub fn close(image: Image) {
    debug!("dlclose: unloading image at 0x{:x}", image.base_address());
    drop(image);
}

#[derive(Default)]
struct ErrorCell {
    pending: Option<CString>,
    /// Kept alive until the next `dlerror` call on this thread.
    returned: Option<CString>,
}

thread_local! {
    static LAST_ERROR: RefCell<ErrorCell> = RefCell::new(ErrorCell::default());
}

/// Record an error for the next `dlerror` call on this thread.
pub fn set_error(prefix: &str, error: impl Display) {
    let message = format!("{}{}", prefix, error).replace('\0', "\\0");
    let message = CString::new(message).ok();
    LAST_ERROR.with(|cell| cell.borrow_mut().pending = message);
}

/// Forget any pending error on this thread.
pub fn clear_error() {
    LAST_ERROR.with(|cell| cell.borrow_mut().pending = None);
}

/// Hand out the pending error as a C string, or null when there is none.
///
/// The pointer stays valid until the next call on this thread.
pub fn take_error() -> *mut libc::c_char {
    LAST_ERROR.with(|cell| {
        let mut cell = cell.borrow_mut();
        cell.returned = cell.pending.take();
        cell.returned
            .as_ref()
            .map_or(std::ptr::null_mut(), |message| message.as_ptr() as *mut _)
    })
}
