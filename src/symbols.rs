//! Loader-provided definitions for imports of loaded images.
//!
//! An image that imports `_dlopen` or `dyld_stub_binder` must reach this
//! loader rather than the platform dyld, otherwise anything it opens would
//! bypass the in-memory handles. Functions marked `#[dyld_export]` register an
//! [`InternalExport`] here, and import binding checks this table before asking
//! the host process.

use linkme::distributed_slice;

/// Entry address of a loader function, stored in a `static`.
#[derive(Clone, Copy, Debug)]
pub struct CodeAddress(pub *const ());

// SAFETY: the pointer is a function entry point in the loader's text.
unsafe impl Sync for CodeAddress {}

/// A Darwin import name and the loader function that satisfies it.
#[derive(Debug)]
pub struct InternalExport {
    /// The name as it appears in bind opcodes, leading underscore included.
    pub import_name: &'static str,
    pub code: CodeAddress,
}

impl InternalExport {
    pub fn address(&self) -> usize {
        self.code.0 as usize
    }
}

#[distributed_slice]
pub static INTERNAL_EXPORTS: [InternalExport] = [..];

/// Every import this loader satisfies itself.
pub fn internal_exports() -> impl Iterator<Item = &'static InternalExport> {
    INTERNAL_EXPORTS.iter()
}

/// Address that a bind of `import_name` should write, if the loader
/// provides the symbol.
pub fn lookup(import_name: &str) -> Option<usize> {
    internal_exports()
        .find(|export| export.import_name == import_name)
        .map(InternalExport::address)
}
