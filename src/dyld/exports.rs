//! Exports Trie Lookup
//!
//! The export trie lives in LINKEDIT and maps symbol names to export
//! information. A node starts with a ULEB128 terminal size; a non-zero size
//! is followed by the terminal payload (flags, then kind-specific values).
//! After the payload comes a one-byte child count and, per child, a
//! NUL-terminated edge label and the ULEB128 offset of the child node.

use super::leb128::read_uleb128;
use super::macho::c_str_at;
use super::{Image, ImageState, LinkContext};
use crate::{Error, Result};
use std::collections::HashSet;
use tracing::{debug, info, trace, warn};

// Export symbol flags from Apple's MachOTrie.hpp
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

/// Upper bound on nodes visited by a single walk.
const MAX_ITERATIONS: usize = 100_000;

/// Same-image re-exports followed before giving up.
const MAX_REEXPORT_DEPTH: usize = 8;

/// Upper bound on the name bytes built up while enumerating a trie.
const MAX_NAME_BYTES: usize = 64 << 20;

/// An exported symbol: the image it was found in and the offset of its
/// terminal payload in that image's export trie.
#[derive(Debug, Clone, Copy)]
pub struct Symbol<'image> {
    image: &'image Image,
    offset: usize,
}

impl<'image> Symbol<'image> {
    fn new(image: &'image Image, offset: usize) -> Self {
        Self { image, offset }
    }

    /// Offset of the terminal payload from the start of the trie.
    pub fn trie_offset(&self) -> usize {
        self.offset
    }

    /// True when this symbol was found in `image`.
    pub fn belongs_to(&self, image: &Image) -> bool {
        std::ptr::eq(self.image, image)
    }
}

impl PartialEq for Symbol<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.image, other.image) && self.offset == other.offset
    }
}

impl Eq for Symbol<'_> {}

/// Walk `trie` looking for `symbol`.
///
/// Returns the offset of the terminal payload (just past the terminal size)
/// on a match. Malformed nodes abort the walk with a warning and report the
/// symbol as not found.
pub fn trie_walk(trie: &[u8], symbol: &str) -> Option<usize> {
    let mut remaining = symbol.as_bytes();
    let mut node = 0usize;
    let mut iterations = 0usize;

    loop {
        iterations += 1;
        if iterations > MAX_ITERATIONS {
            warn!(
                "trie_walk: exceeded {} iterations looking up {}, aborting",
                MAX_ITERATIONS, symbol
            );
            return None;
        }

        let (terminal_size, bytes_read) = match read_uleb128(trie, node) {
            Ok(result) => result,
            Err(e) => {
                warn!("trie_walk: malformed trie node at 0x{:x}: {}", node, e);
                return None;
            }
        };
        let mut pos = node + bytes_read;
        if remaining.is_empty() && terminal_size != 0 {
            trace!("trie_walk: {} found at node 0x{:x}", symbol, node);
            return Some(pos);
        }

        let children = match usize::try_from(terminal_size)
            .ok()
            .and_then(|size| pos.checked_add(size))
        {
            Some(children) if children < trie.len() => children,
            _ => {
                warn!(
                    "trie_walk: malformed trie node, terminal size 0x{:x} extends past end of trie",
                    terminal_size
                );
                return None;
            }
        };
        let child_count = trie[children];
        pos = children + 1;

        let mut next = None;
        for _ in 0..child_count {
            let Some(label) = c_str_at(trie, pos) else {
                warn!("trie_walk: malformed trie node, edge label extends past end of trie");
                return None;
            };
            pos += label.len() + 1;
            let (child_offset, offset_bytes) = match read_uleb128(trie, pos) {
                Ok(result) => result,
                Err(e) => {
                    warn!("trie_walk: malformed trie child: {}", e);
                    return None;
                }
            };
            pos += offset_bytes;

            // Edges partition by first byte, so at most one can match.
            if !remaining.starts_with(label) {
                continue;
            }
            if child_offset == 0 || child_offset >= trie.len() as u64 {
                warn!(
                    "trie_walk: malformed trie child, node offset 0x{:x} out of range",
                    child_offset
                );
                return None;
            }
            remaining = &remaining[label.len()..];
            next = Some(child_offset as usize);
            break;
        }

        node = next?;
    }
}

/// Decoded terminal payload of an export node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportInfo {
    Regular { offset: u64 },
    StubAndResolver { stub: u64, resolver: u64 },
    ThreadLocal { offset: u64 },
    Absolute { value: u64 },
    ReExport { ordinal: u64, name: String },
}

/// Decode the terminal payload at `pos`.
pub fn read_export_info(trie: &[u8], pos: usize) -> Result<(u64, ExportInfo)> {
    let (flags, n) = read_uleb128(trie, pos)?;
    let mut pos = pos + n;
    if (flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0 {
        let (ordinal, n) = read_uleb128(trie, pos)?;
        pos += n;
        let name = c_str_at(trie, pos).ok_or_else(|| {
            Error::MalformedBinary("re-exported name extends past end of trie".to_string())
        })?;
        let name = String::from_utf8_lossy(name).into_owned();
        return Ok((flags, ExportInfo::ReExport { ordinal, name }));
    }
    let (value, n) = read_uleb128(trie, pos)?;
    pos += n;
    let kind = flags & EXPORT_SYMBOL_FLAGS_KIND_MASK;
    let unsupported = || {
        Error::UnsupportedFeature(format!(
            "unsupported exported symbol kind, flags=0x{:x} at node 0x{:x}",
            flags, pos
        ))
    };
    let info = match kind {
        EXPORT_SYMBOL_FLAGS_KIND_REGULAR if (flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER) != 0 => {
            let (resolver, _) = read_uleb128(trie, pos)?;
            ExportInfo::StubAndResolver {
                stub: value,
                resolver,
            }
        }
        EXPORT_SYMBOL_FLAGS_KIND_REGULAR => ExportInfo::Regular { offset: value },
        _ if (flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER) != 0 => return Err(unsupported()),
        EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL => ExportInfo::ThreadLocal { offset: value },
        EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE => ExportInfo::Absolute { value },
        _ => return Err(unsupported()),
    };
    Ok((flags, info))
}

/// Call a resolver function found in a loaded image.
fn call_resolver(address: usize) -> usize {
    // SAFETY: the address comes from the export trie of a mapped image and
    // names a resolver taking no arguments.
    let resolver: extern "C" fn() -> usize = unsafe { std::mem::transmute(address) };
    resolver()
}

impl Image {
    /// The export trie bytes, or `None` when the image has none.
    fn export_trie(&self) -> Result<Option<&[u8]>> {
        let Some(info) = self.dyld_info() else {
            return Ok(None);
        };
        if info.export_size == 0 {
            return Ok(None);
        }
        Ok(Some(self.linkedit_slice(info.export_off, info.export_size)?))
    }

    /// Find `symbol` (already mangled) in this image's export trie.
    pub fn find_shallow_exported_symbol(&self, symbol: &str) -> Result<Option<Symbol<'_>>> {
        self.require_state(ImageState::MetadataParsed, "symbol lookup")?;
        let Some(trie) = self.export_trie()? else {
            return Ok(None);
        };

        let mut name = symbol.to_string();
        for _ in 0..MAX_REEXPORT_DEPTH {
            let Some(pos) = trie_walk(trie, &name) else {
                return Ok(None);
            };
            let (flags, n) = read_uleb128(trie, pos)?;
            if (flags & EXPORT_SYMBOL_FLAGS_REEXPORT) == 0 {
                return Ok(Some(Symbol::new(self, pos)));
            }
            let (ordinal, m) = read_uleb128(trie, pos + n)?;
            if ordinal > 0 {
                return Err(Error::UnsupportedFeature(format!(
                    "symbol {} was found not in current module (ordinal {})",
                    name, ordinal
                )));
            }
            let alternate = c_str_at(trie, pos + n + m).unwrap_or_default();
            if alternate.is_empty() || alternate == name.as_bytes() {
                return Ok(None);
            }
            let alternate = String::from_utf8_lossy(alternate).into_owned();
            debug!("{} is re-exported from this image as {}", name, alternate);
            name = alternate;
        }
        warn!("re-export chain for {} is too deep", symbol);
        Ok(None)
    }

    /// Compute the address of an exported symbol.
    pub fn exported_symbol_address(
        &self,
        ctx: &LinkContext,
        symbol: &Symbol<'_>,
        run_resolver: bool,
    ) -> Result<usize> {
        self.exported_symbol_address_with(ctx, symbol, run_resolver, call_resolver)
    }

    /// Like [`Image::exported_symbol_address`], with the resolver invocation
    /// supplied by the caller.
    pub fn exported_symbol_address_with<F>(
        &self,
        ctx: &LinkContext,
        symbol: &Symbol<'_>,
        run_resolver: bool,
        call: F,
    ) -> Result<usize>
    where
        F: FnOnce(usize) -> usize,
    {
        if !symbol.belongs_to(self) {
            return Err(Error::SymbolNotFound(format!(
                "symbol at trie offset 0x{:x} was found in another image",
                symbol.offset
            )));
        }
        let trie = self
            .export_trie()?
            .ok_or_else(|| Error::MalformedBinary("symbol is not in trie".to_string()))?;
        if symbol.offset >= trie.len() {
            return Err(Error::MalformedBinary("symbol is not in trie".to_string()));
        }
        let base = self.base_address();
        let (_, info) = read_export_info(trie, symbol.offset)?;
        match info {
            ExportInfo::Regular { offset } | ExportInfo::ThreadLocal { offset } => {
                Ok(base.wrapping_add(offset as usize))
            }
            ExportInfo::StubAndResolver { stub, resolver } => {
                if !run_resolver {
                    return Ok(base.wrapping_add(stub as usize));
                }
                let resolver = base.wrapping_add(resolver as usize);
                let result = call(resolver);
                if ctx.verbose_bind {
                    info!("resolver at 0x{:x} returned 0x{:08x}", resolver, result);
                }
                Ok(result)
            }
            ExportInfo::Absolute { value } => Ok(value as usize),
            ExportInfo::ReExport { name, .. } => Err(Error::UnsupportedFeature(format!(
                "re-export of {} has no address in this image",
                name
            ))),
        }
    }

    /// Find and resolve a mangled symbol name without running resolvers.
    pub fn lookup_export(&self, ctx: &LinkContext, symbol: &str) -> Result<Option<usize>> {
        match self.find_shallow_exported_symbol(symbol)? {
            Some(sym) => Ok(Some(self.exported_symbol_address(ctx, &sym, false)?)),
            None => Ok(None),
        }
    }

    /// Enumerate every terminal node of the export trie, re-exports
    /// included.
    pub fn exports(&self) -> Result<Vec<(String, Symbol<'_>)>> {
        let Some(trie) = self.export_trie()? else {
            return Ok(Vec::new());
        };
        Ok(walk_exports(trie)
            .into_iter()
            .map(|(name, offset)| (name, Symbol::new(self, offset)))
            .collect())
    }
}

/// Collect `(name, terminal payload offset)` for every export in `trie`,
/// sorted by name.
///
/// Each node is visited at most once, so a trie whose edges loop back or
/// converge is cut at the repeated node.
pub fn walk_exports(trie: &[u8]) -> Vec<(String, usize)> {
    let mut exports = Vec::new();
    let mut visited = HashSet::from([0usize]);
    let mut name_bytes = 0usize;

    // Start at the root node with empty prefix
    let mut stack: Vec<(usize, Vec<u8>)> = vec![(0, Vec::new())];
    let mut iterations = 0usize;

    'walk: while let Some((node_offset, current_symbol)) = stack.pop() {
        iterations += 1;
        if iterations > MAX_ITERATIONS {
            warn!(
                "exports: exceeded {} iterations, stack size={}, aborting",
                MAX_ITERATIONS,
                stack.len()
            );
            break;
        }
        let (terminal_size, bytes_read) = match read_uleb128(trie, node_offset) {
            Ok(result) => result,
            Err(_) => continue,
        };
        let mut pos = node_offset + bytes_read;
        if terminal_size > 0 && !current_symbol.is_empty() {
            exports.push((
                String::from_utf8_lossy(&current_symbol).into_owned(),
                pos,
            ));
        }
        pos = pos.saturating_add(terminal_size as usize);
        let Some(&num_children) = trie.get(pos) else {
            continue;
        };
        pos += 1;

        for _ in 0..num_children {
            let Some(label) = c_str_at(trie, pos) else {
                break;
            };
            pos += label.len() + 1;
            let (child_offset, offset_bytes) = match read_uleb128(trie, pos) {
                Ok(result) => result,
                Err(_) => break,
            };
            pos += offset_bytes;

            if child_offset >= trie.len() as u64 {
                continue;
            }
            if !visited.insert(child_offset as usize) {
                warn!(
                    "exports: trie node 0x{:x} is reached twice, skipping",
                    child_offset
                );
                continue;
            }
            let mut child_symbol = current_symbol.clone();
            child_symbol.extend_from_slice(label);
            name_bytes += child_symbol.len();
            if name_bytes > MAX_NAME_BYTES {
                warn!(
                    "exports: symbol names exceed {} bytes, aborting",
                    MAX_NAME_BYTES
                );
                break 'walk;
            }
            stack.push((child_offset as usize, child_symbol));
        }
    }

    exports.sort_by(|a, b| a.0.cmp(&b.0));
    exports
}
