//! Dyld Bind/Rebase Opcode Parsing
//!
//! Images with `LC_DYLD_INFO[_ONLY]` describe their fixups as opcode streams
//! in LINKEDIT (the "compressed" format in Apple's terminology). Rebases
//! slide pointers that were linked against the preferred address; binds
//! store the address of an imported symbol.

use super::leb128::{read_sleb128, read_uleb128};
use super::macho::c_str_at;
use super::{Image, LinkContext};
use crate::{Error, Result, symbols};
use scroll::{LE, Pread, Pwrite};
use std::ffi::CString;
use std::sync::Arc;
use tracing::{debug, info, trace};

pub const REBASE_TYPE_POINTER: u8 = 1;
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;

pub const REBASE_OPCODE_DONE: u8 = 0x00;
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
pub const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
pub const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
pub const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

pub const BIND_TYPE_POINTER: u8 = 1;
pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;

pub const BIND_SPECIAL_DYLIB_SELF: i64 = 0;
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i64 = -1;
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i64 = -3;

pub const BIND_OPCODE_DONE: u8 = 0x00;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
pub const BIND_OPCODE_THREADED: u8 = 0xD0;

const OPCODE_MASK: u8 = 0xF0;
const IMMEDIATE_MASK: u8 = 0x0F;
const POINTER_SIZE: u64 = 8;

/// Upper bound on entries produced by one opcode stream.
const MAX_ENTRIES: usize = 1 << 24;

/// A pointer rebase entry from LC_DYLD_INFO_ONLY rebase opcodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseEntry {
    pub rebase_type: u8,
    pub segment_index: u8,
    pub segment_offset: u64,
}

/// A symbol binding from the bind or lazy bind opcodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindEntry {
    /// Shared by every entry a run of bind opcodes produces.
    pub symbol_name: Arc<str>,
    /// 1-based dependent library index, 0 for self, negative for special
    /// lookups.
    pub lib_ordinal: i64,
    pub weak_import: bool,
    pub bind_type: u8,
    pub addend: i64,
    pub segment_index: u8,
    pub segment_offset: u64,
}

/// Check that `count` fixups of `width` bytes, `stride` bytes apart and
/// starting at `offset`, all land inside segment `index`.
///
/// `segment_sizes` holds the VM size of every segment in the image.
fn check_run(
    segment_sizes: &[u64],
    index: u8,
    offset: u64,
    count: u64,
    stride: u64,
    width: u64,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let end = (count - 1)
        .checked_mul(stride)
        .and_then(|span| span.checked_add(offset))
        .and_then(|last| last.checked_add(width));
    match (segment_sizes.get(index as usize), end) {
        (Some(&size), Some(end)) if end <= size => Ok(()),
        _ => Err(Error::MalformedBinary(format!(
            "{} fixup(s) at segment {} offset 0x{:x} run outside the segment",
            count, index, offset
        ))),
    }
}

fn rebase_width(rebase_type: u8) -> u64 {
    if rebase_type == REBASE_TYPE_TEXT_ABSOLUTE32 { 4 } else { POINTER_SIZE }
}

fn push_entry<T>(entries: &mut Vec<T>, entry: T) -> Result<()> {
    if entries.len() >= MAX_ENTRIES {
        return Err(Error::MalformedBinary(format!(
            "more than {} fixups in one opcode stream",
            MAX_ENTRIES
        )));
    }
    entries.push(entry);
    Ok(())
}

/// Parse dyld rebase info opcodes.
///
/// Rebase opcodes encode locations of pointers that need to be adjusted
/// by the slide amount when the image is loaded at a different address
/// than its preferred load address. Every location must fall inside one of
/// the segments described by `segment_sizes`.
pub fn parse_rebase_info(data: &[u8], segment_sizes: &[u64]) -> Result<Vec<RebaseEntry>> {
    let mut rebases = Vec::new();
    let mut i = 0;

    let mut rebase_type = 0u8;
    let mut segment_index = 0u8;
    let mut segment_offset = 0u64;

    while i < data.len() {
        let opcode = data[i];
        let immediate = opcode & IMMEDIATE_MASK;
        i += 1;

        match opcode & OPCODE_MASK {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => rebase_type = immediate,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment_index = immediate;
                let (offset, n) = read_uleb128(data, i)?;
                segment_offset = offset;
                i += n;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                let (addr_add, n) = read_uleb128(data, i)?;
                segment_offset = segment_offset.wrapping_add(addr_add);
                i += n;
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                segment_offset = segment_offset.wrapping_add(immediate as u64 * POINTER_SIZE);
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                check_run(
                    segment_sizes,
                    segment_index,
                    segment_offset,
                    immediate as u64,
                    POINTER_SIZE,
                    rebase_width(rebase_type),
                )?;
                for _ in 0..immediate {
                    push_entry(
                        &mut rebases,
                        RebaseEntry {
                            rebase_type,
                            segment_index,
                            segment_offset,
                        },
                    )?;
                    segment_offset = segment_offset.wrapping_add(POINTER_SIZE);
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let (count, n) = read_uleb128(data, i)?;
                i += n;
                check_run(
                    segment_sizes,
                    segment_index,
                    segment_offset,
                    count,
                    POINTER_SIZE,
                    rebase_width(rebase_type),
                )?;
                for _ in 0..count {
                    push_entry(
                        &mut rebases,
                        RebaseEntry {
                            rebase_type,
                            segment_index,
                            segment_offset,
                        },
                    )?;
                    segment_offset = segment_offset.wrapping_add(POINTER_SIZE);
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                check_run(
                    segment_sizes,
                    segment_index,
                    segment_offset,
                    1,
                    POINTER_SIZE,
                    rebase_width(rebase_type),
                )?;
                push_entry(
                    &mut rebases,
                    RebaseEntry {
                        rebase_type,
                        segment_index,
                        segment_offset,
                    },
                )?;
                let (addr_add, n) = read_uleb128(data, i)?;
                segment_offset = segment_offset
                    .wrapping_add(addr_add)
                    .wrapping_add(POINTER_SIZE);
                i += n;
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let (count, count_bytes) = read_uleb128(data, i)?;
                let (skip, skip_bytes) = read_uleb128(data, i + count_bytes)?;
                i += count_bytes + skip_bytes;
                check_run(
                    segment_sizes,
                    segment_index,
                    segment_offset,
                    count,
                    skip.checked_add(POINTER_SIZE).unwrap_or(u64::MAX),
                    rebase_width(rebase_type),
                )?;
                for _ in 0..count {
                    push_entry(
                        &mut rebases,
                        RebaseEntry {
                            rebase_type,
                            segment_index,
                            segment_offset,
                        },
                    )?;
                    segment_offset = segment_offset
                        .wrapping_add(skip)
                        .wrapping_add(POINTER_SIZE);
                }
            }
            _ => {
                return Err(Error::MalformedBinary(format!(
                    "bad rebase opcode 0x{:02x} at offset {}",
                    opcode,
                    i - 1
                )));
            }
        }
    }

    debug!("Parsed {} rebase entries", rebases.len());
    Ok(rebases)
}

/// Parse dyld bind info opcodes.
///
/// Bind opcodes encode symbol references that need to be resolved at load time.
/// Each binding specifies a symbol name, library ordinal, and location to patch.
pub fn parse_bind_info(data: &[u8], segment_sizes: &[u64]) -> Result<Vec<BindEntry>> {
    parse_bind_opcodes(data, segment_sizes, false)
}

/// Parse dyld lazy bind info opcodes.
///
/// Lazy binding has each symbol as an independent entry, separated by
/// BIND_OPCODE_DONE, so DONE does not end the stream here.
pub fn parse_lazy_bind_info(data: &[u8], segment_sizes: &[u64]) -> Result<Vec<BindEntry>> {
    parse_bind_opcodes(data, segment_sizes, true)
}

/// Registers of the bind opcode state machine.
struct BindState {
    lib_ordinal: i64,
    symbol_name: Arc<str>,
    weak_import: bool,
    bind_type: u8,
    addend: i64,
    segment_index: u8,
    segment_offset: u64,
}

impl BindState {
    fn new() -> Self {
        Self {
            lib_ordinal: 0,
            symbol_name: Arc::from(""),
            weak_import: false,
            bind_type: BIND_TYPE_POINTER,
            addend: 0,
            segment_index: 0,
            segment_offset: 0,
        }
    }

    /// Check a run of `count` binds, `stride` bytes apart, from the current
    /// location.
    fn check_location(&self, segment_sizes: &[u64], count: u64, stride: u64) -> Result<()> {
        if self.symbol_name.is_empty() {
            return Err(Error::MalformedBinary(
                "bind opcode without a symbol name".to_string(),
            ));
        }
        check_run(
            segment_sizes,
            self.segment_index,
            self.segment_offset,
            count,
            stride,
            POINTER_SIZE,
        )
    }

    fn bind(&self, binds: &mut Vec<BindEntry>) -> Result<()> {
        trace!(
            "Creating bind for symbol: {} (segment={}, offset=0x{:x})",
            self.symbol_name,
            self.segment_index,
            self.segment_offset
        );
        push_entry(
            binds,
            BindEntry {
                symbol_name: self.symbol_name.clone(),
                lib_ordinal: self.lib_ordinal,
                weak_import: self.weak_import,
                bind_type: self.bind_type,
                addend: self.addend,
                segment_index: self.segment_index,
                segment_offset: self.segment_offset,
            },
        )
    }

    fn advance(&mut self, delta: u64) {
        self.segment_offset = self.segment_offset.wrapping_add(delta);
    }
}

fn parse_bind_opcodes(data: &[u8], segment_sizes: &[u64], lazy: bool) -> Result<Vec<BindEntry>> {
    let mut binds = Vec::new();
    let mut state = BindState::new();
    let mut i = 0;

    while i < data.len() {
        let opcode = data[i];
        let immediate = opcode & IMMEDIATE_MASK;
        i += 1;

        match opcode & OPCODE_MASK {
            BIND_OPCODE_DONE if lazy => {}
            BIND_OPCODE_DONE => break,
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => state.lib_ordinal = immediate as i64,
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let (ordinal, n) = read_uleb128(data, i)?;
                state.lib_ordinal = ordinal as i64;
                i += n;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                // Special ordinals are small negative numbers packed into
                // the immediate.
                state.lib_ordinal = if immediate == 0 {
                    BIND_SPECIAL_DYLIB_SELF
                } else {
                    (opcode | OPCODE_MASK) as i8 as i64
                };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let name = c_str_at(data, i).ok_or_else(|| {
                    Error::MalformedBinary("unterminated symbol name in bind opcodes".to_string())
                })?;
                state.symbol_name = Arc::from(String::from_utf8_lossy(name));
                state.weak_import = (immediate & BIND_SYMBOL_FLAGS_WEAK_IMPORT) != 0;
                i += name.len() + 1;
            }
            BIND_OPCODE_SET_TYPE_IMM => state.bind_type = immediate,
            BIND_OPCODE_SET_ADDEND_SLEB => {
                let (addend, n) = read_sleb128(data, i)?;
                state.addend = addend;
                i += n;
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                let (offset, n) = read_uleb128(data, i)?;
                state.segment_index = immediate;
                state.segment_offset = offset;
                i += n;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                // Large unsigned values effectively subtract
                let (addr_add, n) = read_uleb128(data, i)?;
                state.advance(addr_add);
                i += n;
            }
            BIND_OPCODE_DO_BIND => {
                state.check_location(segment_sizes, 1, POINTER_SIZE)?;
                state.bind(&mut binds)?;
                state.advance(POINTER_SIZE);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                state.check_location(segment_sizes, 1, POINTER_SIZE)?;
                state.bind(&mut binds)?;
                let (addr_add, n) = read_uleb128(data, i)?;
                state.advance(addr_add.wrapping_add(POINTER_SIZE));
                i += n;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                state.check_location(segment_sizes, 1, POINTER_SIZE)?;
                state.bind(&mut binds)?;
                state.advance(immediate as u64 * POINTER_SIZE + POINTER_SIZE);
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let (count, count_bytes) = read_uleb128(data, i)?;
                let (skip, skip_bytes) = read_uleb128(data, i + count_bytes)?;
                i += count_bytes + skip_bytes;
                let stride = skip.checked_add(POINTER_SIZE).unwrap_or(u64::MAX);
                state.check_location(segment_sizes, count, stride)?;
                for _ in 0..count {
                    state.bind(&mut binds)?;
                    state.advance(skip.wrapping_add(POINTER_SIZE));
                }
            }
            BIND_OPCODE_THREADED => {
                return Err(Error::UnsupportedFeature(
                    "threaded bind opcodes".to_string(),
                ));
            }
            _ => {
                return Err(Error::MalformedBinary(format!(
                    "bad bind opcode 0x{:02x} at offset {}",
                    opcode,
                    i - 1
                )));
            }
        }
    }

    debug!(
        "Parsed {} {}bind entries",
        binds.len(),
        if lazy { "lazy " } else { "" }
    );
    Ok(binds)
}

/// Opcode bytes for a LINKEDIT region, empty when the region is.
fn opcode_stream(image: &Image, off: u32, size: u32) -> Result<&[u8]> {
    if size == 0 {
        return Ok(&[]);
    }
    image.linkedit_slice(off, size)
}

/// Mapping offset of `width` bytes at `segment_offset` into segment
/// `segment_index`.
fn fixup_location(image: &Image, segment_index: u8, segment_offset: u64, width: u64) -> Result<usize> {
    let (start, vmsize) = image.segment_range(segment_index as usize)?;
    let in_segment = segment_offset
        .checked_add(width)
        .is_some_and(|end| end <= vmsize as u64);
    let mapping_len = image.mapping()?.len();
    let location = start.checked_add(segment_offset as usize);
    match location {
        Some(location) if in_segment && location + width as usize <= mapping_len => Ok(location),
        _ => Err(Error::MalformedBinary(format!(
            "fixup at segment {} offset 0x{:x} is outside the segment",
            segment_index, segment_offset
        ))),
    }
}

/// Slide a single rebase location.
fn apply_rebase(image: &mut Image, rebase: &RebaseEntry) -> Result<()> {
    let slide = image.slide();
    match rebase.rebase_type {
        REBASE_TYPE_POINTER => {
            let location = fixup_location(image, rebase.segment_index, rebase.segment_offset, 8)?;
            let memory = image.mapping_mut()?.as_mut_slice();
            let value: u64 = memory.pread_with(location, LE)?;
            memory.pwrite_with(value.wrapping_add_signed(slide as i64), location, LE)?;
        }
        REBASE_TYPE_TEXT_ABSOLUTE32 => {
            let location = fixup_location(image, rebase.segment_index, rebase.segment_offset, 4)?;
            let memory = image.mapping_mut()?.as_mut_slice();
            let value: u32 = memory.pread_with(location, LE)?;
            memory.pwrite_with(value.wrapping_add(slide as u32), location, LE)?;
        }
        other => {
            return Err(Error::UnsupportedFeature(format!(
                "rebase type {} at segment {} offset 0x{:x}",
                other, rebase.segment_index, rebase.segment_offset
            )));
        }
    }
    Ok(())
}

/// Look up a symbol in the host process.
fn host_lookup(symbol: &str) -> Option<usize> {
    let name = CString::new(symbol.strip_prefix('_').unwrap_or(symbol)).ok()?;
    // SAFETY: RTLD_DEFAULT searches the global scope; the name is a valid C
    // string that outlives the call.
    let address = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    (!address.is_null()).then_some(address as usize)
}

/// Name of the library an ordinal refers to, for error messages.
fn ordinal_name(image: &Image, ordinal: i64) -> String {
    match ordinal {
        BIND_SPECIAL_DYLIB_SELF => "self".to_string(),
        BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE => "main executable".to_string(),
        BIND_SPECIAL_DYLIB_FLAT_LOOKUP => "flat namespace".to_string(),
        BIND_SPECIAL_DYLIB_WEAK_LOOKUP => "weak lookup".to_string(),
        n => image
            .dependent_libraries()
            .get((n - 1) as usize)
            .map(|lib| lib.name.clone())
            .unwrap_or_else(|| format!("ordinal {}", n)),
    }
}

/// Resolve the target address of an import.
pub fn resolve_import(image: &Image, ctx: &LinkContext, bind: &BindEntry) -> Result<usize> {
    if bind.lib_ordinal > image.library_count() as i64
        || bind.lib_ordinal < BIND_SPECIAL_DYLIB_WEAK_LOOKUP
    {
        return Err(Error::MalformedBinary(format!(
            "bind ordinal {} for {} out of range",
            bind.lib_ordinal, bind.symbol_name
        )));
    }
    if bind.lib_ordinal == BIND_SPECIAL_DYLIB_SELF
        && let Some(address) = image.lookup_export(ctx, &bind.symbol_name)?
    {
        return Ok(address);
    }
    // `dyld_stub_binder` is registered here too, bound to a no-op.
    if let Some(address) = symbols::lookup(&bind.symbol_name) {
        trace!("{} bound to internal implementation", bind.symbol_name);
        return Ok(address);
    }
    if let Some(address) = host_lookup(&bind.symbol_name) {
        return Ok(address);
    }
    if bind.weak_import {
        debug!("weak import {} not found, binding to 0", bind.symbol_name);
        return Ok(0);
    }
    Err(Error::SymbolNotFound(format!(
        "{} (from {})",
        bind.symbol_name,
        ordinal_name(image, bind.lib_ordinal)
    )))
}

fn apply_bind(image: &mut Image, ctx: &LinkContext, bind: &BindEntry) -> Result<()> {
    if bind.bind_type != BIND_TYPE_POINTER {
        return Err(Error::UnsupportedFeature(format!(
            "bind type {} for {}",
            bind.bind_type, bind.symbol_name
        )));
    }
    let location = fixup_location(image, bind.segment_index, bind.segment_offset, 8)?;
    let target = resolve_import(image, ctx, bind)?;
    let value = (target as u64).wrapping_add_signed(bind.addend);
    if ctx.verbose_bind {
        let segment = image.segment(bind.segment_index as usize)?;
        info!(
            "bind {}+0x{:x} = {} (0x{:x})",
            segment.name(),
            bind.segment_offset,
            bind.symbol_name,
            value
        );
    }
    image
        .mapping_mut()?
        .as_mut_slice()
        .pwrite_with(value, location, LE)?;
    Ok(())
}

/// Apply rebases, binds and lazy binds to a freshly parsed image.
///
/// Lazy binds are resolved eagerly. Weak binds are skipped: coalescing
/// across images does not happen here.
pub fn apply_fixups(image: &mut Image, ctx: &LinkContext) -> Result<()> {
    let Some(info) = image.dyld_info().copied() else {
        return Ok(());
    };

    let segment_sizes = (0..image.segment_count())
        .map(|index| image.segment(index).map(|seg| seg.vmsize))
        .collect::<Result<Vec<u64>>>()?;

    let rebases = parse_rebase_info(
        opcode_stream(image, info.rebase_off, info.rebase_size)?,
        &segment_sizes,
    )?;
    let binds = parse_bind_info(
        opcode_stream(image, info.bind_off, info.bind_size)?,
        &segment_sizes,
    )?;
    let lazy_binds = parse_lazy_bind_info(
        opcode_stream(image, info.lazy_bind_off, info.lazy_bind_size)?,
        &segment_sizes,
    )?;
    if info.weak_bind_size != 0 {
        debug!("skipping {} bytes of weak bind opcodes", info.weak_bind_size);
    }

    if image.slide() != 0 {
        for rebase in &rebases {
            apply_rebase(image, rebase)?;
        }
    }
    for bind in binds.iter().chain(&lazy_binds) {
        apply_bind(image, ctx, bind)?;
    }

    debug!(
        "applied {} rebases, {} binds, {} lazy binds",
        rebases.len(),
        binds.len(),
        lazy_binds.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SEGMENTS: [u64; 3] = [0x4000; 3];

    fn rebase(segment_index: u8, segment_offset: u64) -> RebaseEntry {
        RebaseEntry {
            rebase_type: REBASE_TYPE_POINTER,
            segment_index,
            segment_offset,
        }
    }

    #[test]
    fn rebase_runs() {
        let opcodes = [
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x10,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 2,
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED | 1,
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB,
            0x08,
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB,
            2,
            0x10,
            REBASE_OPCODE_DONE,
            // Ignored after DONE.
            0xff,
        ];
        assert_eq!(
            parse_rebase_info(&opcodes, &SEGMENTS).unwrap(),
            vec![
                rebase(1, 0x10),
                rebase(1, 0x18),
                rebase(1, 0x28),
                rebase(1, 0x38),
                rebase(1, 0x50),
            ]
        );
    }

    #[test]
    fn rebase_uleb_times() {
        let opcodes = [
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0x00,
            REBASE_OPCODE_ADD_ADDR_ULEB,
            0x80,
            0x01,
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES,
            3,
        ];
        let rebases = parse_rebase_info(&opcodes, &SEGMENTS).unwrap();
        assert_eq!(rebases, vec![rebase(0, 0x80), rebase(0, 0x88), rebase(0, 0x90)]);
    }

    #[test]
    fn rebase_bad_opcode_is_malformed() {
        assert!(matches!(
            parse_rebase_info(&[0x90], &SEGMENTS),
            Err(Error::MalformedBinary(_))
        ));
        assert!(matches!(
            parse_rebase_info(&[REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB, 0x80], &SEGMENTS),
            Err(Error::MalformedBinary(_))
        ));
    }

    #[test]
    fn bind_with_addend_and_weak_flag() {
        let mut opcodes = vec![
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | BIND_SYMBOL_FLAGS_WEAK_IMPORT,
        ];
        opcodes.extend_from_slice(b"_malloc\0");
        opcodes.extend_from_slice(&[
            BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER,
            BIND_OPCODE_SET_ADDEND_SLEB,
            0x7c, // -4
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2,
            0x20,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED | 1,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DONE,
        ]);
        let binds = parse_bind_info(&opcodes, &SEGMENTS).unwrap();
        let offsets: Vec<u64> = binds.iter().map(|b| b.segment_offset).collect();
        assert_eq!(offsets, vec![0x20, 0x28, 0x38]);
        assert_eq!(
            binds[0],
            BindEntry {
                symbol_name: "_malloc".into(),
                lib_ordinal: 1,
                weak_import: true,
                bind_type: BIND_TYPE_POINTER,
                addend: -4,
                segment_index: 2,
                segment_offset: 0x20,
            }
        );
    }

    #[test]
    fn special_dylib_ordinals_are_sign_extended() {
        for (immediate, expected) in [
            (0u8, BIND_SPECIAL_DYLIB_SELF),
            (0x0f, BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE),
            (0x0e, BIND_SPECIAL_DYLIB_FLAT_LOOKUP),
            (0x0d, BIND_SPECIAL_DYLIB_WEAK_LOOKUP),
        ] {
            let mut opcodes = vec![
                BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | immediate,
                BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            ];
            opcodes.extend_from_slice(b"_x\0");
            opcodes.push(BIND_OPCODE_DO_BIND);
            let binds = parse_bind_info(&opcodes, &SEGMENTS).unwrap();
            assert_eq!(binds[0].lib_ordinal, expected);
        }
    }

    #[test]
    fn bind_uleb_times_skipping() {
        let mut opcodes = vec![BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM];
        opcodes.extend_from_slice(b"_x\0");
        opcodes.extend_from_slice(&[
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0x00,
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB,
            3,
            8,
            BIND_OPCODE_ADD_ADDR_ULEB,
            0x08,
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB,
            0x10,
            BIND_OPCODE_DO_BIND,
        ]);
        let offsets: Vec<u64> = parse_bind_info(&opcodes, &SEGMENTS)
            .unwrap()
            .iter()
            .map(|b| b.segment_offset)
            .collect();
        assert_eq!(offsets, vec![0x00, 0x10, 0x20, 0x38, 0x50]);
    }

    #[test]
    fn lazy_bind_continues_past_done() {
        let mut opcodes = vec![
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x00,
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
        ];
        opcodes.extend_from_slice(b"_a\0");
        opcodes.extend_from_slice(&[BIND_OPCODE_DO_BIND, BIND_OPCODE_DONE]);
        opcodes.extend_from_slice(&[
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x08,
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB,
            2,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
        ]);
        opcodes.extend_from_slice(b"_b\0");
        opcodes.extend_from_slice(&[BIND_OPCODE_DO_BIND, BIND_OPCODE_DONE]);

        let lazy: Vec<(String, i64, u64)> = parse_lazy_bind_info(&opcodes, &SEGMENTS)
            .unwrap()
            .into_iter()
            .map(|b| (b.symbol_name.to_string(), b.lib_ordinal, b.segment_offset))
            .collect();
        assert_eq!(
            lazy,
            vec![("_a".to_string(), 1, 0x00), ("_b".to_string(), 2, 0x08)]
        );
        // The regular stream stops at the first DONE.
        assert_eq!(parse_bind_info(&opcodes, &SEGMENTS).unwrap().len(), 1);
    }

    #[test]
    fn bind_errors() {
        assert!(matches!(
            parse_bind_info(&[BIND_OPCODE_DO_BIND], &SEGMENTS),
            Err(Error::MalformedBinary(_))
        ));
        assert!(matches!(
            parse_bind_info(&[BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM, b'_', b'x'], &SEGMENTS),
            Err(Error::MalformedBinary(_))
        ));
        assert!(matches!(
            parse_bind_info(&[BIND_OPCODE_THREADED], &SEGMENTS),
            Err(Error::UnsupportedFeature(_))
        ));
        assert!(matches!(
            parse_bind_info(&[0xE0], &SEGMENTS),
            Err(Error::MalformedBinary(_))
        ));
    }

    #[test]
    fn host_lookup_strips_underscore() {
        assert!(host_lookup("_malloc").is_some());
        assert!(host_lookup("_memdyld_no_such_symbol_anywhere").is_none());
        assert!(host_lookup("_bad\0name").is_none());
    }

    #[test]
    fn repeat_counts_must_stay_inside_the_segment() {
        let mut opcodes = vec![BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM];
        opcodes.extend_from_slice(b"_x\0");
        opcodes.extend_from_slice(&[
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x00,
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB,
            0x80,
            0x80,
            0x80,
            0x08, // 1 << 24
            0x00,
        ]);
        match parse_bind_info(&opcodes, &SEGMENTS) {
            Err(Error::MalformedBinary(msg)) => assert!(msg.contains("outside the segment"), "{msg}"),
            other => panic!("unexpected result: {other:?}"),
        }

        // Exactly filling the segment is fine.
        let last = opcodes.len() - 5;
        opcodes.truncate(last);
        opcodes.extend_from_slice(&[0x80, 0x10, 0x00]); // 0x800 binds, no skip
        assert_eq!(parse_bind_info(&opcodes, &SEGMENTS).unwrap().len(), 0x800);
    }

    #[test]
    fn rebase_runs_are_bounded_by_the_segment() {
        let opcodes = [
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2,
            0x00,
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES,
            0x81,
            0x10, // 0x801 pointers
        ];
        assert!(matches!(
            parse_rebase_info(&opcodes, &SEGMENTS),
            Err(Error::MalformedBinary(_))
        ));

        // A huge skip overflows rather than wrapping back into range.
        let opcodes = [
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0x00,
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB,
            2,
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01,
        ];
        assert!(parse_rebase_info(&opcodes, &SEGMENTS).is_err());

        // Unknown segment.
        let opcodes = [
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 3,
            0x00,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
        ];
        assert!(parse_rebase_info(&opcodes, &SEGMENTS).is_err());
    }

    #[test]
    fn absolute32_rebase_fits_in_last_four_bytes() {
        let opcodes = [
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_TEXT_ABSOLUTE32,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
            0xfc,
            0x7f, // 0x3ffc
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
        ];
        assert_eq!(parse_rebase_info(&opcodes, &SEGMENTS).unwrap().len(), 1);
    }

    #[test]
    fn runs_share_the_symbol_name() {
        let mut opcodes = vec![BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM];
        opcodes.extend_from_slice(b"_shared\0");
        opcodes.extend_from_slice(&[BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB, 4, 0]);
        let binds = parse_bind_info(&opcodes, &SEGMENTS).unwrap();
        assert_eq!(binds.len(), 4);
        assert!(binds.iter().all(|b| Arc::ptr_eq(&b.symbol_name, &binds[0].symbol_name)));
    }
}
