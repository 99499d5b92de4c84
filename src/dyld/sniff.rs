//! Load-command validation.
//!
//! A single pass over the command table of a candidate image decides whether
//! it is safe to map. Every offset and size read here comes from the file, so
//! all arithmetic is widened or checked before it is compared.

use super::LinkContext;
use super::macho::*;
use crate::{Error, Result};
use scroll::{LE, Pread};
use tracing::{debug, trace};

/// What the validator learned about an image that passed.
#[derive(Debug, Clone)]
pub struct LoadCommandSummary {
    pub header: MachHeader64,
    pub segment_count: u32,
    pub library_count: u32,
    pub compressed: bool,
    pub code_signature: Option<LinkeditDataCommand>,
    pub encryption: Option<EncryptionInfoCommand>,
}

/// Segment indices in fixup opcodes are one byte wide.
const MAX_SEGMENTS: usize = 255;

/// Library ordinals in two-level namespace symbols are twelve bits wide.
const MAX_LIBRARIES: u32 = 4095;

fn malformed<T>(msg: impl Into<String>) -> Result<T> {
    Err(Error::MalformedBinary(msg.into()))
}

/// CPU type of the running process, if it is one we can check against.
fn host_cputype() -> Option<u32> {
    if cfg!(target_arch = "aarch64") {
        Some(CPU_TYPE_ARM64)
    } else if cfg!(target_arch = "x86_64") {
        Some(CPU_TYPE_X86_64)
    } else {
        None
    }
}

/// Validate the header and load commands of `raw`.
pub fn sniff_load_commands(raw: &[u8], ctx: &LinkContext) -> Result<LoadCommandSummary> {
    let header = parse_header(raw)?;
    let strict = ctx.strict_macho_required;

    if let Some(host) = host_cputype()
        && header.cputype != host
    {
        return Err(Error::UnsupportedFeature(format!(
            "image built for cputype 0x{:x}, host is 0x{:x}",
            header.cputype, host
        )));
    }

    if header.ncmds > header.sizeofcmds / SIZEOF_LOAD_COMMAND as u32 {
        return malformed(format!(
            "ncmds ({}) too large to fit in sizeofcmds ({})",
            header.ncmds, header.sizeofcmds
        ));
    }
    let commands_end = (SIZEOF_MACH_HEADER_64 + header.sizeofcmds as usize) as u64;

    let mut summary = LoadCommandSummary {
        header,
        segment_count: 0,
        library_count: 0,
        compressed: false,
        code_signature: None,
        encryption: None,
    };

    let mut found_load_command_segment = false;
    let mut linkedit: Option<SegmentCommand64> = None;
    let mut start_of_file: Option<SegmentCommand64> = None;
    let mut dyld_info: Option<DyldInfoCommand> = None;
    let mut chained_fixups: Option<LinkeditDataCommand> = None;
    let mut exports_trie: Option<LinkeditDataCommand> = None;
    let mut symtab: Option<SymtabCommand> = None;
    let mut dysymtab: Option<DysymtabCommand> = None;
    let mut segments: Vec<SegmentCommand64> = Vec::new();
    let mut has_load_dylib = false;
    let mut install_name: Option<Vec<u8>> = None;

    for cmd in LoadCommands::new(raw, &header)? {
        let cmd = cmd?;
        let i = cmd.index;
        trace!(
            "load command #{}: cmd=0x{:x} size={} at 0x{:x}",
            i, cmd.cmd, cmd.cmdsize, cmd.offset
        );
        match cmd.cmd {
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                if cmd.cmdsize as usize != SIZEOF_DYLD_INFO_COMMAND {
                    return malformed("LC_DYLD_INFO size wrong");
                }
                dyld_info = Some(cmd.read(raw)?);
                summary.compressed = true;
            }
            LC_DYLD_CHAINED_FIXUPS => {
                if cmd.cmdsize as usize != SIZEOF_LINKEDIT_DATA_COMMAND {
                    return malformed("LC_DYLD_CHAINED_FIXUPS size wrong");
                }
                chained_fixups = Some(cmd.read(raw)?);
                summary.compressed = true;
            }
            LC_DYLD_EXPORTS_TRIE => {
                if cmd.cmdsize as usize != SIZEOF_LINKEDIT_DATA_COMMAND {
                    return malformed("LC_DYLD_EXPORTS_TRIE size wrong");
                }
                exports_trie = Some(cmd.read(raw)?);
            }
            LC_SEGMENT_64 => {
                if (cmd.cmdsize as usize) < SIZEOF_SEGMENT_COMMAND_64 {
                    return malformed("LC_SEGMENT size too small");
                }
                let seg: SegmentCommand64 = cmd.read(raw)?;
                check_segment(raw, &cmd, &seg, &header, strict)?;
                if seg.vmsize != 0 {
                    summary.segment_count += 1;
                }
                if seg.name() == "__LINKEDIT" {
                    if seg.fileoff == 0 {
                        return malformed(
                            "__LINKEDIT has fileoff==0 which overlaps mach_header",
                        );
                    }
                    if linkedit.is_some() {
                        return malformed("multiple __LINKEDIT segments");
                    }
                    linkedit = Some(seg);
                }
                if seg.fileoff == 0 && seg.filesize != 0 {
                    if let Some(prev) = &start_of_file {
                        return malformed(format!(
                            "multiple segments map start of file: {} {}",
                            prev.name(),
                            seg.name()
                        ));
                    }
                    start_of_file = Some(seg);
                }
                if strict && seg.fileoff < header.sizeofcmds as u64 && seg.filesize != 0 {
                    // All load commands must be in a single R|X segment.
                    if seg.fileoff != 0 || seg.filesize < commands_end {
                        return malformed(format!(
                            "segment {} does not span all load commands",
                            seg.name()
                        ));
                    }
                    if seg.initprot != (VM_PROT_READ | VM_PROT_EXECUTE) {
                        return malformed(format!(
                            "load commands found in segment {} with wrong permissions",
                            seg.name()
                        ));
                    }
                    if found_load_command_segment {
                        return malformed("load commands in multiple segments");
                    }
                    found_load_command_segment = true;
                }
                // Caps the pairwise overlap scan below.
                if segments.len() == MAX_SEGMENTS {
                    return malformed(format!("more than {} segments", MAX_SEGMENTS));
                }
                segments.push(seg);
            }
            LC_SEGMENT => {
                return malformed("wrong LC_SEGMENT[_64] for architecture");
            }
            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB
            | LC_ID_DYLIB => {
                if cmd.cmd != LC_ID_DYLIB {
                    if summary.library_count == MAX_LIBRARIES {
                        return malformed(format!(
                            "more than {} dependent libraries",
                            MAX_LIBRARIES
                        ));
                    }
                    summary.library_count += 1;
                    has_load_dylib = true;
                }
                let name = dylib_name(raw, &cmd)?;
                if cmd.cmd == LC_ID_DYLIB {
                    install_name = Some(name.to_vec());
                }
            }
            LC_CODE_SIGNATURE => {
                if cmd.cmdsize as usize != SIZEOF_LINKEDIT_DATA_COMMAND {
                    return malformed("LC_CODE_SIGNATURE size wrong");
                }
                if summary.code_signature.is_some() {
                    return malformed("multiple LC_CODE_SIGNATURE load commands");
                }
                summary.code_signature = Some(cmd.read(raw)?);
            }
            LC_ENCRYPTION_INFO => {
                if cmd.cmdsize as usize != SIZEOF_ENCRYPTION_INFO_COMMAND {
                    return malformed("LC_ENCRYPTION_INFO size wrong");
                }
                if summary.encryption.is_some() {
                    return malformed("multiple LC_ENCRYPTION_INFO load commands");
                }
                summary.encryption = Some(cmd.read(raw)?);
            }
            LC_ENCRYPTION_INFO_64 => {
                if cmd.cmdsize as usize != SIZEOF_ENCRYPTION_INFO_COMMAND_64 {
                    return malformed("LC_ENCRYPTION_INFO_64 size wrong");
                }
                if summary.encryption.is_some() {
                    return malformed("multiple LC_ENCRYPTION_INFO_64 load commands");
                }
                summary.encryption = Some(cmd.read(raw)?);
            }
            LC_SYMTAB => {
                if cmd.cmdsize as usize != SIZEOF_SYMTAB_COMMAND {
                    return malformed("LC_SYMTAB size wrong");
                }
                symtab = Some(cmd.read(raw)?);
            }
            LC_DYSYMTAB => {
                if cmd.cmdsize as usize != SIZEOF_DYSYMTAB_COMMAND {
                    return malformed("LC_DYSYMTAB size wrong");
                }
                dysymtab = Some(cmd.read(raw)?);
            }
            _ => {}
        }
    }

    if strict && !found_load_command_segment {
        return malformed("load commands not in a segment");
    }
    let Some(linkedit) = linkedit else {
        return malformed("missing __LINKEDIT segment");
    };
    if start_of_file.is_none() {
        return malformed("missing __TEXT segment that maps start of file");
    }
    if strict {
        check_segment_overlaps(&segments, &linkedit)?;
    }

    if dyld_info.is_none() && chained_fixups.is_none() && symtab.is_none() {
        return malformed("missing LC_SYMTAB, LC_DYLD_INFO, or LC_DYLD_CHAINED_FIXUPS");
    }
    let Some(dysymtab) = dysymtab else {
        return malformed("missing LC_DYSYMTAB");
    };

    let linkedit_start = linkedit.fileoff;
    let linkedit_end = linkedit.fileoff.saturating_add(linkedit.filesize);

    if strict && let Some(info) = &dyld_info {
        check_dyld_info_layout(info, linkedit_start, linkedit_end)?;
    }
    if strict && let Some(fixups) = &chained_fixups {
        check_linkedit_blob(fixups, "dyld chained fixups info", linkedit_start, linkedit_end)?;
    }
    if strict && let Some(trie) = &exports_trie {
        check_linkedit_blob(trie, "dyld exports trie", linkedit_start, linkedit_end)?;
    }
    if let Some(symtab) = &symtab {
        check_symbol_tables(symtab, &dysymtab, &linkedit, strict)?;
    }

    if needs_added_lib_system_dependency(
        summary.library_count,
        &header,
        has_load_dylib,
        install_name.as_deref(),
    ) {
        summary.library_count = 1;
    }

    // Dylibs in the shared cache have their fixup commands stripped.
    if !summary.compressed && (header.flags & MH_DYLIB_IN_CACHE) != 0 {
        summary.compressed = true;
    }

    debug!(
        "validated image: {} segments, {} libraries, compressed={}",
        summary.segment_count, summary.library_count, summary.compressed
    );
    Ok(summary)
}

fn check_segment(
    raw: &[u8],
    cmd: &CommandRef,
    seg: &SegmentCommand64,
    header: &MachHeader64,
    strict: bool,
) -> Result<()> {
    let name = seg.name();
    // Non-allocatable segments such as __LLVM may have vmsize 0.
    if seg.filesize > seg.vmsize && (seg.vmsize != 0 || (seg.flags & SG_NORELOC) == 0) {
        return malformed(format!(
            "segment load command {} filesize (0x{:x}) is larger than vmsize (0x{:x})",
            name, seg.filesize, seg.vmsize
        ));
    }
    let expected = SIZEOF_SEGMENT_COMMAND_64 as u64 + seg.nsects as u64 * SIZEOF_SECTION_64 as u64;
    if cmd.cmdsize as u64 != expected {
        return malformed("LC_SEGMENT size wrong for number of sections");
    }
    if name != "__LINKEDIT" {
        if seg.initprot & !0x7 != 0 {
            return malformed(format!(
                "{} segment has invalid permission bits (0x{:x}) in initprot",
                name, seg.initprot
            ));
        }
        if seg.maxprot & !0x7 != 0 {
            return malformed(format!(
                "{} segment has invalid permission bits (0x{:x}) in maxprot",
                name, seg.maxprot
            ));
        }
        if seg.initprot != 0 && (seg.initprot & VM_PROT_READ) == 0 {
            return malformed(format!("{} segment is not mapped readable", name));
        }
    }
    if seg.fileoff == 0 && seg.filesize != 0 {
        if (seg.initprot & VM_PROT_READ) == 0 {
            return malformed(format!(
                "{} segment maps start of file but is not readable",
                name
            ));
        }
        if strict && (seg.initprot & VM_PROT_WRITE) != 0 {
            return malformed(format!(
                "{} segment maps start of file but is writable",
                name
            ));
        }
        if seg.filesize < (SIZEOF_MACH_HEADER_64 as u64 + header.sizeofcmds as u64) {
            return malformed(format!(
                "{} segment does not map all of load commands",
                name
            ));
        }
    }
    if !strict {
        return Ok(());
    }

    if seg.vmsize > i64::MAX as u64 {
        return malformed(format!("segment load command {} vmsize too large", name));
    }
    if seg.vmaddr.checked_add(seg.vmsize).is_none() {
        return malformed(format!(
            "segment load command {} wraps around address space",
            name
        ));
    }
    if seg.vmsize != seg.filesize {
        if seg.initprot == 0 {
            // __PAGEZERO has no file content, __LLVM has no VM footprint.
            if seg.filesize != 0 && seg.vmsize != 0 {
                return malformed(format!(
                    "unaccessable segment {} has non-zero filesize and vmsize",
                    name
                ));
            }
        } else {
            if seg.vmsize < seg.filesize {
                return malformed(format!("segment {} has vmsize < filesize", name));
            }
            if (seg.initprot & VM_PROT_EXECUTE) != 0 {
                return malformed(format!(
                    "segment {} has vmsize != filesize and is executable",
                    name
                ));
            }
        }
    }

    let segment_file_end = seg.fileoff.saturating_add(seg.filesize);
    for n in 0..seg.nsects as usize {
        let offset = cmd.offset + SIZEOF_SEGMENT_COMMAND_64 + n * SIZEOF_SECTION_64;
        let sect: Section64 = raw.pread_with(offset, LE)?;
        if sect.offset != 0 && (sect.offset as u64).saturating_add(sect.size) > segment_file_end {
            return malformed(format!(
                "section {},{} exceeds segment {} boundary",
                sect.segment_name(),
                sect.name(),
                name
            ));
        }
    }
    Ok(())
}

/// Validate a dylib command and return its install name.
fn dylib_name<'a>(raw: &'a [u8], cmd: &CommandRef) -> Result<&'a [u8]> {
    let bytes = cmd.bytes(raw)?;
    let dylib: DylibCommand = bytes.pread_with(0, LE)?;
    if dylib.name_offset > cmd.cmdsize {
        return malformed(format!(
            "dylib load command #{} has offset ({}) outside its size ({})",
            cmd.index, dylib.name_offset, cmd.cmdsize
        ));
    }
    match c_str_at(bytes, dylib.name_offset as usize) {
        Some(name) => Ok(name),
        None => malformed(format!(
            "dylib load command #{} string extends beyond end of load command",
            cmd.index
        )),
    }
}

fn vm_range(seg: &SegmentCommand64) -> (u64, u64) {
    (seg.vmaddr, seg.vmaddr.saturating_add(seg.vmsize))
}

fn file_range(seg: &SegmentCommand64) -> (u64, u64) {
    (seg.fileoff, seg.fileoff.saturating_add(seg.filesize))
}

/// True when two non-empty half-open ranges intersect.
fn ranges_overlap((start1, end1): (u64, u64), (start2, end2): (u64, u64)) -> bool {
    (start2 <= start1 && end2 > start1 && end1 > start1)
        || (start2 >= start1 && start2 < end1 && end2 > start2)
}

fn check_segment_overlaps(segments: &[SegmentCommand64], linkedit: &SegmentCommand64) -> Result<()> {
    let mut last_file_start = 0;
    for (i, seg1) in segments.iter().enumerate() {
        last_file_start = last_file_start.max(seg1.fileoff);
        for (j, seg2) in segments.iter().enumerate() {
            if i == j {
                continue;
            }
            if ranges_overlap(vm_range(seg1), vm_range(seg2)) {
                return malformed(format!(
                    "segment {} vm overlaps segment {}",
                    seg1.name(),
                    seg2.name()
                ));
            }
            if ranges_overlap(file_range(seg1), file_range(seg2)) {
                return malformed(format!(
                    "segment {} file content overlaps segment {}",
                    seg1.name(),
                    seg2.name()
                ));
            }
        }
    }
    if last_file_start != linkedit.fileoff {
        return malformed("__LINKEDIT must be last segment");
    }
    Ok(())
}

/// Dyld info regions must each lie inside LINKEDIT, in file order, without
/// overlapping the previous region.
fn check_dyld_info_layout(info: &DyldInfoCommand, linkedit_start: u64, linkedit_end: u64) -> Result<()> {
    let regions = [
        ("rebase info", "__LINKEDIT", info.rebase_off, info.rebase_size),
        ("bind info", "rebase info", info.bind_off, info.bind_size),
        ("weak bind info", "bind info", info.weak_bind_off, info.weak_bind_size),
        ("lazy bind info", "weak bind info", info.lazy_bind_off, info.lazy_bind_size),
        ("export info", "lazy bind info", info.export_off, info.export_size),
    ];
    let mut high_water = linkedit_start;
    for (what, previous, off, size) in regions {
        if size == 0 {
            continue;
        }
        if size & 0x8000_0000 != 0 {
            return malformed(format!("dyld {} size overflow", what));
        }
        if (off as u64) < high_water {
            if previous == "__LINKEDIT" {
                return malformed(format!("dyld {} underruns __LINKEDIT", what));
            }
            return malformed(format!("dyld {} overlaps {}", what, previous));
        }
        let end = off as u64 + size as u64;
        if end > u32::MAX as u64 {
            return malformed(format!("dyld {} offset overflows", what));
        }
        if end > linkedit_end {
            return malformed(format!("dyld {} overruns __LINKEDIT", what));
        }
        high_water = end;
    }
    Ok(())
}

fn check_linkedit_blob(
    blob: &LinkeditDataCommand,
    what: &str,
    linkedit_start: u64,
    linkedit_end: u64,
) -> Result<()> {
    if (blob.dataoff as u64) < linkedit_start {
        return malformed(format!("{} underruns __LINKEDIT", what));
    }
    if blob.dataoff as u64 + blob.datasize as u64 > linkedit_end {
        return malformed(format!("{} overruns __LINKEDIT", what));
    }
    Ok(())
}

fn check_symbol_tables(
    symtab: &SymtabCommand,
    dysymtab: &DysymtabCommand,
    linkedit: &SegmentCommand64,
    strict: bool,
) -> Result<()> {
    let linkedit_start = linkedit.fileoff;
    let linkedit_end = linkedit.fileoff.saturating_add(linkedit.filesize);

    if symtab.nsyms > 0 && (symtab.symoff as u64) < linkedit_start {
        return malformed("symbol table underruns __LINKEDIT");
    }
    if symtab.nsyms > 0x1000_0000 {
        return malformed("symbol table too large");
    }
    let symbols_size = symtab.nsyms as u64 * SIZEOF_NLIST_64 as u64;
    if symbols_size > linkedit.filesize {
        return malformed("symbol table overruns __LINKEDIT");
    }
    let symbols_end = symtab.symoff as u64 + symbols_size;
    if symbols_end > u32::MAX as u64 {
        return malformed("symbol table size wraps");
    }
    if symbols_end > symtab.stroff as u64 {
        return malformed("symbol table overlaps symbol strings");
    }
    let strings_end = symtab.stroff as u64 + symtab.strsize as u64;
    if strings_end > u32::MAX as u64 {
        return malformed("symbol string size wraps");
    }
    if strings_end > linkedit_end {
        // Old binaries may overflow as long as they stay within the mapped page.
        let page_end = (linkedit_end + 4095) & !4095;
        if strict || strings_end > page_end {
            return malformed("symbol strings overrun __LINKEDIT");
        }
    }

    if dysymtab.nindirectsyms != 0 {
        if (dysymtab.indirectsymoff as u64) < linkedit_start {
            return malformed("indirect symbol table underruns __LINKEDIT");
        }
        if dysymtab.nindirectsyms > 0x1000_0000 {
            return malformed("indirect symbol table too large");
        }
        let indirect_size = dysymtab.nindirectsyms as u64 * 4;
        if indirect_size > linkedit.filesize {
            return malformed("indirect symbol table overruns __LINKEDIT");
        }
        let indirect_end = dysymtab.indirectsymoff as u64 + indirect_size;
        if indirect_end > u32::MAX as u64 {
            return malformed("indirect symbol table size wraps");
        }
        if strict && indirect_end > symtab.stroff as u64 {
            return malformed("indirect symbol table overruns string pool");
        }
    }

    let ranges = [
        ("local", dysymtab.ilocalsym, dysymtab.nlocalsym),
        ("extern", dysymtab.iextdefsym, dysymtab.nextdefsym),
        ("undefined", dysymtab.iundefsym, dysymtab.nundefsym),
    ];
    for (what, start, count) in ranges {
        if count > symtab.nsyms || start > symtab.nsyms {
            return malformed(format!(
                "indirect symbol table {} symbol count exceeds total symbols",
                what
            ));
        }
        if start.checked_add(count).is_none() {
            return malformed(format!(
                "indirect symbol table {} symbol count wraps",
                what
            ));
        }
    }
    Ok(())
}

/// Every non-OS dylib must depend on something that pulls in libSystem.
fn needs_added_lib_system_dependency(
    library_count: u32,
    header: &MachHeader64,
    has_load_dylib: bool,
    install_name: Option<&[u8]>,
) -> bool {
    if library_count > 1 || header.filetype == MH_EXECUTE || has_load_dylib {
        return false;
    }
    match install_name {
        Some(name) => {
            !name.starts_with(b"/usr/lib/") && !name.starts_with(b"/System/DriverKit/usr/lib/")
        }
        None => false,
    }
}
