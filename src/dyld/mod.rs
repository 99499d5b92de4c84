//! In-memory Mach-O image loader.
//!
//! Loading an image runs a fixed pipeline:
//!
//! 1. [`sniff::sniff_load_commands`] validates the header and load commands.
//! 2. [`Image::instantiate`] records the segment table.
//! 3. [`Image::map_segments`] reserves one anonymous region for every
//!    segment and copies the file contents in.
//! 4. [`Image::parse_load_cmds`] reads metadata back out of the mapped copy.
//! 5. [`bind::apply_fixups`] applies rebases and binds.
//! 6. Optionally, segments are protected with their initial protections.
//!
//! Any failure drops the partially built image, which unmaps its memory.

use crate::mmap::AnonMapping;
use crate::{Error, Result};
use scroll::{LE, Pread};
use tracing::{debug, info, trace};

pub mod bind;
pub mod dlopen;
pub mod exports;
pub mod leb128;
pub mod macho;
pub mod sniff;

use macho::*;
use sniff::LoadCommandSummary;

pub use exports::Symbol;

/// Page size used to lay out segments.
pub const PAGE_SIZE: u64 = 16384;

fn page_round(addr: u64) -> Option<u64> {
    Some(addr.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
}

/// Policy flags for a load operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkContext {
    /// Apply the full set of structural checks.
    pub strict_macho_required: bool,
    /// Log every segment copy.
    pub verbose_mapping: bool,
    /// Log resolver results and bound imports.
    pub verbose_bind: bool,
    /// `mprotect` each segment to its initial protection after fixups.
    pub protect_segments: bool,
}

impl Default for LinkContext {
    fn default() -> Self {
        Self {
            strict_macho_required: true,
            verbose_mapping: false,
            verbose_bind: false,
            protect_segments: false,
        }
    }
}

impl LinkContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict_macho_required(mut self, strict: bool) -> Self {
        self.strict_macho_required = strict;
        self
    }

    pub fn verbose_mapping(mut self, verbose: bool) -> Self {
        self.verbose_mapping = verbose;
        self
    }

    pub fn verbose_bind(mut self, verbose: bool) -> Self {
        self.verbose_bind = verbose;
        self
    }

    pub fn protect_segments(mut self, protect: bool) -> Self {
        self.protect_segments = protect;
        self
    }

    /// Build a context from `MEMDYLD_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).is_some_and(|v| !v.is_empty() && v != "0");
        Self::new()
            .strict_macho_required(!flag("MEMDYLD_RELAXED"))
            .verbose_mapping(flag("MEMDYLD_PRINT_SEGMENTS"))
            .verbose_bind(flag("MEMDYLD_PRINT_BINDINGS"))
            .protect_segments(flag("MEMDYLD_PROTECT_SEGMENTS"))
    }
}

/// Lifecycle of an [`Image`]. A validated image is represented by its
/// [`LoadCommandSummary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageState {
    Allocated,
    Mapped,
    MetadataParsed,
}

/// Features recorded from the load commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageFlags {
    pub has_initializers: bool,
    pub has_terminators: bool,
    pub has_dof_sections: bool,
    pub has_dash_init: bool,
    pub has_sub_umbrella: bool,
    pub in_umbrella: bool,
    pub has_sub_libraries: bool,
    pub is_split_seg: bool,
    /// Offset of the `__TEXT,__eh_frame` section header from the mach header.
    pub eh_frame_section_offset: Option<u32>,
    /// Offset of the `__TEXT,__unwind_info` section header from the mach header.
    pub unwind_info_section_offset: Option<u32>,
    /// Offset of `LC_ID_DYLIB` from the mach header.
    pub dylib_id_offset: Option<u32>,
}

/// A library the image links against, in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentLibrary {
    pub name: String,
    pub current_version: u32,
    pub weak: bool,
}

/// A loaded Mach-O image.
pub struct Image {
    state: ImageState,
    /// Load command offsets of the segments with a non-zero VM size.
    segments: Box<[u32]>,
    library_count: u32,
    slide: isize,
    mapping: Option<AnonMapping>,
    /// Mapping offset of the segment holding the mach header.
    image_base: usize,
    /// Mapping offset corresponding to file offset 0 of LINKEDIT.
    linkedit_base: i64,
    dyld_info: Option<DyldInfoCommand>,
    symtab: Option<SymtabCommand>,
    dysymtab: Option<DysymtabCommand>,
    flags: ImageFlags,
    dylibs: Vec<DependentLibrary>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("state", &self.state)
            .field("segments", &self.segments.len())
            .field("base", &format_args!("0x{:x}", self.base_address()))
            .field("slide", &format_args!("0x{:x}", self.slide))
            .finish()
    }
}

impl Image {
    /// Run the whole load pipeline over an image held in memory.
    pub fn load_from_memory(raw: &[u8], ctx: &LinkContext) -> Result<Image> {
        let summary = sniff::sniff_load_commands(raw, ctx)?;
        if !summary.compressed {
            return Err(Error::UnsupportedFeature(
                "only compressed LINKEDIT images are supported".to_string(),
            ));
        }
        match summary.header.filetype {
            MH_DYLIB | MH_BUNDLE => {}
            MH_EXECUTE => {
                return Err(Error::UnsupportedFeature(
                    "can't load another MH_EXECUTE".to_string(),
                ));
            }
            other => {
                return Err(Error::UnsupportedFeature(format!(
                    "mach-o file type {} cannot be loaded",
                    other
                )));
            }
        }

        let mut image = Image::instantiate(&summary, raw)?;
        image.map_segments(raw, ctx)?;
        image.parse_load_cmds(ctx)?;
        bind::apply_fixups(&mut image, ctx)?;
        if ctx.protect_segments {
            image.protect_segments(ctx)?;
        }
        debug!("loaded image at 0x{:x} (slide 0x{:x})", image.base_address(), image.slide);
        Ok(image)
    }

    /// Record the segment table of a validated image.
    pub fn instantiate(summary: &LoadCommandSummary, raw: &[u8]) -> Result<Image> {
        let mut segments = Vec::with_capacity(summary.segment_count as usize);
        for cmd in LoadCommands::new(raw, &summary.header)? {
            let cmd = cmd?;
            if cmd.cmd != LC_SEGMENT_64 {
                continue;
            }
            let seg: SegmentCommand64 = cmd.read(raw)?;
            if seg.vmsize != 0 {
                segments.push(cmd.offset as u32);
            }
        }
        if segments.len() != summary.segment_count as usize {
            return Err(Error::MalformedBinary(format!(
                "segment count changed between passes ({} != {})",
                segments.len(),
                summary.segment_count
            )));
        }
        Ok(Image {
            state: ImageState::Allocated,
            segments: segments.into_boxed_slice(),
            library_count: summary.library_count,
            slide: 0,
            mapping: None,
            image_base: 0,
            linkedit_base: 0,
            dyld_info: None,
            symtab: None,
            dysymtab: None,
            flags: ImageFlags {
                is_split_seg: (summary.header.flags & MH_SPLIT_SEGS) != 0,
                ..Default::default()
            },
            dylibs: Vec::new(),
        })
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    pub fn slide(&self) -> isize {
        self.slide
    }

    /// Address of the mapped mach header, or 0 before mapping.
    pub fn base_address(&self) -> usize {
        self.mapping
            .as_ref()
            .map_or(0, |mapping| mapping.start() + self.image_base)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn library_count(&self) -> u32 {
        self.library_count
    }

    pub fn flags(&self) -> &ImageFlags {
        &self.flags
    }

    pub fn dependent_libraries(&self) -> &[DependentLibrary] {
        &self.dylibs
    }

    pub fn dyld_info(&self) -> Option<&DyldInfoCommand> {
        self.dyld_info.as_ref()
    }

    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.symtab.as_ref()
    }

    pub fn dysymtab(&self) -> Option<&DysymtabCommand> {
        self.dysymtab.as_ref()
    }

    fn require_state(&self, state: ImageState, what: &str) -> Result<()> {
        if self.state != state {
            return Err(Error::MappingFailure(format!(
                "{} requires image state {:?}, image is {:?}",
                what, state, self.state
            )));
        }
        Ok(())
    }

    /// The mapped mach header and everything after it.
    fn mach_data(&self) -> Result<&[u8]> {
        let mapping = self
            .mapping
            .as_ref()
            .ok_or_else(|| Error::MappingFailure("image is not mapped".to_string()))?;
        Ok(&mapping.as_slice()[self.image_base..])
    }

    fn segment_in(&self, data: &[u8], index: usize) -> Result<SegmentCommand64> {
        let offset = *self.segments.get(index).ok_or_else(|| {
            Error::MalformedBinary(format!("segment index {} out of range", index))
        })?;
        Ok(data.pread_with(offset as usize, LE)?)
    }

    /// Segment command `index`, read from the mapped copy.
    pub fn segment(&self, index: usize) -> Result<SegmentCommand64> {
        self.segment_in(self.mach_data()?, index)
    }

    /// Where segment `index` was placed.
    pub fn segment_load_address(&self, index: usize) -> Result<usize> {
        let seg = self.segment(index)?;
        Ok((seg.vmaddr as usize).wrapping_add_signed(self.slide))
    }

    /// Mapping offset of a preferred VM address.
    fn mapping_offset(mapping: &AnonMapping, slide: isize, vmaddr: u64) -> Option<usize> {
        let load = (vmaddr as usize).wrapping_add_signed(slide);
        load.checked_sub(mapping.start())
            .filter(|off| *off <= mapping.len())
    }

    /// Mapping offset and length of segment `index`.
    pub(crate) fn segment_range(&self, index: usize) -> Result<(usize, usize)> {
        let seg = self.segment(index)?;
        let mapping = self
            .mapping
            .as_ref()
            .ok_or_else(|| Error::MappingFailure("image is not mapped".to_string()))?;
        let start = Self::mapping_offset(mapping, self.slide, seg.vmaddr).ok_or_else(|| {
            Error::MalformedBinary(format!("segment {} outside mapping", seg.name()))
        })?;
        Ok((start, seg.vmsize as usize))
    }

    pub(crate) fn mapping(&self) -> Result<&AnonMapping> {
        self.mapping
            .as_ref()
            .ok_or_else(|| Error::MappingFailure("image is not mapped".to_string()))
    }

    pub(crate) fn mapping_mut(&mut self) -> Result<&mut AnonMapping> {
        self.mapping
            .as_mut()
            .ok_or_else(|| Error::MappingFailure("image is not mapped".to_string()))
    }

    /// Bytes `[off, off + size)` of LINKEDIT, addressed by file offset.
    pub(crate) fn linkedit_slice(&self, off: u32, size: u32) -> Result<&[u8]> {
        let mapping = self.mapping()?;
        let start = self.linkedit_base + off as i64;
        let end = start + size as i64;
        if start < 0 || end as usize > mapping.len() {
            return Err(Error::MalformedBinary(format!(
                "LINKEDIT range 0x{:x}+0x{:x} is outside the mapped image",
                off, size
            )));
        }
        Ok(&mapping.as_slice()[start as usize..end as usize])
    }

    /// Reserve one anonymous region covering every segment.
    ///
    /// Preferred addresses are never honoured: the whole image always slides
    /// into fresh memory.
    pub fn assign_segment_addresses(&self, raw: &[u8], ctx: &LinkContext) -> Result<(AnonMapping, isize)> {
        self.require_state(ImageState::Allocated, "assigning segment addresses")?;
        if self.segments.is_empty() {
            return Err(Error::MappingFailure("image has no segments".to_string()));
        }
        let mut low = u64::MAX;
        let mut high = 0u64;
        for index in 0..self.segments.len() {
            let seg = self.segment_in(raw, index)?;
            let seg_low = seg.vmaddr;
            let seg_high = seg
                .vmaddr
                .checked_add(seg.vmsize)
                .and_then(page_round)
                .ok_or_else(|| {
                    Error::MappingFailure(format!("segment {} wraps address space", seg.name()))
                })?;
            if seg_low < high {
                return Err(Error::MappingFailure("overlapping segments".to_string()));
            }
            low = low.min(seg_low);
            high = high.max(seg_high);
        }
        let size = usize::try_from(high - low)
            .map_err(|_| Error::MappingFailure("image too large".to_string()))?;
        let mapping = AnonMapping::new(size)?;
        let slide = (mapping.start() as isize).wrapping_sub(low as isize);
        if ctx.verbose_mapping {
            info!(
                "reserved 0x{:x} bytes at 0x{:x} for preferred range 0x{:x}-0x{:x}",
                size,
                mapping.start(),
                low,
                high
            );
        }
        Ok((mapping, slide))
    }

    /// Copy every segment's file contents to its slid address.
    pub fn map_segments(&mut self, raw: &[u8], ctx: &LinkContext) -> Result<()> {
        let (mut mapping, slide) = self.assign_segment_addresses(raw, ctx)?;
        if ctx.verbose_mapping {
            info!("mapping memory image at {:p}", raw.as_ptr());
        }
        let mut image_base = None;
        for index in 0..self.segments.len() {
            let seg = self.segment_in(raw, index)?;
            let size = seg.filesize as usize;
            let src = usize::try_from(seg.fileoff)
                .ok()
                .and_then(|start| raw.get(start..start.checked_add(size)?))
                .ok_or_else(|| {
                    Error::MappingFailure(format!(
                        "segment {} file range 0x{:x}+0x{:x} is outside the image",
                        seg.name(),
                        seg.fileoff,
                        seg.filesize
                    ))
                })?;
            let dst = Self::mapping_offset(&mapping, slide, seg.vmaddr)
                .and_then(|start| Some(start..start.checked_add(size)?))
                .filter(|range| range.end <= mapping.len())
                .ok_or_else(|| {
                    Error::MappingFailure(format!(
                        "segment {} does not fit in the reserved region",
                        seg.name()
                    ))
                })?;
            let load_address = mapping.start() + dst.start;
            if seg.fileoff == 0 && seg.filesize != 0 {
                image_base = Some(dst.start);
            }
            mapping.as_mut_slice()[dst].copy_from_slice(src);
            if ctx.verbose_mapping {
                info!(
                    "{:>18} at 0x{:08x}->0x{:08x}",
                    seg.name(),
                    load_address,
                    (load_address + size).saturating_sub(1)
                );
            }
        }
        self.image_base = image_base.ok_or_else(|| {
            Error::MalformedBinary("no segment maps the start of the file".to_string())
        })?;
        self.mapping = Some(mapping);
        self.slide = slide;
        self.state = ImageState::Mapped;
        Ok(())
    }

    /// Extract metadata from the mapped load commands.
    pub fn parse_load_cmds(&mut self, _ctx: &LinkContext) -> Result<()> {
        self.require_state(ImageState::Mapped, "parsing load commands")?;

        let mapping = self.mapping()?;
        let mut image_base = None;
        let mut linkedit_base = None;
        for index in 0..self.segments.len() {
            let seg = self.segment(index)?;
            let start = Self::mapping_offset(mapping, self.slide, seg.vmaddr).ok_or_else(|| {
                Error::MalformedBinary(format!("segment {} outside mapping", seg.name()))
            })?;
            if seg.name() == "__LINKEDIT" {
                linkedit_base = Some(start as i64 - seg.fileoff as i64);
            }
            if seg.fileoff == 0 && seg.filesize != 0 {
                image_base = Some(start);
            }
        }
        if image_base != Some(self.image_base) {
            return Err(Error::MalformedBinary(
                "no segment maps the start of the file".to_string(),
            ));
        }
        self.linkedit_base = linkedit_base
            .ok_or_else(|| Error::MalformedBinary("missing __LINKEDIT segment".to_string()))?;

        let data = self.mach_data()?;
        let header = parse_header(data)?;
        let mut dyld_info = None;
        let mut symtab = None;
        let mut dysymtab = None;
        let mut chained_fixups = false;
        let mut exports_trie = false;
        let mut first_unknown: Option<u32> = None;
        let mut min_os_version: Option<u32> = None;
        let mut flags = ImageFlags {
            is_split_seg: self.flags.is_split_seg,
            ..Default::default()
        };
        let mut dylibs = Vec::new();

        for cmd in LoadCommands::new(data, &header)? {
            let cmd = cmd?;
            match cmd.cmd {
                LC_SYMTAB => symtab = Some(cmd.read::<SymtabCommand>(data)?),
                LC_DYSYMTAB => dysymtab = Some(cmd.read::<DysymtabCommand>(data)?),
                LC_SUB_UMBRELLA => flags.has_sub_umbrella = true,
                LC_SUB_FRAMEWORK => flags.in_umbrella = true,
                LC_SUB_LIBRARY => flags.has_sub_libraries = true,
                LC_ROUTINES_64 => flags.has_dash_init = true,
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    dyld_info = Some(cmd.read::<DyldInfoCommand>(data)?)
                }
                LC_DYLD_CHAINED_FIXUPS => chained_fixups = true,
                LC_DYLD_EXPORTS_TRIE => exports_trie = true,
                LC_SEGMENT_64 => {
                    let seg: SegmentCommand64 = cmd.read(data)?;
                    let is_text = seg.name() == "__TEXT";
                    for n in 0..seg.nsects as usize {
                        let offset = cmd.offset + SIZEOF_SEGMENT_COMMAND_64 + n * SIZEOF_SECTION_64;
                        let sect: Section64 = data.pread_with(offset, LE)?;
                        match sect.flags & SECTION_TYPE {
                            S_MOD_INIT_FUNC_POINTERS | S_INIT_FUNC_OFFSETS => {
                                flags.has_initializers = true
                            }
                            S_MOD_TERM_FUNC_POINTERS => flags.has_terminators = true,
                            S_DTRACE_DOF => flags.has_dof_sections = true,
                            _ if is_text && sect.name() == "__eh_frame" => {
                                flags.eh_frame_section_offset = Some(offset as u32)
                            }
                            _ if is_text && sect.name() == "__unwind_info" => {
                                flags.unwind_info_section_offset = Some(offset as u32)
                            }
                            _ => {}
                        }
                    }
                }
                LC_ID_DYLIB => flags.dylib_id_offset = Some(cmd.offset as u32),
                LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB => {
                    let bytes = cmd.bytes(data)?;
                    let dylib: DylibCommand = bytes.pread_with(0, LE)?;
                    let name = c_str_at(bytes, dylib.name_offset as usize).ok_or_else(|| {
                        Error::MalformedBinary(format!(
                            "dylib load command #{} has an unterminated name",
                            cmd.index
                        ))
                    })?;
                    dylibs.push(DependentLibrary {
                        name: String::from_utf8_lossy(name).into_owned(),
                        current_version: dylib.current_version,
                        weak: cmd.cmd == LC_LOAD_WEAK_DYLIB,
                    });
                }
                LC_TWOLEVEL_HINTS | LC_RPATH | LC_MAIN => {}
                LC_VERSION_MIN_MACOSX
                | LC_VERSION_MIN_IPHONEOS
                | LC_VERSION_MIN_TVOS
                | LC_VERSION_MIN_WATCHOS => {
                    min_os_version = Some(cmd.read::<VersionMinCommand>(data)?.version);
                }
                other => {
                    if (other & LC_REQ_DYLD) != 0 && first_unknown.is_none() {
                        first_unknown = Some(other);
                    }
                }
            }
            trace!("parsed load command #{} (0x{:x})", cmd.index, cmd.cmd);
        }

        if let Some(unknown) = first_unknown {
            return Err(Error::UnsupportedFeature(match min_os_version {
                Some(version) => format!(
                    "cannot load because it was built for OS version {}.{} (load command 0x{:08x} is unknown)",
                    version >> 16,
                    (version >> 8) & 0xff,
                    unknown
                ),
                None => format!("cannot load (load command 0x{:08x} is unknown)", unknown),
            }));
        }
        if chained_fixups || exports_trie {
            return Err(Error::UnsupportedFeature("Loader unimplemented".to_string()));
        }

        debug!(
            "parsed load commands: {} dependent libraries, flags {:?}",
            dylibs.len(),
            flags
        );
        self.dyld_info = dyld_info;
        self.symtab = symtab;
        self.dysymtab = dysymtab;
        self.flags = flags;
        self.dylibs = dylibs;
        self.state = ImageState::MetadataParsed;
        Ok(())
    }

    /// Apply each segment's initial protection to its mapped pages.
    pub fn protect_segments(&mut self, ctx: &LinkContext) -> Result<()> {
        for index in 0..self.segments.len() {
            let seg = self.segment(index)?;
            let (start, _) = self.segment_range(index)?;
            let mapping = self.mapping_mut()?;
            let len = page_round(seg.vmsize)
                .map(|len| len as usize)
                .unwrap_or(usize::MAX)
                .min(mapping.len() - start);
            let mut prot = libc::PROT_NONE;
            if (seg.initprot & VM_PROT_READ) != 0 {
                prot |= libc::PROT_READ;
            }
            if (seg.initprot & VM_PROT_WRITE) != 0 {
                prot |= libc::PROT_WRITE;
            }
            if (seg.initprot & VM_PROT_EXECUTE) != 0 {
                prot |= libc::PROT_EXEC;
            }
            mapping.protect(start, len, prot)?;
            if ctx.verbose_mapping {
                info!("{:>18} protected {:#x}", seg.name(), prot);
            }
        }
        Ok(())
    }
}
