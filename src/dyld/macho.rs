//! Mach-O binary format structures and constants.
//!
//! Every structure derives `scroll::Pread`, so reads out of an untrusted
//! image are bounds checked and alignment free. All reads use an explicit
//! little-endian context; big-endian images are rejected up front.

use crate::{Error, Result};
use scroll::{LE, Pread, Pwrite, SizeWith};

// Mach-O magic numbers
pub const MH_MAGIC_64: u32 = 0xfeedfacf; // 64-bit Mach-O
pub const MH_CIGAM_64: u32 = 0xcffaedfe; // 64-bit Mach-O, byte swapped
pub const MH_MAGIC: u32 = 0xfeedface; // 32-bit Mach-O
pub const MH_CIGAM: u32 = 0xcefaedfe;
pub const FAT_MAGIC: u32 = 0xcafebabe; // Fat binary (big-endian)
pub const FAT_CIGAM: u32 = 0xbebafeca; // Fat binary (little-endian)
pub const FAT_MAGIC_64: u32 = 0xcafebabf;
pub const FAT_CIGAM_64: u32 = 0xbfbafeca;

// CPU types
pub const CPU_ARCH_ABI64: u32 = 0x01000000;
pub const CPU_TYPE_X86_64: u32 = 7 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM64: u32 = 12 | CPU_ARCH_ABI64;

// File types
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_BUNDLE: u32 = 0x8;

// Mach-O flags
pub const MH_SPLIT_SEGS: u32 = 0x00000020;
pub const MH_DYLIB_IN_CACHE: u32 = 0x80000000;

// Load command types
pub const LC_REQ_DYLD: u32 = 0x80000000;
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_DYLINKER: u32 = 0xe;
pub const LC_ROUTINES: u32 = 0x11;
pub const LC_SUB_FRAMEWORK: u32 = 0x12;
pub const LC_SUB_UMBRELLA: u32 = 0x13;
pub const LC_SUB_CLIENT: u32 = 0x14;
pub const LC_SUB_LIBRARY: u32 = 0x15;
pub const LC_TWOLEVEL_HINTS: u32 = 0x16;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_ROUTINES_64: u32 = 0x1a;
pub const LC_UUID: u32 = 0x1b;
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_SOURCE_VERSION: u32 = 0x2a;
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;
pub const LC_VERSION_MIN_TVOS: u32 = 0x2f;
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
pub const LC_BUILD_VERSION: u32 = 0x32;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// Segment flags
pub const SG_NORELOC: u32 = 0x4;

// VM protections
pub const VM_PROT_READ: u32 = 0x1;
pub const VM_PROT_WRITE: u32 = 0x2;
pub const VM_PROT_EXECUTE: u32 = 0x4;

// Section types
pub const SECTION_TYPE: u32 = 0x000000ff;
pub const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9;
pub const S_MOD_TERM_FUNC_POINTERS: u32 = 0xa;
pub const S_DTRACE_DOF: u32 = 0xf;
pub const S_INIT_FUNC_OFFSETS: u32 = 0x16;

// Structure sizes as laid out in the file
pub const SIZEOF_MACH_HEADER_64: usize = 32;
pub const SIZEOF_LOAD_COMMAND: usize = 8;
pub const SIZEOF_SEGMENT_COMMAND_64: usize = 72;
pub const SIZEOF_SECTION_64: usize = 80;
pub const SIZEOF_DYLD_INFO_COMMAND: usize = 48;
pub const SIZEOF_LINKEDIT_DATA_COMMAND: usize = 16;
pub const SIZEOF_SYMTAB_COMMAND: usize = 24;
pub const SIZEOF_DYSYMTAB_COMMAND: usize = 80;
pub const SIZEOF_DYLIB_COMMAND: usize = 24;
pub const SIZEOF_ENCRYPTION_INFO_COMMAND: usize = 20;
pub const SIZEOF_ENCRYPTION_INFO_COMMAND_64: usize = 24;
pub const SIZEOF_NLIST_64: usize = 16;

/// Mach-O 64-bit header
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct MachHeader64 {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

/// Generic load command header
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct LoadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
}

/// 64-bit segment load command
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

impl SegmentCommand64 {
    pub fn name(&self) -> &str {
        fixed_str(&self.segname)
    }
}

/// 64-bit section within a segment
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

impl Section64 {
    pub fn name(&self) -> &str {
        fixed_str(&self.sectname)
    }

    pub fn segment_name(&self) -> &str {
        fixed_str(&self.segname)
    }
}

/// Dynamic library command (LC_LOAD_DYLIB, LC_ID_DYLIB, ...)
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct DylibCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub name_offset: u32,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// LinkEdit data command (LC_CODE_SIGNATURE, LC_DYLD_CHAINED_FIXUPS, etc.)
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct LinkeditDataCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

/// Dynamic linker info command (LC_DYLD_INFO, LC_DYLD_INFO_ONLY)
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct DyldInfoCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct DysymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

/// LC_ENCRYPTION_INFO. The 64-bit variant only adds trailing padding, so
/// both are represented by this structure once validated.
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct EncryptionInfoCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub cryptoff: u32,
    pub cryptsize: u32,
    pub cryptid: u32,
}

#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
#[repr(C)]
pub struct VersionMinCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub version: u32,
    pub sdk: u32,
}

/// Interpret a fixed-size, NUL-padded name field.
pub fn fixed_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("<invalid>")
}

/// Return the NUL-terminated string starting at `start`, if the terminator
/// lies inside `data`.
pub fn c_str_at(data: &[u8], start: usize) -> Option<&[u8]> {
    let tail = data.get(start..)?;
    let len = tail.iter().position(|b| *b == 0)?;
    Some(&tail[..len])
}

/// Parse and sanity check the Mach-O header at the start of `data`.
pub fn parse_header(data: &[u8]) -> Result<MachHeader64> {
    if data.len() < SIZEOF_MACH_HEADER_64 {
        return Err(Error::MalformedBinary(format!(
            "file too small ({} bytes) to hold a mach header",
            data.len()
        )));
    }
    let magic: u32 = data.pread_with(0, LE)?;
    match magic {
        MH_MAGIC_64 => {}
        FAT_MAGIC | FAT_CIGAM | FAT_MAGIC_64 | FAT_CIGAM_64 => {
            return Err(Error::UnsupportedFeature(
                "fat (universal) binaries are not supported".to_string(),
            ));
        }
        MH_MAGIC | MH_CIGAM => {
            return Err(Error::UnsupportedFeature(
                "32-bit mach-o images are not supported".to_string(),
            ));
        }
        MH_CIGAM_64 => {
            return Err(Error::UnsupportedFeature(
                "big-endian mach-o images are not supported".to_string(),
            ));
        }
        _ => {
            return Err(Error::MalformedBinary(format!(
                "not a mach-o file (magic 0x{:08x})",
                magic
            )));
        }
    }
    Ok(data.pread_with(0, LE)?)
}

/// A load command located inside the command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRef {
    pub index: u32,
    /// Offset of the command from the start of the image.
    pub offset: usize,
    pub cmd: u32,
    pub cmdsize: u32,
}

impl CommandRef {
    /// Read the full command structure.
    pub fn read<'a, T>(&self, data: &'a [u8]) -> Result<T>
    where
        T: scroll::ctx::TryFromCtx<'a, scroll::Endian, Error = scroll::Error>,
    {
        Ok(data.pread_with(self.offset, LE)?)
    }

    /// Bytes covered by this command.
    pub fn bytes<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        data.get(self.offset..self.offset + self.cmdsize as usize)
            .ok_or_else(|| {
                Error::MalformedBinary(format!(
                    "load command #{} extends past end of file",
                    self.index
                ))
            })
    }
}

/// Iterator over the load command table `[32, 32 + sizeofcmds)`.
///
/// Each step checks that the command is at least 8 bytes long and that the
/// next command starts inside the table. Iteration stops after the first
/// error.
pub struct LoadCommands<'a> {
    data: &'a [u8],
    offset: usize,
    end: usize,
    index: u32,
    ncmds: u32,
    sizeofcmds: u32,
    failed: bool,
}

impl<'a> LoadCommands<'a> {
    pub fn new(data: &'a [u8], header: &MachHeader64) -> Result<Self> {
        let end = SIZEOF_MACH_HEADER_64 + header.sizeofcmds as usize;
        if end > data.len() {
            return Err(Error::MalformedBinary(format!(
                "load commands (sizeofcmds {}) extend past end of file",
                header.sizeofcmds
            )));
        }
        Ok(Self {
            data,
            offset: SIZEOF_MACH_HEADER_64,
            end,
            index: 0,
            ncmds: header.ncmds,
            sizeofcmds: header.sizeofcmds,
            failed: false,
        })
    }

    fn step(&mut self) -> Result<CommandRef> {
        let index = self.index;
        if self.offset + SIZEOF_LOAD_COMMAND > self.end {
            return Err(Error::MalformedBinary(format!(
                "load command #{} header would exceed sizeofcmds ({})",
                index, self.sizeofcmds
            )));
        }
        let lc: LoadCommand = self.data.pread_with(self.offset, LE)?;
        if (lc.cmdsize as usize) < SIZEOF_LOAD_COMMAND {
            return Err(Error::MalformedBinary(format!(
                "load command #{} length ({}) too small",
                index, lc.cmdsize
            )));
        }
        let next = self.offset + lc.cmdsize as usize;
        if next > self.end {
            return Err(Error::MalformedBinary(format!(
                "load command #{} length ({}) would exceed sizeofcmds ({})",
                index, lc.cmdsize, self.sizeofcmds
            )));
        }
        let cmd = CommandRef {
            index,
            offset: self.offset,
            cmd: lc.cmd,
            cmdsize: lc.cmdsize,
        };
        self.offset = next;
        self.index += 1;
        Ok(cmd)
    }
}

impl Iterator for LoadCommands<'_> {
    type Item = Result<CommandRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.ncmds {
            return None;
        }
        let item = self.step();
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}
