//! Synthetic Mach-O images for integration tests.
//!
//! [`ImageBuilder`] lays out a three segment dylib:
//!
//! ```text
//! 0x0000  __TEXT      header, load commands, __text, __unwind_info  (R-X)
//! 0x4000  __DATA      pointers for fixup tests                      (RW-)
//! 0x8000  __LINKEDIT  rebase | bind | weak bind | lazy bind | export (R--)
//! ```
//!
//! Preferred addresses are `base_vmaddr` plus the file offset.

#![allow(dead_code)]

use memdyld::dyld::macho::*;
use scroll::{LE, Pwrite};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const PAGE: u64 = 0x4000;
pub const TEXT_OFFSET: u64 = 0;
pub const DATA_OFFSET: u64 = PAGE;
pub const LINKEDIT_OFFSET: u64 = 2 * PAGE;

pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

#[derive(Debug, Clone)]
pub enum Export {
    Regular(u64),
    Resolver { stub: u64, resolver: u64 },
    ThreadLocal(u64),
    Absolute(u64),
    ReExport { ordinal: u64, name: String },
    /// Raw flags and value, for kinds the loader must reject.
    Raw { flags: u64, value: u64 },
}

pub fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn sleb(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Two-byte ULEB128 so node offsets can be fixed before the nodes are laid out.
fn padded_uleb(value: u64) -> [u8; 2] {
    assert!(value < 1 << 14, "trie too large for test builder");
    [0x80 | (value & 0x7f) as u8, (value >> 7) as u8]
}

/// Build a trie whose root has one edge per symbol.
pub fn export_trie(exports: &[(String, Export)]) -> Vec<u8> {
    if exports.is_empty() {
        return Vec::new();
    }
    // Longest labels first so a name is never captured by its own prefix.
    let mut exports: Vec<&(String, Export)> = exports.iter().collect();
    exports.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let nodes: Vec<Vec<u8>> = exports
        .iter()
        .map(|(_, export)| {
            let payload = match export {
                Export::Regular(offset) => [uleb(0), uleb(*offset)].concat(),
                Export::Resolver { stub, resolver } => [
                    uleb(EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER),
                    uleb(*stub),
                    uleb(*resolver),
                ]
                .concat(),
                Export::ThreadLocal(offset) => {
                    [uleb(EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL), uleb(*offset)].concat()
                }
                Export::Absolute(value) => {
                    [uleb(EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE), uleb(*value)].concat()
                }
                Export::ReExport { ordinal, name } => [
                    uleb(EXPORT_SYMBOL_FLAGS_REEXPORT),
                    uleb(*ordinal),
                    name.as_bytes().to_vec(),
                    vec![0],
                ]
                .concat(),
                Export::Raw { flags, value } => [uleb(*flags), uleb(*value)].concat(),
            };
            let mut node = uleb(payload.len() as u64);
            node.extend_from_slice(&payload);
            node.push(0);
            node
        })
        .collect();

    let root_len: usize = 2 + exports.iter().map(|(name, _)| name.len() + 3).sum::<usize>();
    let mut trie = vec![0, exports.len() as u8];
    let mut offset = root_len;
    for ((name, _), node) in exports.iter().zip(&nodes) {
        trie.extend_from_slice(name.as_bytes());
        trie.push(0);
        trie.extend_from_slice(&padded_uleb(offset as u64));
        offset += node.len();
    }
    assert_eq!(trie.len(), root_len);
    for node in nodes {
        trie.extend_from_slice(&node);
    }
    trie
}

fn segname(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

pub fn dylib_command(cmd: u32, name: &str) -> Vec<u8> {
    let cmdsize = (SIZEOF_DYLIB_COMMAND + name.len() + 1).next_multiple_of(8);
    let mut bytes = vec![0u8; cmdsize];
    let dylib = DylibCommand {
        cmd,
        cmdsize: cmdsize as u32,
        name_offset: SIZEOF_DYLIB_COMMAND as u32,
        timestamp: 2,
        current_version: 0x10000,
        compatibility_version: 0x10000,
    };
    bytes.pwrite_with(dylib, 0, LE).unwrap();
    bytes[SIZEOF_DYLIB_COMMAND..SIZEOF_DYLIB_COMMAND + name.len()].copy_from_slice(name.as_bytes());
    bytes
}

pub fn host_cputype() -> u32 {
    if cfg!(target_arch = "aarch64") {
        CPU_TYPE_ARM64
    } else {
        CPU_TYPE_X86_64
    }
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    pub cputype: u32,
    pub filetype: u32,
    pub header_flags: u32,
    pub base_vmaddr: u64,
    /// Preferred address of __DATA relative to `base_vmaddr`.
    pub data_vmaddr: u64,
    pub ncmds: Option<u32>,
    pub install_name: Option<String>,
    pub dylibs: Vec<String>,
    pub exports: Vec<(String, Export)>,
    pub rebase_opcodes: Vec<u8>,
    pub bind_opcodes: Vec<u8>,
    pub weak_bind_opcodes: Vec<u8>,
    pub lazy_bind_opcodes: Vec<u8>,
    /// 64-bit values stored in __DATA at the given offsets.
    pub data_words: Vec<(u64, u64)>,
    /// Raw load commands appended after the standard ones.
    pub extra_commands: Vec<Vec<u8>>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self {
            cputype: host_cputype(),
            filetype: MH_DYLIB,
            header_flags: 0x85, // MH_NOUNDEFS | MH_DYLDLINK | MH_TWOLEVEL
            base_vmaddr: 0,
            data_vmaddr: DATA_OFFSET,
            ncmds: None,
            install_name: Some("@rpath/libtest.dylib".to_string()),
            dylibs: vec!["/usr/lib/libSystem.B.dylib".to_string()],
            exports: Vec::new(),
            rebase_opcodes: Vec::new(),
            bind_opcodes: Vec::new(),
            weak_bind_opcodes: Vec::new(),
            lazy_bind_opcodes: Vec::new(),
            data_words: Vec::new(),
            extra_commands: Vec::new(),
        }
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(mut self, name: &str, export: Export) -> Self {
        self.exports.push((name.to_string(), export));
        self
    }

    pub fn data_word(mut self, offset: u64, value: u64) -> Self {
        self.data_words.push((offset, value));
        self
    }

    pub fn command(mut self, command: Vec<u8>) -> Self {
        self.extra_commands.push(command);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let trie = export_trie(&self.exports);
        let mut linkedit = Vec::new();
        let mut region = |bytes: &[u8]| {
            let off = LINKEDIT_OFFSET as u32 + linkedit.len() as u32;
            linkedit.extend_from_slice(bytes);
            (if bytes.is_empty() { 0 } else { off }, bytes.len() as u32)
        };
        let (rebase_off, rebase_size) = region(&self.rebase_opcodes);
        let (bind_off, bind_size) = region(&self.bind_opcodes);
        let (weak_bind_off, weak_bind_size) = region(&self.weak_bind_opcodes);
        let (lazy_bind_off, lazy_bind_size) = region(&self.lazy_bind_opcodes);
        let (export_off, export_size) = region(&trie);
        linkedit.resize(linkedit.len().next_multiple_of(8).max(8), 0);

        let mut commands: Vec<Vec<u8>> = Vec::new();

        // __TEXT with __text and __unwind_info sections.
        let mut text = vec![0u8; SIZEOF_SEGMENT_COMMAND_64 + 2 * SIZEOF_SECTION_64];
        let text_cmdsize = text.len() as u32;
        text.pwrite_with(
            SegmentCommand64 {
                cmd: LC_SEGMENT_64,
                cmdsize: text_cmdsize,
                segname: segname("__TEXT"),
                vmaddr: self.base_vmaddr + TEXT_OFFSET,
                vmsize: PAGE,
                fileoff: TEXT_OFFSET,
                filesize: PAGE,
                maxprot: VM_PROT_READ | VM_PROT_EXECUTE,
                initprot: VM_PROT_READ | VM_PROT_EXECUTE,
                nsects: 2,
                flags: 0,
            },
            0,
            LE,
        )
        .unwrap();
        for (n, (name, offset, size)) in [("__text", 0x1000u64, 0x100u64), ("__unwind_info", 0x2000, 0x40)]
            .into_iter()
            .enumerate()
        {
            text.pwrite_with(
                Section64 {
                    sectname: segname(name),
                    segname: segname("__TEXT"),
                    addr: self.base_vmaddr + offset,
                    size,
                    offset: offset as u32,
                    align: 4,
                    ..Default::default()
                },
                SIZEOF_SEGMENT_COMMAND_64 + n * SIZEOF_SECTION_64,
                LE,
            )
            .unwrap();
        }
        commands.push(text);

        commands.push(segment_command(
            "__DATA",
            self.base_vmaddr + self.data_vmaddr,
            PAGE,
            DATA_OFFSET,
            PAGE,
            VM_PROT_READ | VM_PROT_WRITE,
        ));
        commands.push(segment_command(
            "__LINKEDIT",
            self.base_vmaddr + LINKEDIT_OFFSET,
            PAGE,
            LINKEDIT_OFFSET,
            linkedit.len() as u64,
            VM_PROT_READ,
        ));

        let mut dyld_info = vec![0u8; SIZEOF_DYLD_INFO_COMMAND];
        dyld_info
            .pwrite_with(
                DyldInfoCommand {
                    cmd: LC_DYLD_INFO_ONLY,
                    cmdsize: SIZEOF_DYLD_INFO_COMMAND as u32,
                    rebase_off,
                    rebase_size,
                    bind_off,
                    bind_size,
                    weak_bind_off,
                    weak_bind_size,
                    lazy_bind_off,
                    lazy_bind_size,
                    export_off,
                    export_size,
                },
                0,
                LE,
            )
            .unwrap();
        commands.push(dyld_info);

        let mut dysymtab = vec![0u8; SIZEOF_DYSYMTAB_COMMAND];
        dysymtab
            .pwrite_with(
                DysymtabCommand {
                    cmd: LC_DYSYMTAB,
                    cmdsize: SIZEOF_DYSYMTAB_COMMAND as u32,
                    ..Default::default()
                },
                0,
                LE,
            )
            .unwrap();
        commands.push(dysymtab);

        if let Some(name) = &self.install_name {
            commands.push(dylib_command(LC_ID_DYLIB, name));
        }
        for dylib in &self.dylibs {
            commands.push(dylib_command(LC_LOAD_DYLIB, dylib));
        }
        commands.extend(self.extra_commands.iter().cloned());

        let sizeofcmds: usize = commands.iter().map(Vec::len).sum();
        assert!(SIZEOF_MACH_HEADER_64 + sizeofcmds <= 0x1000, "load commands overlap __text");

        let mut file = vec![0u8; LINKEDIT_OFFSET as usize + linkedit.len()];
        file.pwrite_with(
            MachHeader64 {
                magic: MH_MAGIC_64,
                cputype: self.cputype,
                cpusubtype: 0,
                filetype: self.filetype,
                ncmds: self.ncmds.unwrap_or(commands.len() as u32),
                sizeofcmds: sizeofcmds as u32,
                flags: self.header_flags,
                reserved: 0,
            },
            0,
            LE,
        )
        .unwrap();
        let mut offset = SIZEOF_MACH_HEADER_64;
        for command in &commands {
            file[offset..offset + command.len()].copy_from_slice(command);
            offset += command.len();
        }
        // Recognisable bytes at the start of __text.
        file[0x1000..0x1004].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        for (offset, value) in &self.data_words {
            file.pwrite_with(*value, (DATA_OFFSET + offset) as usize, LE)
                .unwrap();
        }
        file[LINKEDIT_OFFSET as usize..].copy_from_slice(&linkedit);
        file
    }
}

/// An `LC_SEGMENT_64` command without sections, `vmsize` bytes at `vmaddr`.
pub fn segment_command(
    name: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    prot: u32,
) -> Vec<u8> {
    let mut bytes = vec![0u8; SIZEOF_SEGMENT_COMMAND_64];
    bytes
        .pwrite_with(
            SegmentCommand64 {
                cmd: LC_SEGMENT_64,
                cmdsize: SIZEOF_SEGMENT_COMMAND_64 as u32,
                segname: segname(name),
                vmaddr,
                vmsize,
                fileoff,
                filesize,
                maxprot: prot,
                initprot: prot,
                nsects: 0,
                flags: 0,
            },
            0,
            LE,
        )
        .unwrap();
    bytes
}

/// A header followed by `commands` and nothing else.
pub fn raw_image(commands: &[Vec<u8>]) -> Vec<u8> {
    let sizeofcmds: usize = commands.iter().map(Vec::len).sum();
    let mut file = vec![0u8; SIZEOF_MACH_HEADER_64];
    file.pwrite_with(
        MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: host_cputype(),
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds: commands.len() as u32,
            sizeofcmds: sizeofcmds as u32,
            flags: 0x85,
            reserved: 0,
        },
        0,
        LE,
    )
    .unwrap();
    for command in commands {
        file.extend_from_slice(command);
    }
    file
}

/// Offset of the first occurrence of `needle` in `bytes`.
pub fn find(bytes: &[u8], needle: &[u8]) -> usize {
    bytes
        .windows(needle.len())
        .position(|window| window == needle)
        .unwrap()
}

/// A raw load command of `cmdsize` bytes with the given command number.
pub fn raw_command(cmd: u32, cmdsize: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; cmdsize as usize];
    bytes[0..4].copy_from_slice(&cmd.to_le_bytes());
    bytes[4..8].copy_from_slice(&cmdsize.to_le_bytes());
    bytes
}

/// A linkedit data command pointing at the start of __LINKEDIT.
pub fn linkedit_data_command(cmd: u32) -> Vec<u8> {
    let mut bytes = raw_command(cmd, SIZEOF_LINKEDIT_DATA_COMMAND as u32);
    bytes[8..12].copy_from_slice(&(LINKEDIT_OFFSET as u32).to_le_bytes());
    bytes
}

/// Write `bytes` to a fresh file in the temporary directory.
pub fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "memdyld-test-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Read a native-endian word the loader wrote.
pub fn read_word(address: usize) -> u64 {
    unsafe { std::ptr::read_unaligned(address as *const u64) }
}
