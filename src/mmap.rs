//! Memory mappings used by the loader.
//!
//! [`MappedFile`] maps a dylib read-only so its bytes can be validated
//! without copying the file. [`AnonMapping`] is the fresh anonymous region an
//! image's segments are copied into; it is owned by the image and unmapped
//! when the image is dropped.

use crate::{Error, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// A memory-mapped file.
pub struct MappedFile {
    fd: libc::c_int,
    addr: *mut libc::c_void,
    size: usize,
}

impl MappedFile {
    /// Open a file and return a `MappedFile` object.
    pub fn open(path: &Path) -> Result<MappedFile> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null byte")
        })?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        let stat_ret = unsafe { libc::fstat(fd, &mut statbuf as *mut libc::stat) };
        if stat_ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(err.into());
        }
        if (statbuf.st_mode & libc::S_IFMT) != libc::S_IFREG {
            unsafe {
                libc::close(fd);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )
            .into());
        }
        let size = statbuf.st_size as usize;
        if size == 0 {
            // mmap rejects empty ranges; an empty file is simply an empty slice.
            return Ok(Self {
                fd,
                addr: std::ptr::null_mut(),
                size,
            });
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(err.into());
        }
        Ok(Self { fd, addr, size })
    }

    /// The file contents.
    pub fn data(&self) -> &[u8] {
        if self.addr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.size) }
    }

    /// Close the mapped file.
    fn close(&mut self) {
        unsafe {
            if !self.addr.is_null() {
                libc::munmap(self.addr, self.size);
            }
            libc::close(self.fd);
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// A private, anonymous, read/write memory region.
pub struct AnonMapping {
    addr: *mut u8,
    len: usize,
}

// SAFETY: the region is exclusively owned by this value; shared access only
// hands out `&[u8]`, mutation requires `&mut self`.
unsafe impl Send for AnonMapping {}
unsafe impl Sync for AnonMapping {}

impl AnonMapping {
    /// Reserve `len` bytes of zeroed memory anywhere in the address space.
    pub fn new(len: usize) -> Result<AnonMapping> {
        if len == 0 {
            return Err(Error::MappingFailure(
                "cannot allocate an empty image".to_string(),
            ));
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::MappingFailure(format!(
                "failed to allocate 0x{:x} bytes: {}",
                len,
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            addr: addr as *mut u8,
            len,
        })
    }

    /// Start address of the region.
    pub fn start(&self) -> usize {
        self.addr as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr, self.len) }
    }

    /// Change the protection of `[offset, offset + len)` inside the region.
    pub fn protect(&mut self, offset: usize, len: usize, prot: libc::c_int) -> Result<()> {
        let end = offset.checked_add(len).filter(|end| *end <= self.len);
        if end.is_none() {
            return Err(Error::MappingFailure(format!(
                "protection range 0x{:x}+0x{:x} outside mapping",
                offset, len
            )));
        }
        let ret = unsafe {
            libc::mprotect(
                self.addr.add(offset) as *mut libc::c_void,
                len,
                prot,
            )
        };
        if ret != 0 {
            return Err(Error::MappingFailure(format!(
                "mprotect(0x{:x}, 0x{:x}, {:#x}) failed: {}",
                self.start() + offset,
                len,
                prot,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Drop for AnonMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.len);
        }
    }
}
