//! Executable code buffer.
//!
//! A fixed-size anonymous mapping that holds the prelude and every translated
//! block. The buffer toggles between writable (during emission and patching)
//! and executable (at every public-call boundary), and owns the
//! instruction-cache flush over freshly written ranges.
//!
//! On macOS the mapping is created with `MAP_JIT` and toggled per-thread with
//! `pthread_jit_write_protect_np`; elsewhere the toggle is an `mprotect`
//! RW/RX transition over the whole region.

use super::emit::HostEntry;
use super::{ARM64_INSN_SIZE, flush_icache_range};
use crate::{Error, Result};
use tracing::trace;

/// Remaining-capacity threshold below which the cache is considered nearly
/// full and the next compile triggers a whole-cache reset.
pub(crate) const NEARLY_FULL_MARGIN: usize = 1024 * 1024;

/// The executable region and its append cursor.
pub struct TextBuffer {
    /// Base of the mapping.
    base: *mut u8,
    /// Mapping size in bytes.
    size: usize,
    /// Next free address. Advances as code is written; rewinds only on a
    /// whole-cache reset.
    cursor: usize,
    /// Current permission state. Transitions are idempotent.
    writable: bool,
}

impl TextBuffer {
    pub(crate) fn new(size: usize) -> Result<Self> {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_JIT;
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        let prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        let base = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
        if base == libc::MAP_FAILED {
            return Err(Error::MemoryMapping(format!(
                "failed to map {} byte code buffer: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        unsafe {
            super::pthread_jit_write_protect_np(0)
        };

        trace!("code buffer mapped at {:p}, {} bytes", base, size);

        Ok(Self {
            base: base as *mut u8,
            size,
            cursor: base as usize,
            writable: true,
        })
    }

    /// Make the buffer writable. Code must not run from it until the next
    /// [`protect`].
    ///
    /// [`protect`]: TextBuffer::protect
    pub fn unprotect(&mut self) {
        if self.writable {
            return;
        }
        self.writable = true;

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        unsafe {
            super::pthread_jit_write_protect_np(0)
        };

        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        unsafe {
            let ret = libc::mprotect(
                self.base as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
            );
            assert_eq!(
                ret,
                0,
                "mprotect(RW) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    /// Make the buffer executable. Callers must have flushed the instruction
    /// cache over every byte written since the last [`unprotect`].
    ///
    /// [`unprotect`]: TextBuffer::unprotect
    pub fn protect(&mut self) {
        if !self.writable {
            return;
        }
        self.writable = false;

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        unsafe {
            super::pthread_jit_write_protect_np(1)
        };

        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        unsafe {
            let ret = libc::mprotect(
                self.base as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            );
            assert_eq!(
                ret,
                0,
                "mprotect(RX) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    /// Flush the instruction cache over `[entry, entry + size)`.
    pub fn invalidate(&self, entry: HostEntry, size: usize) {
        flush_icache_range(entry.as_ptr(), size);
    }

    /// Current append position.
    pub fn cursor(&self) -> HostEntry {
        HostEntry::from_address(self.cursor)
    }

    /// Rewind the cursor, abandoning everything written past `entry`. Used
    /// only by whole-cache resets.
    pub fn rewind_to(&mut self, entry: HostEntry) {
        let address = entry.address();
        assert!(
            address >= self.base as usize && address <= self.base as usize + self.size,
            "rewind target {:#x} outside code buffer",
            address
        );
        self.cursor = address;
    }

    /// Bytes left between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.base as usize + self.size - self.cursor
    }

    pub fn is_nearly_full(&self) -> bool {
        self.remaining() < NEARLY_FULL_MARGIN
    }

    /// Append one instruction word at the cursor.
    pub fn write_u32(&mut self, insn: u32) {
        assert!(self.writable, "write to protected code buffer");
        assert!(self.remaining() >= ARM64_INSN_SIZE, "code buffer exhausted");
        unsafe {
            std::ptr::write(self.cursor as *mut u32, insn);
        }
        self.cursor += ARM64_INSN_SIZE;
    }

    pub(crate) fn start(&self) -> usize {
        self.base as usize
    }

    pub(crate) fn end(&self) -> usize {
        self.base as usize + self.size
    }

    pub(crate) fn is_executable(&self) -> bool {
        !self.writable
    }
}

impl Drop for TextBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advances_and_remaining_shrinks() {
        let mut text = TextBuffer::new(64 * 1024).unwrap();
        let start = text.cursor();
        assert_eq!(text.remaining(), 64 * 1024);

        text.write_u32(0xd503201f);
        text.write_u32(0xd503201f);
        assert_eq!(text.cursor().address(), start.address() + 8);
        assert_eq!(text.remaining(), 64 * 1024 - 8);

        text.rewind_to(start);
        assert_eq!(text.remaining(), 64 * 1024);
    }

    #[test]
    fn written_words_read_back() {
        let mut text = TextBuffer::new(4096).unwrap();
        let entry = text.cursor();
        text.write_u32(0x1400_0001);
        let read = unsafe { std::ptr::read(entry.as_ptr() as *const u32) };
        assert_eq!(read, 0x1400_0001);
    }

    #[test]
    fn protection_transitions_are_idempotent() {
        let mut text = TextBuffer::new(4096).unwrap();
        assert!(!text.is_executable());

        text.protect();
        text.protect();
        assert!(text.is_executable());

        text.unprotect();
        text.unprotect();
        assert!(!text.is_executable());

        // The buffer stays readable while executable.
        text.write_u32(0xd503201f);
        text.invalidate(text.cursor(), 0);
        text.protect();
        let read = unsafe { std::ptr::read(text.start() as *const u32) };
        assert_eq!(read, 0xd503201f);
    }

    #[test]
    fn nearly_full_tracks_the_low_water_mark() {
        let mut text = TextBuffer::new(NEARLY_FULL_MARGIN + 8192).unwrap();
        assert!(!text.is_nearly_full());

        for _ in 0..(8192 / 4) {
            text.write_u32(0xd503201f);
        }
        assert!(!text.is_nearly_full());

        text.write_u32(0xd503201f);
        assert!(text.is_nearly_full());
    }
}
