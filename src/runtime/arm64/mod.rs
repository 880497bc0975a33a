//! AArch64 backend: executable code buffer, block index, linker, compile
//! driver, and fastmem fault recovery.

mod address_space;
mod assembler;
mod emit;
mod fastmem;
mod signal;
mod text;

pub use address_space::{AddressSpace, MAX_CODE_CACHE_SIZE};
pub use assembler::{Assembler, SCRATCH1};
pub use emit::{
    BlockInfo, BlockRelocation, BlockRelocationKind, FakeCall, FastmemPatch, HostEntry, LinkTarget,
    PreludeInfo, Relocation, Translator,
};
pub use fastmem::{DoNotFastmemMarker, FastmemManager, MemoryAccessKind};
pub use text::TextBuffer;

pub const ARM64_INSN_SIZE: usize = 4;

/// Flush the instruction cache over a range of freshly written code.
///
/// Every byte written or patched since the buffer was last made executable must
/// be covered by a flush before it runs.
pub fn flush_icache_range(start: *const u8, size: usize) {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    unsafe {
        sys_icache_invalidate(start as *mut libc::c_void, size);

        std::arch::asm!("dsb sy");
        std::arch::asm!("isb");
    }

    #[cfg(all(not(target_os = "macos"), target_arch = "aarch64"))]
    unsafe {
        __clear_cache(
            start as *mut libc::c_char,
            start.add(size) as *mut libc::c_char,
        );
    }

    // Hosts that cannot execute AArch64 code only ever treat the buffer as
    // data; a compiler fence keeps the writes ordered for readers.
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (start, size);
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe extern "C" {
    pub(crate) fn pthread_jit_write_protect_np(enabled: libc::c_int);
    pub(crate) fn sys_icache_invalidate(start: *mut libc::c_void, size: libc::size_t);
}

#[cfg(all(not(target_os = "macos"), target_arch = "aarch64"))]
unsafe extern "C" {
    /// Compiler builtin covering the data-cache clean / instruction-cache
    /// invalidate sequence.
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}
