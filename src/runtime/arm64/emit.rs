//! Emitter contract: the metadata a block emitter hands back for every
//! translated block, and the prelude record external relocations resolve
//! against.
//!
//! The emitter itself lives outside this crate. It appends machine code at the
//! buffer cursor and describes the result with a [`BlockInfo`]: where the block
//! starts, how big it is, which emitted words are placeholders still to be
//! patched (relocations), and which words are optimistic fastmem accesses that
//! the fault handler may need to rewrite.

use super::fastmem::{DoNotFastmemMarker, FastmemManager};
use super::text::TextBuffer;
use crate::ir::{GuestLocation, IrBlock};
use crate::runtime::EmitConfig;
use std::collections::HashMap;
use std::fmt;

/// Address of a translated block's first instruction inside the code buffer.
///
/// Entries only ever move forward as the cursor advances; an address is never
/// reused until a whole-cache reset.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostEntry(usize);

impl HostEntry {
    pub fn from_address(address: usize) -> Self {
        Self(address)
    }

    pub fn address(self) -> usize {
        self.0
    }

    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Address `offset` bytes into the block.
    pub fn at_offset(self, offset: usize) -> *mut u8 {
        (self.0 + offset) as *mut u8
    }
}

impl fmt::Debug for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostEntry({:#x})", self.0)
    }
}

/// Prelude helper named by an external relocation.
///
/// A closed set; the linker matches exhaustively and an unknown tag is a bug.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LinkTarget {
    ReturnToDispatcher,
    ReturnFromRunCode,
    ReadMemory8,
    ReadMemory16,
    ReadMemory32,
    ReadMemory64,
    ReadMemory128,
    WrappedReadMemory8,
    WrappedReadMemory16,
    WrappedReadMemory32,
    WrappedReadMemory64,
    WrappedReadMemory128,
    ExclusiveReadMemory8,
    ExclusiveReadMemory16,
    ExclusiveReadMemory32,
    ExclusiveReadMemory64,
    ExclusiveReadMemory128,
    WriteMemory8,
    WriteMemory16,
    WriteMemory32,
    WriteMemory64,
    WriteMemory128,
    WrappedWriteMemory8,
    WrappedWriteMemory16,
    WrappedWriteMemory32,
    WrappedWriteMemory64,
    WrappedWriteMemory128,
    ExclusiveWriteMemory8,
    ExclusiveWriteMemory16,
    ExclusiveWriteMemory32,
    ExclusiveWriteMemory64,
    ExclusiveWriteMemory128,
    CallSvc,
    ExceptionRaised,
    InstructionSynchronizationBarrierRaised,
    InstructionCacheOperationRaised,
    DataCacheOperationRaised,
    GetCntpct,
    AddTicks,
    GetTicksRemaining,
}

/// Placeholder inside a block that the linker patches to a prelude helper.
#[derive(Copy, Clone, Debug)]
pub struct Relocation {
    /// Byte offset of the patch site from the block entry.
    pub offset: usize,
    pub target: LinkTarget,
}

/// How an inter-block jump site is patched.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlockRelocationKind {
    /// A single-word direct branch. Unlinked form is a NOP, so the block falls
    /// through to the dispatcher-return path emitted right after the site.
    Branch,
    /// A two-word address materialization into scratch register x17. Unlinked
    /// form materializes the dispatcher-return helper instead.
    MoveToScratch1,
}

/// Placeholder inside a block that jumps to a peer block.
#[derive(Copy, Clone, Debug)]
pub struct BlockRelocation {
    /// Byte offset of the patch site from the block entry.
    pub offset: usize,
    pub kind: BlockRelocationKind,
}

/// Synthesized continuation installed into the interrupted register file after
/// a fastmem fault, so execution resumes as if the block had called the
/// corresponding slow-path helper.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FakeCall {
    /// Flags state the helper expects at entry.
    pub cpsr: u32,
    /// Host address of the slow-path helper to resume at.
    pub call_target: u64,
}

/// Per-site fastmem patch record, keyed by the faulting word's offset into the
/// block.
#[derive(Copy, Clone, Debug)]
pub struct FastmemPatch {
    pub fake_call: FakeCall,
    /// Emit-site identity, present when the site can be blacklisted.
    pub marker: Option<DoNotFastmemMarker>,
    /// Whether a fault here should blacklist the site and invalidate the
    /// containing block so it is re-emitted with the slow path inline.
    pub recompile: bool,
}

/// Everything the address space records about one emitted block.
#[derive(Clone, Debug, Default)]
pub struct BlockInfo {
    pub entry: HostEntry,
    /// Emitted size in bytes.
    pub size: usize,
    /// External relocations, resolved against the prelude at link time.
    pub relocations: Vec<Relocation>,
    /// Inter-block jump sites, grouped by target guest location.
    pub block_relocations: HashMap<GuestLocation, Vec<BlockRelocation>>,
    /// Fastmem patch table: in-block byte offset of each optimistic access.
    pub fastmem_patches: HashMap<usize, FastmemPatch>,
}

/// Host addresses of the trampolines emitted once at the front of the code
/// buffer, before any block. External relocations resolve by tag to a field of
/// this record; the trampolines' behavior is opaque to the address space.
#[derive(Copy, Clone, Default, Debug)]
pub struct PreludeInfo {
    pub return_to_dispatcher: u64,
    pub return_from_run_code: u64,
    pub read_memory_8: u64,
    pub read_memory_16: u64,
    pub read_memory_32: u64,
    pub read_memory_64: u64,
    pub read_memory_128: u64,
    pub wrapped_read_memory_8: u64,
    pub wrapped_read_memory_16: u64,
    pub wrapped_read_memory_32: u64,
    pub wrapped_read_memory_64: u64,
    pub wrapped_read_memory_128: u64,
    pub exclusive_read_memory_8: u64,
    pub exclusive_read_memory_16: u64,
    pub exclusive_read_memory_32: u64,
    pub exclusive_read_memory_64: u64,
    pub exclusive_read_memory_128: u64,
    pub write_memory_8: u64,
    pub write_memory_16: u64,
    pub write_memory_32: u64,
    pub write_memory_64: u64,
    pub write_memory_128: u64,
    pub wrapped_write_memory_8: u64,
    pub wrapped_write_memory_16: u64,
    pub wrapped_write_memory_32: u64,
    pub wrapped_write_memory_64: u64,
    pub wrapped_write_memory_128: u64,
    pub exclusive_write_memory_8: u64,
    pub exclusive_write_memory_16: u64,
    pub exclusive_write_memory_32: u64,
    pub exclusive_write_memory_64: u64,
    pub exclusive_write_memory_128: u64,
    pub call_svc: u64,
    pub exception_raised: u64,
    pub isb_raised: u64,
    pub ic_raised: u64,
    pub dc_raised: u64,
    pub get_cntpct: u64,
    pub add_ticks: u64,
    pub get_ticks_remaining: u64,
    /// First byte past the prelude; the cursor rewinds here on reset.
    pub end_of_prelude: HostEntry,
}

impl PreludeInfo {
    /// Resolve an external relocation tag to its helper address.
    pub fn target_address(&self, target: LinkTarget) -> u64 {
        match target {
            LinkTarget::ReturnToDispatcher => self.return_to_dispatcher,
            LinkTarget::ReturnFromRunCode => self.return_from_run_code,
            LinkTarget::ReadMemory8 => self.read_memory_8,
            LinkTarget::ReadMemory16 => self.read_memory_16,
            LinkTarget::ReadMemory32 => self.read_memory_32,
            LinkTarget::ReadMemory64 => self.read_memory_64,
            LinkTarget::ReadMemory128 => self.read_memory_128,
            LinkTarget::WrappedReadMemory8 => self.wrapped_read_memory_8,
            LinkTarget::WrappedReadMemory16 => self.wrapped_read_memory_16,
            LinkTarget::WrappedReadMemory32 => self.wrapped_read_memory_32,
            LinkTarget::WrappedReadMemory64 => self.wrapped_read_memory_64,
            LinkTarget::WrappedReadMemory128 => self.wrapped_read_memory_128,
            LinkTarget::ExclusiveReadMemory8 => self.exclusive_read_memory_8,
            LinkTarget::ExclusiveReadMemory16 => self.exclusive_read_memory_16,
            LinkTarget::ExclusiveReadMemory32 => self.exclusive_read_memory_32,
            LinkTarget::ExclusiveReadMemory64 => self.exclusive_read_memory_64,
            LinkTarget::ExclusiveReadMemory128 => self.exclusive_read_memory_128,
            LinkTarget::WriteMemory8 => self.write_memory_8,
            LinkTarget::WriteMemory16 => self.write_memory_16,
            LinkTarget::WriteMemory32 => self.write_memory_32,
            LinkTarget::WriteMemory64 => self.write_memory_64,
            LinkTarget::WriteMemory128 => self.write_memory_128,
            LinkTarget::WrappedWriteMemory8 => self.wrapped_write_memory_8,
            LinkTarget::WrappedWriteMemory16 => self.wrapped_write_memory_16,
            LinkTarget::WrappedWriteMemory32 => self.wrapped_write_memory_32,
            LinkTarget::WrappedWriteMemory64 => self.wrapped_write_memory_64,
            LinkTarget::WrappedWriteMemory128 => self.wrapped_write_memory_128,
            LinkTarget::ExclusiveWriteMemory8 => self.exclusive_write_memory_8,
            LinkTarget::ExclusiveWriteMemory16 => self.exclusive_write_memory_16,
            LinkTarget::ExclusiveWriteMemory32 => self.exclusive_write_memory_32,
            LinkTarget::ExclusiveWriteMemory64 => self.exclusive_write_memory_64,
            LinkTarget::ExclusiveWriteMemory128 => self.exclusive_write_memory_128,
            LinkTarget::CallSvc => self.call_svc,
            LinkTarget::ExceptionRaised => self.exception_raised,
            LinkTarget::InstructionSynchronizationBarrierRaised => self.isb_raised,
            LinkTarget::InstructionCacheOperationRaised => self.ic_raised,
            LinkTarget::DataCacheOperationRaised => self.dc_raised,
            LinkTarget::GetCntpct => self.get_cntpct,
            LinkTarget::AddTicks => self.add_ticks,
            LinkTarget::GetTicksRemaining => self.get_ticks_remaining,
        }
    }
}

/// The external collaborators the address space drives: the IR frontend, the
/// prelude, and the block emitter.
///
/// `emit_block` appends machine code at the buffer cursor and returns the
/// block's metadata; it queries the fastmem manager to decide per access site
/// whether to emit the optimistic form or the slow-path call.
pub trait Translator {
    /// Decode and lift one basic block of guest code.
    fn generate_ir(&mut self, location: GuestLocation) -> IrBlock;

    /// Emit the dispatcher trampolines at the very front of the buffer and
    /// record their addresses. Called exactly once, at construction.
    fn emit_prelude(&mut self, text: &mut TextBuffer) -> PreludeInfo;

    /// Lower one IR block to machine code at the buffer cursor.
    fn emit_block(
        &mut self,
        text: &mut TextBuffer,
        block: &IrBlock,
        config: &EmitConfig,
        fastmem: &mut FastmemManager,
    ) -> BlockInfo;
}
