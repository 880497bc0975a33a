//! The address space: block index, linker, compile driver, and invalidator.
//!
//! # Architecture
//!
//! Guest code is translated one basic block at a time into a fixed-size
//! executable buffer. Four indexes track the result:
//!
//! - **Forward**: guest location to host entry, the lookup the dispatcher hits.
//! - **Reverse**: host entry to guest location, ordered, so a host program
//!   counter can be resolved back to its containing block by predecessor query.
//! - **Info**: per-entry block metadata (size, relocations, fastmem patches).
//! - **Backrefs**: guest location to the set of host entries that branch to it.
//!
//! Blocks never point at each other directly. A block stores relocations
//! against *guest locations*; the linker resolves them to host entries when
//! both sides exist, and the backrefs adjacency is the only back-pointer. That
//! asymmetry is what keeps invalidation O(inbound edges): the forward map is a
//! cache that can drop an entry while backrefs, info, and the emitted bytes
//! stay behind until the next whole-cache reset.
//!
//! # Reentrancy
//!
//! The address space is single-threaded, but the fastmem fault handler can
//! re-enter it on the same thread while a translated block is still executing.
//! Invalidation therefore unlinks a block's inbound branches before erasing
//! its forward entry, so the in-flight block finishes through a
//! dispatcher-bound path instead of chasing a dangling target.

use super::assembler::{Assembler, SCRATCH1};
use super::emit::{
    BlockInfo, BlockRelocation, BlockRelocationKind, FakeCall, HostEntry, LinkTarget, PreludeInfo,
    Translator,
};
use super::fastmem::FastmemManager;
use super::signal;
use super::text::TextBuffer;
use crate::ir::{GuestLocation, IrBlock, Terminal};
use crate::runtime::{EmitConfig, OptimizationFlags};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// Upper bound on the code buffer size.
pub const MAX_CODE_CACHE_SIZE: usize = 128 * 1024 * 1024;

pub struct AddressSpace {
    translator: Box<dyn Translator>,
    config: EmitConfig,
    text: TextBuffer,
    prelude: PreludeInfo,
    fastmem: FastmemManager,

    /// Forward map: guest location to installed host entry.
    block_entries: HashMap<GuestLocation, HostEntry>,
    /// Reverse map in ascending entry order, for predecessor queries.
    reverse_block_entries: BTreeMap<HostEntry, GuestLocation>,
    /// Per-entry block metadata.
    block_infos: HashMap<HostEntry, BlockInfo>,
    /// Every installed block with at least one relocation against the keyed
    /// guest location, whether or not that location is currently installed.
    block_references: HashMap<GuestLocation, HashSet<HostEntry>>,
}

impl AddressSpace {
    /// Map the code buffer, emit the prelude, and register the buffer with
    /// the host fault handler.
    ///
    /// The returned box must stay boxed: the fault registry holds its address
    /// for same-thread reentry from the signal handler.
    pub fn new(
        translator: Box<dyn Translator>,
        config: EmitConfig,
        code_cache_size: usize,
    ) -> Result<Box<Self>> {
        if code_cache_size > MAX_CODE_CACHE_SIZE {
            return Err(Error::Configuration(format!(
                "code_cache_size of {} bytes exceeds the {} byte maximum",
                code_cache_size, MAX_CODE_CACHE_SIZE
            )));
        }

        let mut translator = translator;
        let mut text = TextBuffer::new(code_cache_size)?;

        let prelude = translator.emit_prelude(&mut text);
        debug_assert_eq!(prelude.end_of_prelude, text.cursor());
        text.invalidate(
            HostEntry::from_address(text.start()),
            text.cursor().address() - text.start(),
        );
        text.protect();

        let mut space = Box::new(Self {
            translator,
            config,
            text,
            prelude,
            fastmem: FastmemManager::new(),
            block_entries: HashMap::new(),
            reverse_block_entries: BTreeMap::new(),
            block_infos: HashMap::new(),
            block_references: HashMap::new(),
        });

        let (start, end) = (space.text.start(), space.text.end());
        let space_ptr: *mut AddressSpace = &mut *space;
        signal::register_code_region(space_ptr, start, end);

        debug!(
            "address space ready: {} byte code cache, prelude ends at {:?}",
            code_cache_size, space.prelude.end_of_prelude
        );

        Ok(space)
    }

    /// Host entry for a guest location, if the block is installed.
    pub fn get(&self, descriptor: GuestLocation) -> Option<HostEntry> {
        self.block_entries.get(&descriptor).copied()
    }

    /// Entry of the last block starting at or before `host_pc`.
    ///
    /// Containment is not checked; callers that need it must verify
    /// `host_pc - entry < info.size` themselves.
    pub fn reverse_get_entry_point(&self, host_pc: u64) -> Option<HostEntry> {
        let key = HostEntry::from_address(host_pc as usize);
        self.reverse_block_entries
            .range(..=key)
            .next_back()
            .map(|(entry, _)| *entry)
    }

    /// Guest location of the last block starting at or before `host_pc`.
    pub fn reverse_get_location(&self, host_pc: u64) -> Option<GuestLocation> {
        let key = HostEntry::from_address(host_pc as usize);
        self.reverse_block_entries
            .range(..=key)
            .next_back()
            .map(|(_, location)| *location)
    }

    /// Look up a block, compiling it first if needed. Resets the whole cache
    /// beforehand when the buffer is nearly full.
    pub fn get_or_emit(&mut self, descriptor: GuestLocation) -> HostEntry {
        if let Some(entry) = self.get(descriptor) {
            return entry;
        }

        if self.is_nearly_full() {
            debug!("code cache nearly full, evicting everything");
            self.clear_cache();
        }

        self.compile(descriptor)
    }

    /// Unlink and remove the named guest blocks.
    ///
    /// Only the forward entries are erased. The reverse map, block infos, and
    /// backrefs keep their records (and the emitted bytes stay in the buffer,
    /// unreachable) until the next whole-cache reset; purging them here would
    /// break reentry from the fault handler.
    pub fn invalidate_basic_blocks(&mut self, descriptors: &[GuestLocation]) {
        self.text.unprotect();

        for &descriptor in descriptors {
            if !self.block_entries.contains_key(&descriptor) {
                continue;
            }

            // Unlink before removal: this can run from inside the fastmem
            // callback while the block is executing, and the block may hold
            // references to itself that must fall back to the dispatcher.
            // No logging anywhere in this function for the same reason.
            self.relink_for_descriptor(descriptor, None);

            self.block_entries.remove(&descriptor);
        }

        self.text.protect();
    }

    /// Drop every translated block and rewind the cursor to the end of the
    /// prelude. The fastmem blacklist is retained.
    pub fn clear_cache(&mut self) {
        debug!(
            "clearing block cache: {} installed blocks, {} bytes of code",
            self.block_entries.len(),
            self.text.cursor().address() - self.prelude.end_of_prelude.address()
        );

        self.block_entries.clear();
        self.reverse_block_entries.clear();
        self.block_infos.clear();
        self.block_references.clear();
        self.text.rewind_to(self.prelude.end_of_prelude);
    }

    pub fn remaining_size(&self) -> usize {
        self.text.remaining()
    }

    pub fn is_nearly_full(&self) -> bool {
        self.text.is_nearly_full()
    }

    pub fn prelude(&self) -> &PreludeInfo {
        &self.prelude
    }

    /// Resolve a fault inside the code buffer to the continuation that takes
    /// the faulting access down its slow path.
    ///
    /// Runs in signal context: reads the indexes, may write the fastmem
    /// blacklist and invalidate the faulting block, and never logs.
    pub fn fastmem_callback(&mut self, host_pc: u64) -> FakeCall {
        let Some(entry) = self.reverse_get_entry_point(host_pc) else {
            unknown_fault_site(host_pc);
        };

        let patch = {
            let Some(block_info) = self.block_infos.get(&entry) else {
                unknown_fault_site(host_pc);
            };
            match block_info
                .fastmem_patches
                .get(&(host_pc as usize - entry.address()))
            {
                Some(patch) => *patch,
                None => unknown_fault_site(host_pc),
            }
        };

        if patch.recompile {
            let marker = patch
                .marker
                .expect("recompiling fastmem patch carries no marker");
            self.fastmem.mark_do_not_fastmem(marker);
            self.invalidate_basic_blocks(&[marker.location]);
        }

        patch.fake_call
    }

    fn compile(&mut self, descriptor: GuestLocation) -> HostEntry {
        let starting = self.text.cursor();
        self.text.unprotect();

        let mut next = VecDeque::new();
        let result = self.compile_one(descriptor, &mut next);

        if self
            .config
            .has_optimization(OptimizationFlags::MULTI_BLOCK_COMPILATION)
        {
            while !next.is_empty() && !self.is_nearly_full() {
                let pending = next.pop_front().unwrap();
                if self.get(pending).is_none() {
                    self.compile_one(pending, &mut next);
                }
            }
        }

        self.text
            .invalidate(starting, self.text.cursor().address() - starting.address());
        self.text.protect();

        result
    }

    fn compile_one(
        &mut self,
        descriptor: GuestLocation,
        next: &mut VecDeque<GuestLocation>,
    ) -> HostEntry {
        let ir_block = self.translator.generate_ir(descriptor);
        append_successors(next, ir_block.terminal());
        self.emit(ir_block)
    }

    /// Emit one block at the cursor, install it into the indexes, and link it
    /// both ways.
    fn emit(&mut self, ir_block: IrBlock) -> HostEntry {
        let block_info =
            self.translator
                .emit_block(&mut self.text, &ir_block, &self.config, &mut self.fastmem);
        let location = ir_block.location();
        let entry = block_info.entry;

        trace!(
            "guest block {:?} emitted at {:?}, {} bytes",
            location, entry, block_info.size
        );

        assert!(
            self.block_entries.insert(location, entry).is_none(),
            "duplicate block installed for {:?}",
            location
        );
        assert!(
            self.reverse_block_entries.insert(entry, location).is_none(),
            "duplicate reverse entry installed at {:?}",
            entry
        );
        assert!(
            self.block_infos.insert(entry, block_info.clone()).is_none(),
            "duplicate block info installed at {:?}",
            entry
        );

        self.link(&block_info);
        self.relink_for_descriptor(location, Some(entry));

        entry
    }

    /// Patch a freshly emitted block's relocations: external helpers resolve
    /// against the prelude, inter-block sites against the forward map (or the
    /// unlinked form when the target is not installed yet).
    ///
    /// The caller holds the buffer writable and flushes the instruction cache
    /// over the batch afterwards.
    fn link(&mut self, block_info: &BlockInfo) {
        for relocation in &block_info.relocations {
            let target = self.prelude.target_address(relocation.target);
            let mut asm =
                unsafe { Assembler::new(block_info.entry.at_offset(relocation.offset)) };
            match relocation.target {
                // Tail positions: the block is done, control does not return.
                LinkTarget::ReturnToDispatcher | LinkTarget::ReturnFromRunCode => {
                    asm.emit_b(target)
                }
                _ => asm.emit_bl(target),
            }
        }

        for (target_location, sites) in &block_info.block_relocations {
            self.block_references
                .entry(*target_location)
                .or_default()
                .insert(block_info.entry);
            let target = self.block_entries.get(target_location).copied();
            link_block_links(
                block_info.entry,
                target,
                sites,
                self.prelude.return_to_dispatcher,
            );
        }
    }

    /// Repoint every installed block that references `target_location` at
    /// `target` (a fresh entry, or the unlinked form on `None`).
    fn relink_for_descriptor(&mut self, target_location: GuestLocation, target: Option<HostEntry>) {
        let Some(referrers) = self.block_references.get(&target_location) else {
            return;
        };

        for &referrer in referrers {
            let Some(block_info) = self.block_infos.get(&referrer) else {
                continue;
            };

            if let Some(sites) = block_info.block_relocations.get(&target_location) {
                link_block_links(referrer, target, sites, self.prelude.return_to_dispatcher);
            }

            self.text.invalidate(referrer, block_info.size);
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        signal::unregister_code_region(self as *const AddressSpace);
    }
}

/// Patch one block's jump sites against a single target.
fn link_block_links(
    entry: HostEntry,
    target: Option<HostEntry>,
    sites: &[BlockRelocation],
    return_to_dispatcher: u64,
) {
    for site in sites {
        let mut asm = unsafe { Assembler::new(entry.at_offset(site.offset)) };
        match site.kind {
            BlockRelocationKind::Branch => match target {
                Some(target) => asm.emit_b(target.as_u64()),
                // Fall through to the dispatcher-return path emitted directly
                // after the site.
                None => asm.emit_nop(),
            },
            BlockRelocationKind::MoveToScratch1 => {
                let address = target.map(HostEntry::as_u64).unwrap_or(return_to_dispatcher);
                asm.emit_adrl(SCRATCH1, address);
            }
        }
    }
}

/// Collect the direct successors of a block terminal for multi-block
/// compilation.
fn append_successors(next: &mut VecDeque<GuestLocation>, terminal: &Terminal) {
    match terminal {
        Terminal::Invalid => panic!("invalid terminal reached the compile driver"),
        Terminal::ReturnToDispatch | Terminal::PopRsbHint | Terminal::FastDispatchHint => {}
        Terminal::LinkBlock { next: successor } | Terminal::LinkBlockFast { next: successor } => {
            next.push_back(*successor)
        }
        Terminal::If {
            then_branch,
            else_branch,
            ..
        } => {
            append_successors(next, then_branch);
            append_successors(next, else_branch);
        }
        Terminal::CheckBit {
            then_branch,
            else_branch,
        } => {
            append_successors(next, then_branch);
            append_successors(next, else_branch);
        }
        Terminal::CheckHalt { else_branch } => append_successors(next, else_branch),
    }
}

fn unknown_fault_site(host_pc: u64) -> ! {
    // Signal context: write the diagnostic straight to stderr and abort.
    eprintln!("braid: segfault within JITted code at host_pc = {:016x}", host_pc);
    eprintln!("braid: fault is not at a fastmem patch location");
    std::process::abort();
}
