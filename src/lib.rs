//! Braid - the address space and block cache core of a dynamic binary translator.
//!
//! Braid owns the executable code buffer of a JIT that translates guest CPU
//! instructions into host AArch64 machine code. It maps guest instruction-stream
//! locations to emitted host code, links translated blocks directly to one another
//! to avoid dispatcher round-trips, unlinks and relinks blocks when guest code is
//! invalidated or the cache is cleared, and recovers from host memory faults
//! raised inside JITted code by optimistic "fastmem" accesses.
//!
//! The guest decoder, the IR passes, and the block emitter are external
//! collaborators reached through the [`Translator`] seam; Braid drives them and
//! owns everything around them: the code buffer and its write/execute permission
//! state, the block indexes, the inter-block link graph, and the host fault
//! handler.
//!
//! # Modules
//!
//! - [`runtime`] - The AArch64 backend: code buffer, linker, compile driver,
//!   fault handling
//! - [`ir`] - The guest-location and block-terminal types consumed from the IR
//!   layer
//!
//! # Error Handling
//!
//! Recoverable construction-time failures use the consolidated [`Error`] type.
//! Violations of internal design invariants (duplicate block installs, unknown
//! relocation tags, faults at unknown sites) are bugs, not runtime conditions,
//! and abort with a diagnostic.
//!
//! [`Translator`]: runtime::arm64::Translator

pub mod ir;
pub mod runtime;

/// Consolidated error type for all Braid operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("memory mapping error: {0}")]
    MemoryMapping(String),
}

pub type Result<T> = core::result::Result<T, Error>;

pub use ir::{GuestLocation, IrBlock, Terminal};

pub use runtime::arm64::{AddressSpace, BlockInfo, FakeCall, PreludeInfo, Translator};
pub use runtime::{EmitConfig, OptimizationFlags};
