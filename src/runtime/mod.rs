//! Runtime backend for dynamic binary translation.
//!
//! This module hosts the per-host-architecture backends. Braid's core is the
//! AArch64 address space: a block-based translation cache in which guest code is
//! compiled one basic block at a time, cached in a fixed-size executable buffer,
//! and linked block-to-block so steady-state execution never leaves emitted
//! code.
//!
//! Only an AArch64 backend exists; the emitter contract this crate drives is
//! host-specific by design.

pub mod arm64;

use std::ops::BitOr;

/// Optimization toggles honored by the compile driver and the emitter.
///
/// A small closed set, so this is a plain bitmask rather than a growable
/// registry.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct OptimizationFlags(u32);

impl OptimizationFlags {
    pub const NONE: Self = Self(0);

    /// Speculatively compile the successors of a block within the same
    /// `compile` call, so straight-line guest code is emitted contiguously and
    /// linked without dispatcher round-trips.
    pub const MULTI_BLOCK_COMPILATION: Self = Self(1 << 0);

    pub fn contains(self, flags: Self) -> bool {
        self.0 & flags.0 == flags.0
    }
}

impl BitOr for OptimizationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Configuration handed to the emitter and consulted by the compile driver.
#[derive(Copy, Clone, Default, Debug)]
pub struct EmitConfig {
    pub optimizations: OptimizationFlags,
}

impl EmitConfig {
    pub fn has_optimization(&self, flags: OptimizationFlags) -> bool {
        self.optimizations.contains(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimization_flags_contains() {
        let flags = OptimizationFlags::MULTI_BLOCK_COMPILATION;
        assert!(flags.contains(OptimizationFlags::MULTI_BLOCK_COMPILATION));
        assert!(flags.contains(OptimizationFlags::NONE));
        assert!(!OptimizationFlags::NONE.contains(flags));
    }

    #[test]
    fn emit_config_defaults_to_no_optimizations() {
        let config = EmitConfig::default();
        assert!(!config.has_optimization(OptimizationFlags::MULTI_BLOCK_COMPILATION));
    }
}
