//! Guest-side types consumed from the IR layer.
//!
//! The decoder and IR passes live outside this crate; the address space only
//! needs to identify decode contexts ([`GuestLocation`]), walk a block's
//! control-flow terminal ([`Terminal`]) to discover direct successors, and carry
//! the handful of per-block facts the backend consumes ([`IrBlock`]).

use std::fmt;

/// Identifies a unique guest decode context.
///
/// The payload packs the guest program counter together with the mode bits that
/// affect decoding (instruction set, relevant flag state, FPU rounding mode).
/// The packing is owned by the frontend; this crate treats the value as opaque:
/// equality is bit-equality, and the total order exists only so locations can
/// key ordered containers.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestLocation(u64);

impl GuestLocation {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for GuestLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuestLocation({:#018x})", self.0)
    }
}

/// Guest condition code attached to conditional terminals.
///
/// Carried through for the emitter; the compile driver does not interpret it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Cond {
    EQ,
    NE,
    CS,
    CC,
    MI,
    PL,
    VS,
    VC,
    HI,
    LS,
    GE,
    LT,
    GT,
    LE,
    AL,
    NV,
}

/// Control-flow terminal of an IR block.
///
/// A closed sum: the compile driver matches exhaustively, and an [`Invalid`]
/// terminal reaching the driver is a frontend bug, not a runtime condition.
///
/// [`Invalid`]: Terminal::Invalid
#[derive(Clone, Debug)]
pub enum Terminal {
    /// Placeholder produced by a failed IR pass. Must never reach emission.
    Invalid,
    /// Return to the dispatcher to look up the next block at runtime.
    ReturnToDispatch,
    /// Jump directly to the block at `next`, linked in place once both blocks
    /// exist.
    LinkBlock { next: GuestLocation },
    /// As [`LinkBlock`], but without a cycle-count check on the fast path.
    ///
    /// [`LinkBlock`]: Terminal::LinkBlock
    LinkBlockFast { next: GuestLocation },
    /// Pop a prediction from the return stack buffer and jump to it.
    PopRsbHint,
    /// Look up the next block through the fast dispatch table.
    FastDispatchHint,
    /// Conditional split on a guest condition code.
    If {
        cond: Cond,
        then_branch: Box<Terminal>,
        else_branch: Box<Terminal>,
    },
    /// Conditional split on the check bit of the JIT state.
    CheckBit {
        then_branch: Box<Terminal>,
        else_branch: Box<Terminal>,
    },
    /// Return to the dispatcher if the halt flag is set, otherwise continue
    /// with `else_branch`.
    CheckHalt { else_branch: Box<Terminal> },
}

/// A block of guest IR, as handed to the backend.
///
/// The instruction list itself stays inside the emitter; the address space
/// consumes only the location, the terminal, and the cycle count.
#[derive(Clone, Debug)]
pub struct IrBlock {
    pub location: GuestLocation,
    pub cycle_count: u64,
    pub terminal: Terminal,
}

impl IrBlock {
    pub fn new(location: GuestLocation, cycle_count: u64, terminal: Terminal) -> Self {
        Self {
            location,
            cycle_count,
            terminal,
        }
    }

    pub fn location(&self) -> GuestLocation {
        self.location
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }
}
