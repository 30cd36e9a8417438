//! Boundary types for the external CPU-emulation core.
//!
//! The instruction-level engine (fetch/decode/execute) is an external
//! collaborator; this module defines the narrow surface the dispatch runtime
//! consumes from it:
//!
//! - [`GuestAddress`]: an opaque position in the guest's flat address space
//! - [`Register`]: the registers the marshalling layer reads and writes
//! - [`RegisterFile`]: a frozen snapshot of all modeled registers
//! - [`CpuCore`]: the trait through which the runtime drives the core
//!
//! The runtime never decodes instructions itself. Everything it does happens
//! either before the core runs (loading, hook registration) or at the moments
//! the core reports reaching an intercepted address.

use std::fmt;

/// An address in the guest's flat address space.
///
/// `GuestAddress` is an opaque integer with a total ordering. Arithmetic is
/// only available through explicit helpers so that wraparound at the address
/// width boundary is visible at the call site rather than happening silently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestAddress(u64);

impl GuestAddress {
    /// Creates a guest address from a raw integer.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        GuestAddress(value)
    }

    /// Returns the raw integer value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Adds `offset`, wrapping explicitly at the 64-bit boundary.
    #[must_use]
    pub const fn wrapping_add(self, offset: u64) -> Self {
        GuestAddress(self.0.wrapping_add(offset))
    }

    /// Adds `offset`, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(GuestAddress)
    }

    /// Subtracts `offset`, wrapping explicitly at the 64-bit boundary.
    #[must_use]
    pub const fn wrapping_sub(self, offset: u64) -> Self {
        GuestAddress(self.0.wrapping_sub(offset))
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for GuestAddress {
    fn from(value: u64) -> Self {
        GuestAddress(value)
    }
}

/// The guest registers the dispatch layer touches.
///
/// Names follow the 64-bit forms; under a 32-bit guest the low half is the
/// architectural register and the core is expected to zero-extend on read.
/// Only the registers relevant to argument passing, stack accounting and
/// control flow are modeled; the core owns everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Register {
    /// Accumulator; integer return values.
    Rax,
    /// Base register.
    Rbx,
    /// First fastcall/Microsoft x64 argument register.
    Rcx,
    /// Second fastcall/Microsoft x64 argument register.
    Rdx,
    /// Source index.
    Rsi,
    /// Destination index.
    Rdi,
    /// Stack pointer.
    Rsp,
    /// Frame pointer.
    Rbp,
    /// Third Microsoft x64 argument register.
    R8,
    /// Fourth Microsoft x64 argument register.
    R9,
    /// Instruction pointer.
    Rip,
}

impl Register {
    /// Every modeled register, in `RegisterFile` storage order.
    pub const ALL: [Register; 11] = [
        Register::Rax,
        Register::Rbx,
        Register::Rcx,
        Register::Rdx,
        Register::Rsi,
        Register::Rdi,
        Register::Rsp,
        Register::Rbp,
        Register::R8,
        Register::R9,
        Register::Rip,
    ];

    fn index(self) -> usize {
        match self {
            Register::Rax => 0,
            Register::Rbx => 1,
            Register::Rcx => 2,
            Register::Rdx => 3,
            Register::Rsi => 4,
            Register::Rdi => 5,
            Register::Rsp => 6,
            Register::Rbp => 7,
            Register::R8 => 8,
            Register::R9 => 9,
            Register::Rip => 10,
        }
    }
}

/// A frozen snapshot of all modeled registers.
///
/// The thread manager stores one `RegisterFile` per suspended thread and swaps
/// it into the core on a context switch. The core's live register file always
/// corresponds to exactly one such snapshot's owner; all other snapshots are
/// frozen in memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterFile {
    values: [u64; 11],
}

impl RegisterFile {
    /// Creates a zeroed register file.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of `reg`.
    #[must_use]
    pub fn get(&self, reg: Register) -> u64 {
        self.values[reg.index()]
    }

    /// Sets `reg` to `value`.
    pub fn set(&mut self, reg: Register, value: u64) {
        self.values[reg.index()] = value;
    }

    /// Captures the core's current registers into a new snapshot.
    #[must_use]
    pub fn capture(core: &dyn CpuCore) -> Self {
        let mut file = RegisterFile::new();
        for reg in Register::ALL {
            file.set(reg, core.read_register(reg));
        }
        file
    }

    /// Loads this snapshot into the core, overwriting its live registers.
    pub fn restore(&self, core: &mut dyn CpuCore) {
        for reg in Register::ALL {
            core.write_register(reg, self.get(reg));
        }
    }
}

/// The capability the dispatch runtime consumes from the CPU-emulation core.
///
/// Implementations wrap whatever engine actually executes guest instructions.
/// The runtime uses only three operations: register access in both directions
/// and "run until this predicate says stop". The driver program wires the
/// core's intercepted-address callback to
/// [`DispatchEngine::intercept`](crate::dispatch::DispatchEngine::intercept).
pub trait CpuCore {
    /// Reads a live register. 32-bit guests report zero-extended values.
    fn read_register(&self, reg: Register) -> u64;

    /// Writes a live register.
    fn write_register(&mut self, reg: Register, value: u64);

    /// Steps the guest until `stop` returns `true` for the program counter,
    /// the guest faults, or the guest exits. Returns the address at which
    /// execution stopped.
    fn step_until(&mut self, stop: &mut dyn FnMut(GuestAddress) -> bool) -> GuestAddress;
}
