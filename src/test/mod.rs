//! Shared fixtures for unit tests.

use crate::cpu::{CpuCore, GuestAddress, Register, RegisterFile};

/// A register-file-backed [`CpuCore`] that never executes instructions.
///
/// `step_until` pretends the guest immediately reached the current program
/// counter; tests drive dispatch by arranging registers and memory directly.
#[derive(Debug, Default)]
pub struct FakeCore {
    registers: RegisterFile,
}

impl FakeCore {
    /// Creates a core with all registers zeroed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CpuCore for FakeCore {
    fn read_register(&self, reg: Register) -> u64 {
        self.registers.get(reg)
    }

    fn write_register(&mut self, reg: Register, value: u64) {
        self.registers.set(reg, value);
    }

    fn step_until(&mut self, _stop: &mut dyn FnMut(GuestAddress) -> bool) -> GuestAddress {
        GuestAddress::new(self.registers.get(Register::Rip))
    }
}
