//! Shared fixtures for integration tests.

use wintercept::prelude::*;

/// A register-file-backed [`CpuCore`] that never executes instructions.
#[derive(Debug, Default)]
pub struct FakeCore {
    registers: RegisterFile,
}

impl FakeCore {
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

/// Maps a stack region and lays out a 32-bit call frame: return address at
/// esp, `args` above it. Returns the stack pointer.
pub fn push_frame32(
    session: &mut Session,
    core: &mut FakeCore,
    return_to: u32,
    args: &[u32],
) -> u64 {
    session
        .memory_mut()
        .map(GuestAddress::new(0x6000), 0x1000)
        .unwrap();
    let sp = 0x6800u64;
    core.write_register(Register::Rsp, sp);
    session
        .memory_mut()
        .write_u32(GuestAddress::new(sp), return_to)
        .unwrap();
    for (index, arg) in args.iter().enumerate() {
        session
            .memory_mut()
            .write_u32(GuestAddress::new(sp + 4 + 4 * index as u64), *arg)
            .unwrap();
    }
    sp
}
