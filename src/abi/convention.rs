//! Calling convention table.
//!
//! Each convention fixes three things the dispatch engine needs: where the
//! ordered argument slots come from (registers first, then stack), who pops
//! the stack arguments after the call, and which register carries the return
//! value. Slot sequencing is exposed through [`SlotCursor`] so the resolver
//! and the variadic protocol share one definition of "the next slot".

use crate::{
    cpu::{GuestAddress, Register},
    memory::PointerWidth,
};

/// Who removes the stack arguments once the call returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackCleanup {
    /// The caller pops its own arguments (cdecl, Microsoft x64).
    Caller,
    /// The callee pops the arguments before returning (stdcall, fastcall).
    Callee,
}

/// The calling conventions the runtime marshals for.
///
/// Selected at hook registration time, or overridden per call site through
/// the interception table's override map. The convention is immutable once a
/// dispatch begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CallingConvention {
    /// All arguments on the stack, caller cleans up.
    Cdecl,
    /// All arguments on the stack, callee cleans up. The Win32 API default.
    Stdcall,
    /// First two arguments in `ecx`/`edx`, rest on the stack, callee cleans.
    Fastcall,
    /// Microsoft x64: `rcx`, `rdx`, `r8`, `r9`, then stack past the 32-byte
    /// shadow area; caller cleans up.
    Ms64,
}

impl CallingConvention {
    /// Ordered register sequence consumed before any stack slot.
    #[must_use]
    pub fn arg_registers(self) -> &'static [Register] {
        match self {
            CallingConvention::Cdecl | CallingConvention::Stdcall => &[],
            CallingConvention::Fastcall => &[Register::Rcx, Register::Rdx],
            CallingConvention::Ms64 => {
                &[Register::Rcx, Register::Rdx, Register::R8, Register::R9]
            }
        }
    }

    /// Stack cleanup responsibility.
    #[must_use]
    pub fn cleanup(self) -> StackCleanup {
        match self {
            CallingConvention::Cdecl | CallingConvention::Ms64 => StackCleanup::Caller,
            CallingConvention::Stdcall | CallingConvention::Fastcall => StackCleanup::Callee,
        }
    }

    /// Register holding the integer return value.
    #[must_use]
    pub fn return_register(self) -> Register {
        Register::Rax
    }

    /// Stack words reserved by the caller between the return address and the
    /// first stack argument (the Microsoft x64 shadow area).
    #[must_use]
    pub fn shadow_words(self) -> u64 {
        match self {
            CallingConvention::Ms64 => 4,
            _ => 0,
        }
    }
}

/// Where one argument lives at the moment of interception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgSlot {
    /// The argument occupies a register.
    Register(Register),
    /// The argument occupies the stack word at this absolute guest address.
    Stack(GuestAddress),
}

/// Walks a convention's argument slots in order.
///
/// At interception time the stack pointer still points at the return address,
/// so the first stack slot sits one word above it, past any shadow area. The
/// cursor is `Copy` so the variadic protocol can freeze it and replay slots
/// by explicit index later without mutating the original.
#[derive(Clone, Copy, Debug)]
pub struct SlotCursor {
    convention: CallingConvention,
    word: u64,
    stack_pointer: GuestAddress,
    next_register: usize,
    next_stack: u64,
}

impl SlotCursor {
    /// Creates a cursor at the first argument slot.
    ///
    /// `stack_pointer` is the guest stack pointer at interception, i.e. it
    /// addresses the return address pushed by the call instruction.
    #[must_use]
    pub fn new(
        convention: CallingConvention,
        width: PointerWidth,
        stack_pointer: GuestAddress,
    ) -> Self {
        SlotCursor {
            convention,
            word: width.word_size(),
            stack_pointer,
            next_register: 0,
            next_stack: 0,
        }
    }

    /// Returns the next slot and advances the cursor.
    pub fn advance(&mut self) -> ArgSlot {
        let registers = self.convention.arg_registers();
        if self.next_register < registers.len() {
            let slot = ArgSlot::Register(registers[self.next_register]);
            self.next_register += 1;
            slot
        } else {
            let slot = self.stack_slot(self.next_stack);
            self.next_stack += 1;
            slot
        }
    }

    /// Returns the slot `index` positions ahead without advancing.
    #[must_use]
    pub fn peek(&self, index: u64) -> ArgSlot {
        let registers = self.convention.arg_registers();
        let remaining_regs = registers.len() as u64 - self.next_register as u64;
        if index < remaining_regs {
            ArgSlot::Register(registers[self.next_register + index as usize])
        } else {
            self.stack_slot(self.next_stack + (index - remaining_regs))
        }
    }

    /// Number of stack words the cursor has consumed so far.
    #[must_use]
    pub fn stack_words(&self) -> u64 {
        self.next_stack
    }

    fn stack_slot(&self, stack_index: u64) -> ArgSlot {
        let offset = self.word * (1 + self.convention.shadow_words() + stack_index);
        ArgSlot::Stack(self.stack_pointer.wrapping_add(offset))
    }
}
