//! Cooperative guest threading atop the single CPU-emulation core.
//!
//! The guest may create threads, but the core executes one instruction stream
//! at a time. [`ThreadManager`] keeps one [`ThreadContext`] per guest-visible
//! thread and multiplexes them onto the core by swapping register files at
//! well-defined yield points (the intercepted thread-creation and
//! synchronization APIs), never at an arbitrary instruction boundary.
//!
//! # Invariant
//!
//! Exactly one context is [`ThreadState::Running`] at any instant: the one
//! whose registers are live in the core. All others are frozen snapshots
//! owned here. Violations are core bugs and abort the session with
//! [`Error::SchedulingInvariant`](crate::Error::SchedulingInvariant).
//!
//! # Determinism
//!
//! Scheduling is strict round-robin in thread-id order, so a given guest and
//! hook set replays identically across runs. Thread ids are assigned once and
//! never reused within a session, keeping hook-observed ids stable even after
//! a thread exits.

use std::fmt;

use crate::{
    cpu::{CpuCore, GuestAddress, Register, RegisterFile},
    memory::{MemoryView, PointerWidth},
    Error, Result,
};

/// Identity of one guest-visible thread. The main thread is id 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Creates a thread id from its raw value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        ThreadId(value)
    }

    /// The raw id value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one guest thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Frozen and schedulable.
    Ready,
    /// Loaded into the core.
    Running,
    /// Finished; its id is never reused.
    Exited,
}

/// Saved execution context of one guest thread.
#[derive(Clone, Debug)]
pub struct ThreadContext {
    id: ThreadId,
    registers: RegisterFile,
    stack_base: GuestAddress,
    stack_size: u64,
    state: ThreadState,
}

impl ThreadContext {
    /// The thread's id.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// The thread's lifecycle state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// The frozen register snapshot (stale for the Running thread).
    #[must_use]
    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    /// Base of the thread's stack region.
    #[must_use]
    pub fn stack_base(&self) -> GuestAddress {
        self.stack_base
    }

    /// One-past-the-top limit of the thread's stack region.
    #[must_use]
    pub fn stack_limit(&self) -> GuestAddress {
        self.stack_base.wrapping_add(self.stack_size)
    }
}

/// Multiplexes guest threads onto the single emulation core.
#[derive(Debug)]
pub struct ThreadManager {
    contexts: Vec<ThreadContext>,
    /// Index into `contexts` of the Running (or just-exited) thread.
    current: usize,
    next_id: u32,
    next_stack_base: u64,
    stack_size: u64,
}

impl ThreadManager {
    /// Creates a manager allocating thread stacks upward from `stack_area`,
    /// `stack_size` bytes each (plus a one-page gap between stacks).
    #[must_use]
    pub fn new(stack_area: GuestAddress, stack_size: u64) -> Self {
        ThreadManager {
            contexts: Vec::new(),
            current: 0,
            next_id: 1,
            next_stack_base: stack_area.value(),
            stack_size,
        }
    }

    /// Adopts the core's current state as the main thread (id 1, Running).
    ///
    /// Must be called exactly once, before any spawn or switch. The main
    /// thread's stack is whatever the loader set up; the manager does not
    /// allocate one for it.
    pub fn init_main(&mut self, core: &dyn CpuCore) -> ThreadId {
        debug_assert!(self.contexts.is_empty(), "main thread initialized twice");
        let id = self.allocate_id();
        self.contexts.push(ThreadContext {
            id,
            registers: RegisterFile::capture(core),
            stack_base: GuestAddress::new(0),
            stack_size: 0,
            state: ThreadState::Running,
        });
        self.current = 0;
        id
    }

    /// Spawns a new guest thread.
    ///
    /// Allocates a fresh stack region through the memory view and seeds a
    /// Ready context with the program counter at `entry` and the single
    /// thread argument placed per the guest's pointer width: the first
    /// argument register on 64-bit, the first stack slot on 32-bit.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`] if the stack region cannot be mapped.
    pub fn spawn(
        &mut self,
        memory: &mut MemoryView,
        entry: GuestAddress,
        argument: u64,
    ) -> Result<ThreadId> {
        let stack_base = GuestAddress::new(self.next_stack_base);
        memory.map(stack_base, self.stack_size)?;
        // One-page gap so a runaway stack faults instead of bleeding over.
        self.next_stack_base += self.stack_size + 0x1000;

        let word = memory.width().word_size();
        let top = stack_base.wrapping_add(self.stack_size - 4 * word);

        let mut registers = RegisterFile::new();
        registers.set(Register::Rip, entry.value());
        registers.set(Register::Rsp, top.value());
        match memory.width() {
            PointerWidth::Bits64 => registers.set(Register::Rcx, argument),
            PointerWidth::Bits32 => {
                // [top] holds a null return address, [top+4] the argument.
                memory.write_word(top, 0)?;
                memory.write_word(top.wrapping_add(word), argument)?;
            }
        }

        let id = self.allocate_id();
        self.contexts.push(ThreadContext {
            id,
            registers,
            stack_base,
            stack_size: self.stack_size,
            state: ThreadState::Ready,
        });
        Ok(id)
    }

    /// Performs one cooperative context switch.
    ///
    /// Snapshots the core's registers into the outgoing context, selects the
    /// next Ready context in round-robin thread-id order, loads its registers
    /// into the core, and makes it the current thread. Called only from yield
    /// points (intercepted thread/synchronization APIs).
    ///
    /// # Errors
    ///
    /// Fails with [`Error::SchedulingInvariant`] when the Running-count
    /// invariant is broken or no Ready context exists to switch to.
    pub fn switch(&mut self, core: &mut dyn CpuCore) -> Result<ThreadId> {
        self.check_single_running()?;

        let outgoing = self.current;
        if self.contexts[outgoing].state == ThreadState::Running {
            self.contexts[outgoing].registers = RegisterFile::capture(core);
            self.contexts[outgoing].state = ThreadState::Ready;
        }

        let count = self.contexts.len();
        let incoming = (1..=count)
            .map(|step| (outgoing + step) % count)
            .find(|&index| self.contexts[index].state == ThreadState::Ready)
            .ok_or_else(|| Error::SchedulingInvariant {
                message: "switch attempted with no Ready context".to_string(),
                thread: self.contexts[outgoing].id,
            })?;

        self.contexts[incoming].state = ThreadState::Running;
        self.contexts[incoming].registers.restore(core);
        self.current = incoming;
        Ok(self.contexts[incoming].id)
    }

    /// Marks the current thread Exited and releases its stack region.
    ///
    /// A [`switch`](Self::switch) must follow to load the next Ready context;
    /// until then no context is Running and the core must not step.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::SchedulingInvariant`] if the current thread
    /// already exited.
    pub fn exit_current(&mut self, memory: &mut MemoryView) -> Result<()> {
        let context = &mut self.contexts[self.current];
        if context.state == ThreadState::Exited {
            return Err(Error::SchedulingInvariant {
                message: "current thread exited twice".to_string(),
                thread: context.id,
            });
        }
        context.state = ThreadState::Exited;
        if context.stack_size > 0 {
            memory.unmap(context.stack_base);
        }
        Ok(())
    }

    /// Id of the current thread, the identity thread-local APIs report.
    ///
    /// Before [`init_main`](Self::init_main) runs, the core's state is
    /// implicitly the not-yet-adopted main thread, so this reports id 1.
    #[must_use]
    pub fn current_id(&self) -> ThreadId {
        match self.contexts.get(self.current) {
            Some(context) => context.id,
            None => ThreadId::new(1),
        }
    }

    /// The current thread's context.
    #[must_use]
    pub fn current(&self) -> &ThreadContext {
        &self.contexts[self.current]
    }

    /// Looks a context up by id.
    #[must_use]
    pub fn get(&self, id: ThreadId) -> Option<&ThreadContext> {
        self.contexts.iter().find(|context| context.id == id)
    }

    /// All contexts, in creation order.
    #[must_use]
    pub fn contexts(&self) -> &[ThreadContext] {
        &self.contexts
    }

    /// Number of contexts that can still be scheduled.
    #[must_use]
    pub fn runnable_count(&self) -> usize {
        self.contexts
            .iter()
            .filter(|context| context.state != ThreadState::Exited)
            .count()
    }

    fn allocate_id(&mut self) -> ThreadId {
        let id = ThreadId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn check_single_running(&self) -> Result<()> {
        let running = self
            .contexts
            .iter()
            .filter(|context| context.state == ThreadState::Running)
            .count();
        // Zero is legal transiently, right after exit_current.
        if running > 1 {
            return Err(Error::SchedulingInvariant {
                message: format!("{running} contexts Running at once"),
                thread: self.contexts[self.current].id,
            });
        }
        Ok(())
    }
}
