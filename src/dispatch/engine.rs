//! The dispatch engine: runs hook chains and sequences the guest's return.

use std::cell::{Cell, RefCell};

use crate::{
    abi::{self, CallingConvention, ParamSpec, StackCleanup},
    cpu::{CpuCore, GuestAddress, Register},
    dispatch::{
        hook::{CallFn, CallOutcome, EnterFn, ExitFn, HookFlow, HookStage},
        table::InterceptionTable,
    },
    session::{Session, TraceEvent},
    symbols::{SymbolName, SymbolTable},
    Error, Result,
};

/// What one [`DispatchEngine::intercept`] invocation did.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum DispatchOutcome {
    /// No chain is registered at the address; the core should execute it
    /// natively.
    NotHooked,
    /// The chain ran and the guest was sequenced back to its return address.
    Completed {
        /// The value written to the return register.
        return_value: u64,
    },
    /// A hook set the guest program counter itself; no return sequencing was
    /// performed.
    Redirected,
    /// The chain ran to completion and a stop was requested; the driver
    /// should step the core no further.
    Stopped,
}

/// Runs hook chains when the guest program counter reaches a registered
/// address.
///
/// The engine is reentrant: a hook may drive nested emulation that reaches
/// another intercepted address and re-enter [`intercept`](Self::intercept)
/// through a shared handle. Per-dispatch state (stage, params, return value)
/// lives on the host call stack; the engine itself only tracks the nesting
/// depth and the active address chain, bounded by the configured limit.
pub struct DispatchEngine {
    table: RefCell<InterceptionTable>,
    depth: Cell<usize>,
    active: RefCell<Vec<GuestAddress>>,
    depth_limit: usize,
}

impl DispatchEngine {
    /// Creates an engine bounded at `depth_limit` nested dispatches.
    #[must_use]
    pub fn new(depth_limit: usize) -> Self {
        DispatchEngine {
            table: RefCell::new(InterceptionTable::new()),
            depth: Cell::new(0),
            active: RefCell::new(Vec::new()),
            depth_limit,
        }
    }

    /// Declares the parameter spec for intercepts at `address`.
    pub fn declare(&self, address: GuestAddress, spec: ParamSpec) {
        self.table.borrow_mut().declare(address, spec);
    }

    /// Resolves `symbol` and declares its spec; see
    /// [`InterceptionTable::declare_symbol`].
    ///
    /// # Errors
    ///
    /// Fails with [`Error::UnresolvedSymbol`] if no loaded image exports the
    /// name.
    pub fn declare_symbol(
        &self,
        symbols: &SymbolTable,
        symbol: &SymbolName,
        spec: ParamSpec,
    ) -> Result<GuestAddress> {
        self.table.borrow_mut().declare_symbol(symbols, symbol, spec)
    }

    /// Overrides the calling convention for `address`.
    pub fn override_convention(&self, address: GuestAddress, convention: CallingConvention) {
        self.table.borrow_mut().override_convention(address, convention);
    }

    /// Installs the Enter hook at `address`.
    pub fn set_enter(&self, address: GuestAddress, hook: EnterFn) {
        self.table.borrow_mut().set_enter(address, hook);
    }

    /// Installs the Call hook at `address`.
    pub fn set_call(&self, address: GuestAddress, hook: CallFn) {
        self.table.borrow_mut().set_call(address, hook);
    }

    /// Appends an Exit hook at `address`.
    pub fn push_exit(&self, address: GuestAddress, hook: ExitFn) {
        self.table.borrow_mut().push_exit(address, hook);
    }

    /// Removes every hook at `address`.
    pub fn clear(&self, address: GuestAddress) {
        self.table.borrow_mut().clear(address);
    }

    /// Returns `true` if any chain is registered at `address`.
    #[must_use]
    pub fn is_hooked(&self, address: GuestAddress) -> bool {
        self.table.borrow().is_hooked(address)
    }

    /// Current dispatch nesting depth; zero outside any dispatch.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Runs the chain registered at `address`, if any.
    ///
    /// Stage order is fixed: Enter, then Call (or the default behavior,
    /// returning zero), then every Exit hook in registration order. Mutated
    /// parameters are committed back to their original slots, and unless a
    /// hook redirected the guest program counter the engine performs the
    /// convention-correct return: return value into the return register,
    /// return address popped into the program counter, stack adjusted per the
    /// cleanup side.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ReentrancyDepthExceeded`] when nesting passes the
    /// configured limit, or with whatever a hook callback reports. Both are
    /// fatal to the session.
    pub fn intercept(
        &self,
        core: &mut dyn CpuCore,
        session: &mut Session,
        address: GuestAddress,
    ) -> Result<DispatchOutcome> {
        let Some(chain) = self.table.borrow().snapshot(address) else {
            return Ok(DispatchOutcome::NotHooked);
        };
        let _guard = self.enter_dispatch(address)?;

        session.trace(TraceEvent::DispatchEnter {
            address,
            thread: session.current_thread_id(),
        });

        let convention = chain
            .convention
            .unwrap_or(session.config().default_convention);
        let (mut params, faults) = abi::resolve(core, session.memory(), convention, &chain.spec);
        for fault in faults {
            session.trace(TraceEvent::DecodeFault {
                message: fault.to_string(),
            });
        }

        let mut redirected = false;
        let mut skip_rest = false;
        let mut value = 0u64;

        if let Some(enter) = &chain.enter {
            session.trace(TraceEvent::HookInvoked {
                address,
                stage: HookStage::Enter,
            });
            let mut call = super::ApiCall {
                core: &mut *core,
                session: &mut *session,
                address,
                stage: HookStage::Enter,
                params: &mut params,
            };
            match enter(&mut call)? {
                HookFlow::Continue => {}
                HookFlow::SkipRest => skip_rest = true,
                HookFlow::Redirected => redirected = true,
            }
        }

        if !skip_rest && !redirected {
            if let Some(call_hook) = &chain.call {
                session.trace(TraceEvent::HookInvoked {
                    address,
                    stage: HookStage::Call,
                });
                let mut call = super::ApiCall {
                    core: &mut *core,
                    session: &mut *session,
                    address,
                    stage: HookStage::Call,
                    params: &mut params,
                };
                match call_hook(&mut call)? {
                    CallOutcome::Return(produced) => value = produced,
                    CallOutcome::Redirected => redirected = true,
                }
            }
        }

        if !skip_rest && !redirected {
            for exit in &chain.exits {
                session.trace(TraceEvent::HookInvoked {
                    address,
                    stage: HookStage::Exit,
                });
                let mut call = super::ApiCall {
                    core: &mut *core,
                    session: &mut *session,
                    address,
                    stage: HookStage::Exit,
                    params: &mut params,
                };
                match exit(&mut call, &mut value)? {
                    HookFlow::Continue => {}
                    HookFlow::SkipRest => break,
                    HookFlow::Redirected => {
                        redirected = true;
                        break;
                    }
                }
            }
        }

        // A mutation pointing into unmapped memory is a recovered fault, the
        // same class as a failed decode on the way in.
        if let Err(fault) = abi::commit(core, session.memory_mut(), &params) {
            session.trace(TraceEvent::DecodeFault {
                message: fault.to_string(),
            });
        }

        if !redirected {
            self.sequence_return(core, session, address, convention, params.stack_words(), value)?;
        }

        if session.stop_requested() {
            return Ok(DispatchOutcome::Stopped);
        }
        if redirected {
            return Ok(DispatchOutcome::Redirected);
        }
        Ok(DispatchOutcome::Completed {
            return_value: value,
        })
    }

    /// Convention-correct return: value to the return register, return
    /// address popped into the program counter, stack cleaned per the
    /// convention's responsible side.
    fn sequence_return(
        &self,
        core: &mut dyn CpuCore,
        session: &mut Session,
        address: GuestAddress,
        convention: CallingConvention,
        stack_words: u64,
        value: u64,
    ) -> Result<()> {
        let width = session.memory().width();
        let word = width.word_size();
        let stack_pointer = width.truncate(core.read_register(Register::Rsp));
        let return_address = session
            .memory()
            .read_word(GuestAddress::new(stack_pointer))?;

        core.write_register(convention.return_register(), value);
        let mut popped = stack_pointer.wrapping_add(word);
        if convention.cleanup() == StackCleanup::Callee {
            popped = popped.wrapping_add(stack_words * word);
        }
        core.write_register(Register::Rsp, width.truncate(popped));
        core.write_register(Register::Rip, return_address);

        session.trace(TraceEvent::DispatchReturn { address, value });
        Ok(())
    }

    fn enter_dispatch(&self, address: GuestAddress) -> Result<DepthGuard<'_>> {
        if self.depth.get() >= self.depth_limit {
            let mut chain = self.active.borrow().clone();
            chain.push(address);
            return Err(Error::ReentrancyDepthExceeded { chain });
        }
        self.depth.set(self.depth.get() + 1);
        self.active.borrow_mut().push(address);
        Ok(DepthGuard { engine: self })
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("depth", &self.depth.get())
            .field("depth_limit", &self.depth_limit)
            .finish()
    }
}

/// Unwinds the depth bookkeeping however a dispatch ends.
struct DepthGuard<'a> {
    engine: &'a DispatchEngine,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.engine.depth.set(self.engine.depth.get() - 1);
        self.engine.active.borrow_mut().pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abi::{ParamKind, ParamValue},
        session::SessionConfig,
        test::FakeCore,
        thread::ThreadId,
    };
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    const TARGET: GuestAddress = GuestAddress::new(0x7700_1000);
    const RETURN_TO: u64 = 0x0040_1234;

    /// A 32-bit frame: return address at esp, `args` above it.
    fn frame(session: &mut Session, core: &mut FakeCore, args: &[u32]) {
        session
            .memory_mut()
            .map(GuestAddress::new(0x6000), 0x1000)
            .unwrap();
        let sp = 0x6800u64;
        core.write_register(Register::Rsp, sp);
        session
            .memory_mut()
            .write_u32(GuestAddress::new(sp), RETURN_TO as u32)
            .unwrap();
        for (index, arg) in args.iter().enumerate() {
            session
                .memory_mut()
                .write_u32(GuestAddress::new(sp + 4 + 4 * index as u64), *arg)
                .unwrap();
        }
    }

    #[test]
    fn test_unhooked_address_passes_through() {
        let engine = DispatchEngine::new(8);
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        let outcome = engine.intercept(&mut core, &mut session, TARGET).unwrap();
        assert_eq!(outcome, DispatchOutcome::NotHooked);
    }

    #[test]
    fn test_enter_call_exit_order_and_values() {
        let engine = DispatchEngine::new(8);
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        frame(&mut session, &mut core, &[0x6100]);
        session
            .memory_mut()
            .write_bytes(GuestAddress::new(0x6100), b"abc\0")
            .unwrap();

        engine.declare(TARGET, ParamSpec::new().with("str", ParamKind::Str));
        engine.override_convention(TARGET, CallingConvention::Cdecl);

        let log = Rc::new(RefCell::new(Vec::new()));

        let seen = Rc::clone(&log);
        engine.set_enter(
            TARGET,
            Arc::new(move |call| {
                let text = call.params.get("str").unwrap().as_str().unwrap().to_string();
                seen.borrow_mut().push(format!("enter:{text}"));
                Ok(HookFlow::Continue)
            }),
        );

        let seen = Rc::clone(&log);
        engine.set_call(
            TARGET,
            Arc::new(move |call| {
                let len = call.params.get("str").unwrap().as_str().unwrap().len();
                seen.borrow_mut().push("call".to_string());
                Ok(CallOutcome::Return(len as u64))
            }),
        );

        let seen = Rc::clone(&log);
        engine.push_exit(
            TARGET,
            Arc::new(move |_, value| {
                seen.borrow_mut().push(format!("exit:{value}"));
                Ok(HookFlow::Continue)
            }),
        );

        let outcome = engine.intercept(&mut core, &mut session, TARGET).unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { return_value: 3 });
        assert_eq!(
            *log.borrow(),
            vec!["enter:abc".to_string(), "call".to_string(), "exit:3".to_string()]
        );

        // Cdecl return sequencing: eax holds the value, only the return
        // address is popped, control lands back at the call site.
        assert_eq!(core.read_register(Register::Rax), 3);
        assert_eq!(core.read_register(Register::Rsp), 0x6804);
        assert_eq!(core.read_register(Register::Rip), RETURN_TO);
    }

    #[test]
    fn test_stdcall_callee_cleanup_pops_arguments() {
        let engine = DispatchEngine::new(8);
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        frame(&mut session, &mut core, &[10, 20]);

        engine.declare(
            TARGET,
            ParamSpec::new().with("a", ParamKind::U32).with("b", ParamKind::U32),
        );
        engine.set_call(TARGET, Arc::new(|_| Ok(CallOutcome::Return(0))));

        engine.intercept(&mut core, &mut session, TARGET).unwrap();
        // Return address plus two argument words.
        assert_eq!(core.read_register(Register::Rsp), 0x680C);
    }

    #[test]
    fn test_default_call_returns_zero() {
        let engine = DispatchEngine::new(8);
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        frame(&mut session, &mut core, &[]);

        engine.declare(TARGET, ParamSpec::new());
        let outcome = engine.intercept(&mut core, &mut session, TARGET).unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { return_value: 0 });
        assert_eq!(core.read_register(Register::Rax), 0);
    }

    #[test]
    fn test_exit_hooks_chain_mutations_in_order() {
        let engine = DispatchEngine::new(8);
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        frame(&mut session, &mut core, &[]);

        engine.declare(TARGET, ParamSpec::new());
        engine.set_call(TARGET, Arc::new(|_| Ok(CallOutcome::Return(1))));
        engine.push_exit(
            TARGET,
            Arc::new(|_, value| {
                *value *= 10;
                Ok(HookFlow::Continue)
            }),
        );
        engine.push_exit(
            TARGET,
            Arc::new(|_, value| {
                *value += 7;
                Ok(HookFlow::Continue)
            }),
        );

        let outcome = engine.intercept(&mut core, &mut session, TARGET).unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { return_value: 17 });
    }

    #[test]
    fn test_enter_mutation_is_committed() {
        let engine = DispatchEngine::new(8);
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        frame(&mut session, &mut core, &[41]);

        engine.declare(TARGET, ParamSpec::new().with("n", ParamKind::U32));
        engine.set_enter(
            TARGET,
            Arc::new(|call| {
                call.params.set("n", ParamValue::U32(99));
                Ok(HookFlow::Continue)
            }),
        );

        engine.intercept(&mut core, &mut session, TARGET).unwrap();
        let slot = session
            .memory()
            .read_u32(GuestAddress::new(0x6804))
            .unwrap();
        assert_eq!(slot, 99);
    }

    #[test]
    fn test_dispatch_before_thread_init_completes() {
        // A session whose main thread was never adopted still dispatches;
        // thread-identity queries report the implicit main thread.
        let engine = DispatchEngine::new(8);
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        frame(&mut session, &mut core, &[]);

        engine.declare(TARGET, ParamSpec::new());
        engine.set_call(
            TARGET,
            Arc::new(|call| Ok(CallOutcome::Return(u64::from(call.thread_id().value())))),
        );

        let outcome = engine.intercept(&mut core, &mut session, TARGET).unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { return_value: 1 });
        assert_eq!(core.read_register(Register::Rip), RETURN_TO);
    }

    #[test]
    fn test_hook_failure_carries_dispatch_state() {
        let engine = DispatchEngine::new(8);
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        session.init_main_thread(&core);
        frame(&mut session, &mut core, &[]);

        engine.declare(TARGET, ParamSpec::new());
        engine.set_call(TARGET, Arc::new(|call| Err(call.fail("device unavailable"))));

        let err = engine.intercept(&mut core, &mut session, TARGET).unwrap_err();
        match err {
            Error::Hook {
                address,
                stage,
                thread,
                ..
            } => {
                assert_eq!(address, TARGET);
                assert_eq!(stage, HookStage::Call);
                assert_eq!(thread, ThreadId::new(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_redirect_suppresses_return_sequencing() {
        let engine = DispatchEngine::new(8);
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        frame(&mut session, &mut core, &[]);

        engine.declare(TARGET, ParamSpec::new());
        engine.set_call(
            TARGET,
            Arc::new(|call| {
                call.core.write_register(Register::Rip, 0xDEAD_0000);
                Ok(CallOutcome::Redirected)
            }),
        );

        let outcome = engine.intercept(&mut core, &mut session, TARGET).unwrap();
        assert_eq!(outcome, DispatchOutcome::Redirected);
        assert_eq!(core.read_register(Register::Rip), 0xDEAD_0000);
        assert_eq!(core.read_register(Register::Rsp), 0x6800);
    }

    #[test]
    fn test_stop_requested_by_hook_is_observed_after_chain() {
        let engine = DispatchEngine::new(8);
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        frame(&mut session, &mut core, &[]);

        engine.declare(TARGET, ParamSpec::new());
        engine.set_call(TARGET, Arc::new(|_| Ok(CallOutcome::Return(5))));
        engine.push_exit(
            TARGET,
            Arc::new(|call, _| {
                call.session.request_stop();
                Ok(HookFlow::Continue)
            }),
        );

        let outcome = engine.intercept(&mut core, &mut session, TARGET).unwrap();
        assert_eq!(outcome, DispatchOutcome::Stopped);
        // The chain still completed: the return was sequenced first.
        assert_eq!(core.read_register(Register::Rax), 5);
        assert_eq!(core.read_register(Register::Rip), RETURN_TO);
    }

    #[test]
    fn test_reentrancy_depth_limit() {
        let engine = Arc::new(DispatchEngine::new(2));
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        frame(&mut session, &mut core, &[]);

        engine.declare(TARGET, ParamSpec::new());
        let nested = Arc::clone(&engine);
        engine.set_call(
            TARGET,
            Arc::new(move |call| {
                nested.intercept(&mut *call.core, call.session, TARGET)?;
                Ok(CallOutcome::Return(0))
            }),
        );

        let err = engine.intercept(&mut core, &mut session, TARGET).unwrap_err();
        match err {
            Error::ReentrancyDepthExceeded { chain } => {
                assert_eq!(chain, vec![TARGET, TARGET, TARGET]);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The guards unwound with the failure.
        assert_eq!(engine.depth(), 0);
    }

    #[test]
    fn test_nested_dispatch_within_limit() {
        let engine = Arc::new(DispatchEngine::new(8));
        let mut session = Session::new(SessionConfig::win32());
        let mut core = FakeCore::new();
        frame(&mut session, &mut core, &[]);

        let inner = GuestAddress::new(0x7700_2000);
        engine.declare(TARGET, ParamSpec::new());
        engine.declare(inner, ParamSpec::new());
        engine.set_call(inner, Arc::new(|_| Ok(CallOutcome::Return(21))));

        let nested = Arc::clone(&engine);
        engine.set_call(
            TARGET,
            Arc::new(move |call| {
                // Fake a nested frame the same way a real hook would push one.
                let sp = call.core.read_register(Register::Rsp) - 4;
                call.session
                    .memory_mut()
                    .write_u32(GuestAddress::new(sp), RETURN_TO as u32)?;
                call.core.write_register(Register::Rsp, sp);
                match nested.intercept(&mut *call.core, call.session, inner)? {
                    DispatchOutcome::Completed { return_value } => {
                        Ok(CallOutcome::Return(return_value * 2))
                    }
                    other => panic!("unexpected nested outcome: {other:?}"),
                }
            }),
        );

        let outcome = engine.intercept(&mut core, &mut session, TARGET).unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed { return_value: 42 });
    }
}
