//! Hook callback types and the per-dispatch context they receive.

use std::sync::Arc;

use crate::{
    abi::ResolvedParams,
    cpu::{CpuCore, GuestAddress},
    session::Session,
    thread::ThreadId,
    Error, Result,
};

/// Stage of the dispatch chain a hook is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum HookStage {
    /// Before the API behavior runs; params resolved, no return value yet.
    Enter,
    /// Replaces the API behavior entirely and produces the return value.
    Call,
    /// After the behavior; observes and may rewrite the return value.
    Exit,
}

/// What an Enter or Exit hook asks the engine to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookFlow {
    /// Run the remaining stages normally.
    Continue,
    /// Skip the remaining hooks; return sequencing still runs.
    SkipRest,
    /// The hook set the guest program counter itself; skip the remaining
    /// hooks and suppress return sequencing.
    Redirected,
}

/// What a Call hook produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    /// The API's return value; sequenced into the guest on completion.
    Return(u64),
    /// The hook set the guest program counter itself; suppress return
    /// sequencing.
    Redirected,
}

/// Everything a hook can reach during one dispatch.
///
/// Borrows are scoped to the callback invocation; state that must survive a
/// dispatch lives in the [`Session`]. Reborrowing `core` and `session` out of
/// this context is how a hook drives nested emulation (stepping the core,
/// re-entering the engine).
pub struct ApiCall<'a> {
    /// The CPU-emulation core the intercepted call arrived on.
    pub core: &'a mut dyn CpuCore,
    /// Shared session state: memory, threads, symbols, cache, stop signal.
    pub session: &'a mut Session,
    /// The intercepted address that owns this chain.
    pub address: GuestAddress,
    /// The stage currently executing.
    pub stage: HookStage,
    /// Decoded arguments; mutations are committed before resumption.
    pub params: &'a mut ResolvedParams,
}

impl ApiCall<'_> {
    /// Id of the guest thread the call arrived on.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.session.current_thread_id()
    }

    /// Builds the fatal [`Error::Hook`] for this call, capturing the
    /// intercepted address, the executing stage and the guest thread.
    #[must_use]
    pub fn fail(&self, message: impl Into<String>) -> Error {
        Error::Hook {
            address: self.address,
            stage: self.stage,
            thread: self.thread_id(),
            message: message.into(),
        }
    }
}

/// Enter-stage callback.
pub type EnterFn = Arc<dyn Fn(&mut ApiCall<'_>) -> Result<HookFlow>>;

/// Call-stage callback; replaces the API behavior.
pub type CallFn = Arc<dyn Fn(&mut ApiCall<'_>) -> Result<CallOutcome>>;

/// Exit-stage callback; receives the return value produced so far.
pub type ExitFn = Arc<dyn Fn(&mut ApiCall<'_>, &mut u64) -> Result<HookFlow>>;
