//! API interception: hook chains, the registration table and the dispatch
//! engine.
//!
//! Interception is keyed by [`GuestAddress`](crate::cpu::GuestAddress). A
//! chain owns at most one Enter hook, at most one Call hook and any number of
//! Exit hooks; the [`DispatchEngine`] runs them in that fixed order whenever
//! the CPU-emulation core reports that the guest program counter reached a
//! registered address, then sequences the guest back to its caller with the
//! produced return value.
//!
//! Hooks receive an [`ApiCall`] context scoped to the invocation. Through it
//! they can read and rewrite [`ResolvedParams`](crate::abi::ResolvedParams),
//! reach the session, drive nested emulation, or redirect the guest program
//! counter outright.

mod engine;
mod hook;
mod table;

pub use engine::{DispatchEngine, DispatchOutcome};
pub use hook::{ApiCall, CallFn, CallOutcome, EnterFn, ExitFn, HookFlow, HookStage};
pub use table::InterceptionTable;
