//! # wintercept Prelude
//!
//! Convenient single import for the types a driver program or hook module
//! touches most. `use wintercept::prelude::*;` brings in the session, the
//! dispatch engine, the marshalling types and the core boundary traits.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all runtime operations
pub use crate::Error;

/// The result type used throughout the runtime
pub use crate::Result;

// ================================================================================================
// Session
// ================================================================================================

/// Shared state of one emulation run
pub use crate::session::Session;

/// Session construction parameters and per-guest presets
pub use crate::session::{SchedulingPolicy, SessionConfig};

/// Observability channel
pub use crate::session::{BufferSink, NullSink, TraceEvent, TraceSink};

// ================================================================================================
// Dispatch
// ================================================================================================

/// The dispatch engine and what one intercept did
pub use crate::dispatch::{DispatchEngine, DispatchOutcome};

/// Hook callback surface
pub use crate::dispatch::{ApiCall, CallOutcome, HookFlow, HookStage};

/// Hook callback type aliases
pub use crate::dispatch::{CallFn, EnterFn, ExitFn};

/// Address-keyed hook registration
pub use crate::dispatch::InterceptionTable;

// ================================================================================================
// Marshalling
// ================================================================================================

/// Calling conventions and their slot sequences
pub use crate::abi::{CallingConvention, StackCleanup};

/// Parameter declaration and the resolved, mutable view
pub use crate::abi::{ParamKind, ParamSpec, ParamValue, ResolvedParams};

/// On-demand trailing-argument resolution
pub use crate::abi::VariadicCursor;

// ================================================================================================
// Core Boundary and Memory
// ================================================================================================

/// The capability consumed from the CPU-emulation core
pub use crate::cpu::{CpuCore, GuestAddress, Register, RegisterFile};

/// Typed guest memory access
pub use crate::memory::{MemoryView, PointerWidth};

// ================================================================================================
// Symbols and Cache
// ================================================================================================

/// Symbol naming and load-time resolution
pub use crate::symbols::{ImageExports, SymbolName, SymbolTable};

/// The pluggable export cache and its implementations
pub use crate::cache::{CacheEntry, DiskCache, Fingerprint, MemoryCache, NullCache, SymbolCache};

// ================================================================================================
// Threads
// ================================================================================================

/// Cooperative guest thread scheduling
pub use crate::thread::{ThreadContext, ThreadId, ThreadManager, ThreadState};
