//! Session configuration surface.
//!
//! Plain data consumed at session construction: calling-convention defaults,
//! optional-behavior flags, thread stack layout and the scheduling policy
//! selector. None of this is consulted per dispatch; the session bakes it
//! into the relevant components up front.

use crate::{abi::CallingConvention, cpu::GuestAddress, memory::PointerWidth};

/// Guest thread scheduling policy.
///
/// Only round-robin is implemented; the selector exists so the configuration
/// surface is stable if another deterministic policy is added.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Deterministic round-robin in thread-id order.
    #[default]
    RoundRobin,
}

/// Configuration for one emulation session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Guest pointer width; fixed for the session.
    pub pointer_width: PointerWidth,

    /// Convention assumed for hook registrations that do not declare one.
    pub default_convention: CallingConvention,

    /// Maximum nested dispatch depth before the session aborts.
    pub reentrancy_limit: usize,

    /// Bound for NUL-terminator scans, in bytes or wide code units.
    pub scan_window: usize,

    /// Accept persisted cache entries whose fingerprint no longer matches
    /// the file on disk.
    pub trust_stale_cache: bool,

    /// Guest thread scheduling policy.
    pub scheduling: SchedulingPolicy,

    /// Stack bytes allocated per spawned guest thread.
    pub thread_stack_size: u64,

    /// Base of the address range thread stacks are carved from.
    pub thread_stack_area: GuestAddress,
}

impl SessionConfig {
    /// Defaults for a 32-bit Windows guest: stdcall, 64 KiB thread stacks.
    #[must_use]
    pub fn win32() -> Self {
        SessionConfig {
            pointer_width: PointerWidth::Bits32,
            default_convention: CallingConvention::Stdcall,
            reentrancy_limit: 64,
            scan_window: crate::memory::DEFAULT_SCAN_WINDOW,
            trust_stale_cache: false,
            scheduling: SchedulingPolicy::RoundRobin,
            thread_stack_size: 0x10000,
            thread_stack_area: GuestAddress::new(0x0200_0000),
        }
    }

    /// Defaults for a 64-bit Windows guest: the Microsoft x64 convention.
    #[must_use]
    pub fn win64() -> Self {
        SessionConfig {
            pointer_width: PointerWidth::Bits64,
            default_convention: CallingConvention::Ms64,
            thread_stack_area: GuestAddress::new(0x7FF0_0000_0000),
            ..SessionConfig::win32()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::win32()
    }
}
