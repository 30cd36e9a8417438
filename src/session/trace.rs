//! Observability channel for dispatch activity and recovered faults.
//!
//! Non-fatal conditions (decode faults, cache corruption) and interesting
//! checkpoints (dispatches, hook invocations, context switches) are reported
//! as [`TraceEvent`]s to a pluggable [`TraceSink`]. Execution always
//! continues after recording; fatal errors travel through
//! [`Error`](crate::Error) instead.

use std::path::PathBuf;

use crate::{cpu::GuestAddress, dispatch::HookStage, thread::ThreadId};

/// One observable moment in the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    /// The dispatch engine began handling an intercepted address.
    DispatchEnter {
        /// The intercepted address.
        address: GuestAddress,
        /// The guest thread the call arrived on.
        thread: ThreadId,
    },

    /// A dispatch finished and control returns to the guest.
    DispatchReturn {
        /// The intercepted address.
        address: GuestAddress,
        /// The return value written to the guest.
        value: u64,
    },

    /// A hook callback ran.
    HookInvoked {
        /// The intercepted address owning the chain.
        address: GuestAddress,
        /// The stage that ran.
        stage: HookStage,
    },

    /// The thread manager swapped contexts.
    ContextSwitch {
        /// Outgoing thread.
        from: ThreadId,
        /// Incoming thread.
        to: ThreadId,
    },

    /// A decode fault was recovered with a best-effort value.
    DecodeFault {
        /// Description of the fault.
        message: String,
    },

    /// A cache lookup was answered from the store.
    CacheHit {
        /// Image path that hit.
        path: PathBuf,
    },

    /// A cache lookup missed (including invalidated or corrupt entries).
    CacheMiss {
        /// Image path that missed.
        path: PathBuf,
    },

    /// A missed entry was rebuilt from the container parser and stored.
    CacheRebuilt {
        /// Image path that was rebuilt.
        path: PathBuf,
    },

    /// A hook requested the session stop at the next safe point.
    StopRequested,
}

/// Receiver for trace events.
///
/// The default is [`BufferSink`]; a driver program can substitute anything
/// that forwards events to its own logging without the runtime knowing.
pub trait TraceSink {
    /// Records one event. Must not fail; drop events if space runs out.
    fn record(&mut self, event: TraceEvent);
}

/// Bounded in-memory sink; the default.
///
/// Keeps the first `capacity` events and silently drops the rest, so a
/// runaway guest cannot balloon the host.
#[derive(Debug)]
pub struct BufferSink {
    events: Vec<TraceEvent>,
    capacity: usize,
}

impl BufferSink {
    /// Creates a sink bounded at `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        BufferSink {
            events: Vec::new(),
            capacity,
        }
    }

    /// Recorded events, oldest first.
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Drains and returns the recorded events.
    pub fn take(&mut self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Default for BufferSink {
    fn default() -> Self {
        BufferSink::new(65_536)
    }
}

impl TraceSink for BufferSink {
    fn record(&mut self, event: TraceEvent) {
        if self.events.len() < self.capacity {
            self.events.push(event);
        }
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn record(&mut self, _event: TraceEvent) {}
}
